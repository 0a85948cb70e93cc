//! Stream framing for the TLS-over-SOCKS subnegotiation
//! (draft-ietf-aft-socks-ssl-00).
//!
//! Every chunk written is prefixed with a four byte header:
//!
//! ```plain
//! +-----+---------+--------+
//! | VER | COMMAND | LENGTH |
//! +-----+---------+--------+
//! |  1  |    1    |   2    |
//! +-----+---------+--------+
//! ```
//!
//! The TLS engine runs on top of a [`FramingStream`], so its records travel
//! inside frames. The command tag moves from `InitialHandshake` through
//! `OptionNegotiation` to `DataFlow` and stays there; the stream is never
//! unwrapped.

use bytes::{Buf, BufMut, BytesMut};
use futures::ready;
use pin_project_lite::pin_project;
use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::codec::{Decoder, Encoder};

pub const SUBNEGOTIATION_VERSION: u8 = 0x01;
pub const FRAME_HEADER_LEN: usize = 4;
pub const MAX_FRAME_PAYLOAD: usize = i16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TlsCommand {
    InitialHandshake = 0x01,
    OptionNegotiation = 0x02,
    DataFlow = 0x03,
    ClosingHandshake = 0x04,
}

impl TlsCommand {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(TlsCommand::InitialHandshake),
            0x02 => Some(TlsCommand::OptionNegotiation),
            0x03 => Some(TlsCommand::DataFlow),
            0x04 => Some(TlsCommand::ClosingHandshake),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub command: u8,
    pub len: u16,
}

impl FrameHeader {
    pub fn command(&self) -> Option<TlsCommand> {
        TlsCommand::from_byte(self.command)
    }
}

#[derive(Debug)]
pub struct Frame<'a> {
    pub version: u8,
    pub command: TlsCommand,
    pub payload: &'a [u8],
}

/// Decodes frame headers and encodes whole frames.
#[derive(Debug, Default)]
pub struct SubnegotiationCodec(());

impl SubnegotiationCodec {
    pub fn new() -> Self {
        Self(())
    }
}

impl Decoder for SubnegotiationCodec {
    type Item = FrameHeader;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FrameHeader>, io::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let version = src.get_u8();
        let command = src.get_u8();
        let len = src.get_u16();

        Ok(Some(FrameHeader {
            version,
            command,
            len,
        }))
    }
}

impl<'a> Encoder<Frame<'a>> for SubnegotiationCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame<'a>, dst: &mut BytesMut) -> Result<(), io::Error> {
        if frame.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame payload exceeds 32767 bytes",
            ));
        }

        dst.reserve(FRAME_HEADER_LEN + frame.payload.len());
        dst.put_u8(frame.version);
        dst.put_u8(frame.command as u8);
        dst.put_u16(frame.payload.len() as u16);
        dst.put_slice(frame.payload);
        Ok(())
    }
}

/// Shared handle on the command tag stamped on outgoing frames.
///
/// The TLS engine owns the [`FramingStream`] once the handshake starts, so the
/// authentication method keeps one of these to move the tag along.
#[derive(Debug, Clone)]
pub struct CommandHandle(Arc<AtomicU8>);

impl CommandHandle {
    fn new(command: TlsCommand) -> Self {
        CommandHandle(Arc::new(AtomicU8::new(command as u8)))
    }

    pub fn get(&self) -> TlsCommand {
        TlsCommand::from_byte(self.0.load(Ordering::Acquire)).unwrap_or(TlsCommand::DataFlow)
    }

    pub fn set(&self, command: TlsCommand) {
        tracing::trace!(?command, "subnegotiation command");
        self.0.store(command as u8, Ordering::Release);
    }
}

pin_project! {
    pub struct FramingStream<S> {
        #[pin]
        inner: S,

        codec: SubnegotiationCodec,
        version: u8,
        command: CommandHandle,

        // partially read header
        header: BytesMut,
        // payload bytes left in the current inbound frame
        pending: usize,

        write_buf: BytesMut,

        close_sent: bool,
        peer_closed: bool,
        // inner shutdown owed after the peer closed
        closing: bool,
    }
}

impl<S> FramingStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_version(inner, SUBNEGOTIATION_VERSION)
    }

    pub fn with_version(inner: S, version: u8) -> Self {
        FramingStream {
            inner,
            codec: SubnegotiationCodec::new(),
            version,
            command: CommandHandle::new(TlsCommand::InitialHandshake),
            header: BytesMut::with_capacity(FRAME_HEADER_LEN),
            pending: 0,
            write_buf: BytesMut::new(),
            close_sent: false,
            peer_closed: false,
            closing: false,
        }
    }

    pub fn command_handle(&self) -> CommandHandle {
        self.command.clone()
    }

    pub fn command(&self) -> TlsCommand {
        self.command.get()
    }

    pub fn set_command(&self, command: TlsCommand) {
        self.command.set(command)
    }

    /// Version stamped on outgoing frames. Follows the peer once a frame
    /// has been read.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Whether the peer sent a closing handshake.
    pub fn is_closed(&self) -> bool {
        self.peer_closed
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

fn poll_drain<S: AsyncWrite>(
    mut inner: Pin<&mut S>,
    buf: &mut BytesMut,
    cx: &mut Context<'_>,
) -> Poll<io::Result<()>> {
    while !buf.is_empty() {
        let n = ready!(inner.as_mut().poll_write(cx, &buf[..]))?;
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
        buf.advance(n);
    }
    Poll::Ready(Ok(()))
}

/// Pushes out what is buffered and shuts the inner stream down. Errors are
/// only traced, the stream is going away either way.
fn poll_close_inner<S: AsyncWrite>(
    mut inner: Pin<&mut S>,
    buf: &mut BytesMut,
    cx: &mut Context<'_>,
) -> Poll<()> {
    if let Err(err) = ready!(poll_drain(inner.as_mut(), buf, cx)) {
        tracing::trace!(%err, "closing handshake not delivered");
        buf.clear();
    }
    if let Err(err) = ready!(inner.poll_shutdown(cx)) {
        tracing::trace!(%err, "inner shutdown failed");
    }
    Poll::Ready(())
}

impl<S: AsyncRead + AsyncWrite> AsyncRead for FramingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();

        if *this.peer_closed {
            return Poll::Ready(Err(closed_error()));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        while *this.pending == 0 {
            if let Some(header) = this.codec.decode(this.header)? {
                *this.version = header.version;
                if header.command() == Some(TlsCommand::ClosingHandshake) {
                    tracing::trace!("peer sent closing handshake");
                    *this.peer_closed = true;
                    if !*this.close_sent {
                        *this.close_sent = true;
                        let frame = Frame {
                            version: *this.version,
                            command: TlsCommand::ClosingHandshake,
                            payload: &[],
                        };
                        this.codec.encode(frame, this.write_buf)?;
                    }
                    *this.closing = true;
                    if poll_close_inner(this.inner.as_mut(), this.write_buf, cx).is_ready() {
                        *this.closing = false;
                    }
                    return Poll::Ready(Err(closed_error()));
                }
                *this.pending = header.len as usize;
                continue;
            }

            let mut raw = [0u8; FRAME_HEADER_LEN];
            let missing = FRAME_HEADER_LEN - this.header.len();
            let mut header_buf = ReadBuf::new(&mut raw[..missing]);
            ready!(this.inner.as_mut().poll_read(cx, &mut header_buf))?;

            let filled = header_buf.filled();
            if filled.is_empty() {
                // eof between frames is a clean end of stream
                return if this.header.is_empty() {
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()))
                };
            }
            this.header.extend_from_slice(filled);
        }

        let max = buf.remaining().min(*this.pending);
        let n = {
            let mut chunk = ReadBuf::new(buf.initialize_unfilled_to(max));
            ready!(this.inner.poll_read(cx, &mut chunk))?;
            chunk.filled().len()
        };
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
        }

        buf.advance(n);
        *this.pending -= n;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite> AsyncWrite for FramingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();

        if *this.close_sent {
            if *this.closing {
                ready!(poll_close_inner(this.inner.as_mut(), this.write_buf, cx));
                *this.closing = false;
            }
            return Poll::Ready(Err(closed_error()));
        }

        ready!(poll_drain(this.inner.as_mut(), this.write_buf, cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_FRAME_PAYLOAD);
        let frame = Frame {
            version: *this.version,
            command: this.command.get(),
            payload: &buf[..n],
        };
        this.codec.encode(frame, this.write_buf)?;

        // push eagerly; leftovers go out on the next write or flush
        if let Poll::Ready(Err(err)) = poll_drain(this.inner.as_mut(), this.write_buf, cx) {
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        if *this.closing {
            ready!(poll_close_inner(this.inner.as_mut(), this.write_buf, cx));
            *this.closing = false;
            return Poll::Ready(Ok(()));
        }
        ready!(poll_drain(this.inner.as_mut(), this.write_buf, cx))?;
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();

        if !*this.close_sent {
            *this.close_sent = true;
            let frame = Frame {
                version: *this.version,
                command: TlsCommand::ClosingHandshake,
                payload: &[],
            };
            this.codec.encode(frame, this.write_buf)?;
        }

        if *this.closing {
            ready!(poll_close_inner(this.inner.as_mut(), this.write_buf, cx));
            *this.closing = false;
            return Poll::Ready(Ok(()));
        }

        if !this.write_buf.is_empty() {
            if let Err(err) = ready!(poll_drain(this.inner.as_mut(), this.write_buf, cx)) {
                tracing::trace!(%err, "closing handshake not delivered");
                this.write_buf.clear();
            }
        }

        this.inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn large_writes_are_split_into_frames() {
        let (a, mut b) = tokio::io::duplex(128 * 1024);
        let mut framing = FramingStream::new(a);
        framing.set_command(TlsCommand::DataFlow);

        let payload: Vec<u8> = (0..40_000u32).map(|i| i as u8).collect();
        framing.write_all(&payload).await.unwrap();
        framing.flush().await.unwrap();

        let mut header = [0u8; 4];
        b.read_exact(&mut header).await.unwrap();
        assert_eq!(header, [0x01, 0x03, 0x7f, 0xff]);
        let mut first = vec![0u8; MAX_FRAME_PAYLOAD];
        b.read_exact(&mut first).await.unwrap();

        b.read_exact(&mut header).await.unwrap();
        let rest_len = payload.len() - MAX_FRAME_PAYLOAD;
        assert_eq!(header, [0x01, 0x03, (rest_len >> 8) as u8, rest_len as u8]);
        let mut rest = vec![0u8; rest_len];
        b.read_exact(&mut rest).await.unwrap();

        first.extend_from_slice(&rest);
        assert_eq!(first, payload);
    }

    #[tokio::test]
    async fn reads_span_frames() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut framing = FramingStream::new(a);

        b.write_all(b"\x01\x03\x00\x06hello \x01\x03\x00\x05world")
            .await
            .unwrap();

        // a single read never crosses a frame boundary
        let mut buf = [0u8; 64];
        let n = framing.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello ");

        let mut buf = [0u8; 5];
        framing.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(b);
        let n = framing.read(&mut [0u8; 8]).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn command_tag_follows_handle() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut framing = FramingStream::new(a);
        let command = framing.command_handle();

        framing.write_all(b"x").await.unwrap();
        command.set(TlsCommand::OptionNegotiation);
        framing.write_all(b"y").await.unwrap();
        framing.flush().await.unwrap();

        let mut raw = [0u8; 10];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw, b"\x01\x01\x00\x01x\x01\x02\x00\x01y");
        assert_eq!(framing.command(), TlsCommand::OptionNegotiation);
    }

    #[tokio::test]
    async fn closing_handshake_fails_reads() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut framing = FramingStream::new(a);

        b.write_all(b"\x01\x04\x00\x00").await.unwrap();

        let err = framing.read(&mut [0u8; 8]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(framing.is_closed());
        assert!(framing.read(&mut [0u8; 8]).await.is_err());
    }

    #[tokio::test]
    async fn closing_handshake_closes_the_stream() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut framing = FramingStream::new(a);
        framing.set_command(TlsCommand::DataFlow);

        b.write_all(b"\x01\x04\x00\x00").await.unwrap();
        assert!(framing.read(&mut [0u8; 8]).await.is_err());

        let err = framing.write_all(b"after-close").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);

        // the close is answered and the inner stream shut down
        let mut rest = Vec::new();
        b.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"\x01\x04\x00\x00");

        framing.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn outgoing_version_follows_the_peer() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut framing = FramingStream::new(a);
        framing.set_command(TlsCommand::DataFlow);

        b.write_all(b"\x02\x03\x00\x02hi").await.unwrap();
        let mut buf = [0u8; 2];
        framing.read_exact(&mut buf).await.unwrap();
        assert_eq!(framing.version(), 0x02);

        framing.write_all(b"yo").await.unwrap();
        framing.flush().await.unwrap();
        let mut raw = [0u8; 6];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw, b"\x02\x03\x00\x02yo");
    }

    #[tokio::test]
    async fn truncated_header_is_an_error() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut framing = FramingStream::new(a);

        b.write_all(b"\x01\x03").await.unwrap();
        drop(b);

        let err = framing.read(&mut [0u8; 8]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn shutdown_sends_closing_handshake() {
        let mock = tokio_test::io::Builder::new()
            .write(b"\x01\x04\x00\x00")
            .build();
        let mut framing = FramingStream::new(mock);
        framing.shutdown().await.unwrap();

        assert!(framing.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn shutdown_swallows_closing_handshake_errors() {
        let mock = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let mut framing = FramingStream::new(mock);
        framing.shutdown().await.unwrap();
    }
}
