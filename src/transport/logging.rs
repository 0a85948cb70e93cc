use bytes::Bytes;
use futures::ready;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Server,
    Client,
}

/// Raw handshake bytes sent by `role`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub role: ConnectionRole,
    pub data: Bytes,
}

/// Append-only record of the bytes exchanged during a handshake.
#[derive(Debug, Clone, Default)]
pub struct ConnectionLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl ConnectionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, role: ConnectionRole, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.entries.lock().push(LogEntry {
            role,
            data: Bytes::copy_from_slice(data),
        });
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Entries as recorded, one per read or write.
    pub fn raw_entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Entries with consecutive records of the same role merged.
    pub fn entries(&self) -> Vec<LogEntry> {
        merge(&self.entries.lock())
    }
}

pub fn merge(entries: &[LogEntry]) -> Vec<LogEntry> {
    let mut merged: Vec<(ConnectionRole, Vec<u8>)> = Vec::new();
    for entry in entries {
        match merged.last_mut() {
            Some((role, data)) if *role == entry.role => data.extend_from_slice(&entry.data),
            _ => merged.push((entry.role, entry.data.to_vec())),
        }
    }
    merged
        .into_iter()
        .map(|(role, data)| LogEntry {
            role,
            data: data.into(),
        })
        .collect()
}

pin_project! {
    /// Records what passes through `inner` into an optional [`ConnectionLog`].
    pub struct LoggingStream<S> {
        #[pin]
        inner: S,
        log: Option<ConnectionLog>,
        read_role: ConnectionRole,
        write_role: ConnectionRole,
    }
}

impl<S> LoggingStream<S> {
    /// `local` is the role of the side owning `inner`.
    pub fn new(inner: S, log: Option<ConnectionLog>, local: ConnectionRole) -> Self {
        let peer = match local {
            ConnectionRole::Client => ConnectionRole::Server,
            ConnectionRole::Server => ConnectionRole::Client,
        };
        LoggingStream {
            inner,
            log,
            read_role: peer,
            write_role: local,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead> AsyncRead for LoggingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        if let Some(log) = this.log {
            log.push(*this.read_role, &buf.filled()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite> AsyncWrite for LoggingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let n = ready!(this.inner.poll_write(cx, buf))?;
        if let Some(log) = this.log {
            log.push(*this.write_role, &buf[..n]);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
