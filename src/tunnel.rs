//! Bidirectional relay between two streams.

use crate::{error::StateError, Error};
use futures::ready;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Bytes moved by a finished tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

#[derive(Debug, Default)]
struct ControlState {
    active: AtomicBool,
    stop: Mutex<Option<CancellationToken>>,
}

/// Shared view on a tunnel: whether one is running, and a way to stop it.
#[derive(Debug, Clone, Default)]
pub struct TunnelControl {
    state: Arc<ControlState>,
}

impl TunnelControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }

    /// Stops the running tunnel, if any. Its streams are treated as if both
    /// directions had finished.
    pub fn stop(&self) {
        if let Some(token) = self.state.stop.lock().as_ref() {
            token.cancel();
        }
    }

    fn start(&self, stop: CancellationToken) -> Result<ActiveGuard<'_>, StateError> {
        self.state
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| StateError::TunnelActive)?;
        *self.state.stop.lock() = Some(stop);
        Ok(ActiveGuard(self))
    }
}

struct ActiveGuard<'a>(&'a TunnelControl);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.state.stop.lock().take();
        self.0.state.active.store(false, Ordering::Release);
    }
}

pub struct Tunnel<'a, A, B> {
    a: &'a mut A,
    b: &'a mut B,
    leave_open: bool,
    control: TunnelControl,
}

impl<'a, A, B> Tunnel<'a, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    /// Without `leave_open` each direction shuts down its writer once its
    /// reader hits EOF and the tunnel ends when both are done. With
    /// `leave_open` the tunnel ends as soon as either direction finishes and
    /// nothing is shut down.
    pub fn new(a: &'a mut A, b: &'a mut B, leave_open: bool) -> Self {
        Tunnel {
            a,
            b,
            leave_open,
            control: TunnelControl::new(),
        }
    }

    pub fn with_control(mut self, control: TunnelControl) -> Self {
        self.control = control;
        self
    }

    /// Cancelling `cancel` ends the tunnel with [`Error::Cancelled`];
    /// [`TunnelControl::stop`] ends it with the bytes counted so far.
    pub async fn run(self, cancel: &CancellationToken) -> Result<TunnelStats, Error> {
        let stop = cancel.child_token();
        let _guard = self.control.start(stop.clone())?;

        let (mut a_read, mut a_write) = tokio::io::split(self.a);
        let (mut b_read, mut b_write) = tokio::io::split(self.b);
        let mut stats = TunnelStats::default();
        let shutdown = !self.leave_open;

        let result = {
            let a_to_b = relay(&mut a_read, &mut b_write, &mut stats.a_to_b, shutdown);
            let b_to_a = relay(&mut b_read, &mut a_write, &mut stats.b_to_a, shutdown);

            if self.leave_open {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => Ok(()),
                    res = a_to_b => res,
                    res = b_to_a => res,
                }
            } else {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => Ok(()),
                    res = futures::future::try_join(a_to_b, b_to_a) => res.map(|_| ()),
                }
            }
        };

        if cancel.is_cancelled() {
            debug!(?stats, "tunnel cancelled");
            return Err(Error::Cancelled);
        }
        result?;

        debug!(?stats, "tunnel finished");
        Ok(stats)
    }
}

async fn relay<R, W>(r: &mut R, w: &mut W, copied: &mut u64, shutdown: bool) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut w = Counted {
        inner: w,
        count: copied,
    };
    tokio::io::copy(r, &mut w).await?;

    if shutdown {
        if let Err(err) = w.shutdown().await {
            trace!(%err, "shutdown after eof failed");
        }
    }
    Ok(())
}

pin_project! {
    // keeps the count current so a stopped tunnel still reports it
    struct Counted<'a, W> {
        #[pin]
        inner: W,
        count: &'a mut u64,
    }
}

impl<W: AsyncWrite> AsyncWrite for Counted<'_, W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        let n = ready!(this.inner.poll_write(cx, buf))?;
        **this.count += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn relays_both_ways_and_half_closes() {
        let (mut a, mut a_peer) = tokio::io::duplex(64);
        let (mut b, mut b_peer) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();

        let peers = async {
            a_peer.write_all(b"hello b").await.unwrap();
            a_peer.shutdown().await.unwrap();

            let mut got = Vec::new();
            b_peer.read_to_end(&mut got).await.unwrap();
            assert_eq!(got, b"hello b");

            b_peer.write_all(b"hi a").await.unwrap();
            b_peer.shutdown().await.unwrap();

            let mut got = Vec::new();
            a_peer.read_to_end(&mut got).await.unwrap();
            assert_eq!(got, b"hi a");
        };

        let (stats, _) = tokio::join!(Tunnel::new(&mut a, &mut b, false).run(&cancel), peers);
        assert_eq!(
            stats.unwrap(),
            TunnelStats {
                a_to_b: 7,
                b_to_a: 4
            }
        );
    }

    #[tokio::test]
    async fn leave_open_ends_on_first_eof() {
        let (mut a, mut a_peer) = tokio::io::duplex(64);
        let (mut b, _b_peer) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();

        a_peer.write_all(b"abc").await.unwrap();
        a_peer.shutdown().await.unwrap();

        let stats = Tunnel::new(&mut a, &mut b, true)
            .run(&cancel)
            .await
            .unwrap();
        assert_eq!(stats.a_to_b, 3);

        // b was not shut down, so it still takes writes
        b.write_all(b"more").await.unwrap();
    }

    #[tokio::test]
    async fn counts_transfers_larger_than_one_read() {
        let (mut a, mut a_peer) = tokio::io::duplex(4096);
        let (mut b, mut b_peer) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();

        let peers = async {
            let upload = async {
                a_peer.write_all(&payload).await.unwrap();
                a_peer.shutdown().await.unwrap();
            };
            let download = async {
                let mut got = Vec::new();
                b_peer.read_to_end(&mut got).await.unwrap();
                got
            };
            let ((), got) = tokio::join!(upload, download);
            assert_eq!(got, payload);
            b_peer.shutdown().await.unwrap();
        };

        let (stats, ()) = tokio::join!(Tunnel::new(&mut a, &mut b, false).run(&cancel), peers);
        assert_eq!(
            stats.unwrap(),
            TunnelStats {
                a_to_b: payload.len() as u64,
                b_to_a: 0
            }
        );
    }

    #[tokio::test]
    async fn cancel_and_stop() {
        let (mut a, _a_peer) = tokio::io::duplex(64);
        let (mut b, _b_peer) = tokio::io::duplex(64);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Tunnel::new(&mut a, &mut b, false)
            .run(&cancel)
            .await
            .err()
            .unwrap();
        assert!(err.is_cancelled());

        let control = TunnelControl::new();
        let cancel = CancellationToken::new();
        let tunnel = Tunnel::new(&mut a, &mut b, true).with_control(control.clone());
        let stopper = async {
            while !control.is_active() {
                tokio::task::yield_now().await;
            }
            control.stop();
        };
        let (stats, _) = tokio::join!(tunnel.run(&cancel), stopper);
        assert_eq!(stats.unwrap(), TunnelStats::default());
        assert!(!control.is_active());
    }

    #[tokio::test]
    async fn one_tunnel_per_control() {
        let control = TunnelControl::new();
        let _guard = control.start(CancellationToken::new()).unwrap();

        let (mut a, _a_peer) = tokio::io::duplex(64);
        let (mut b, _b_peer) = tokio::io::duplex(64);
        let err = Tunnel::new(&mut a, &mut b, false)
            .with_control(control.clone())
            .run(&CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::State(StateError::TunnelActive)));
    }
}
