use crate::Error;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Anything an engine can run a handshake over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized {}

/// Owned, type-erased transport. Authentication methods that wrap the
/// transport hand back a new `BoxStream` owning the old one.
pub type BoxStream = Box<dyn AsyncStream>;

mod framing;
pub use framing::*;

mod logging;
pub use logging::*;

/// Races `fut` against `cancel`.
pub(crate) async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}
