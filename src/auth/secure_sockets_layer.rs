//! TLS subnegotiation (method `0x06`).
//!
//! The transport is wrapped in a [`FramingStream`] and handed to a
//! caller-supplied handshake function, which returns the encrypted stream.
//! An optional options blob of fixed size is then echoed through the tunnel:
//! the client writes it and reads it back, the server reads it and writes it
//! back.

use crate::{
    transport::{cancellable, BoxStream, FramingStream, TlsCommand},
    Error,
};
use futures::future::{BoxFuture, FutureExt};
use std::{fmt, future::Future, io, sync::Arc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Runs a TLS handshake over the framed stream.
pub type TlsHandshake =
    Arc<dyn Fn(BoxStream, CancellationToken) -> BoxFuture<'static, io::Result<BoxStream>> + Send + Sync>;

#[derive(Clone)]
pub struct SecureSocketsLayer {
    handshake: TlsHandshake,
    options: Option<Vec<u8>>,
    is_server: bool,
}

impl SecureSocketsLayer {
    pub fn new<F, Fut>(handshake: F, options: Option<Vec<u8>>, is_server: bool) -> Self
    where
        F: Fn(BoxStream, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<BoxStream>> + Send + 'static,
    {
        SecureSocketsLayer {
            handshake: Arc::new(move |stream, cancel| handshake(stream, cancel).boxed()),
            options,
            is_server,
        }
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn options(&self) -> Option<&[u8]> {
        self.options.as_deref()
    }

    pub(crate) async fn run(
        &self,
        stream: BoxStream,
        cancel: &CancellationToken,
    ) -> Result<BoxStream, Error> {
        let framing = FramingStream::new(stream);
        let command = framing.command_handle();

        debug!(server = self.is_server, "starting tls handshake");
        let mut stream = cancellable(cancel, async {
            (self.handshake)(Box::new(framing), cancel.clone())
                .await
                .map_err(Error::TlsHandshake)
        })
        .await?;

        if let Some(options) = &self.options {
            command.set(TlsCommand::OptionNegotiation);

            let mut echoed = vec![0; options.len()];
            cancellable(cancel, async {
                if self.is_server {
                    stream.read_exact(&mut echoed).await?;
                    stream.write_all(&echoed).await?;
                    stream.flush().await?;
                } else {
                    stream.write_all(options).await?;
                    stream.flush().await?;
                    stream.read_exact(&mut echoed).await?;
                }
                Ok::<_, Error>(())
            })
            .await?;
            trace!(options = ?echoed, "options negotiated");
        }

        command.set(TlsCommand::DataFlow);
        Ok(stream)
    }
}

impl fmt::Debug for SecureSocketsLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSocketsLayer")
            .field("options", &self.options)
            .field("is_server", &self.is_server)
            .finish_non_exhaustive()
    }
}
