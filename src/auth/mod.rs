//! Authentication method negotiation.
//!
//! An [`AuthenticationHandler`] answers three questions for one side of the
//! handshake: which methods it can perform, which one it picks from a peer's
//! offer, and how to run the picked one over the transport. Several handlers
//! are combined with [`AuthenticationHandler::Composite`].

use crate::{socks::AuthenticationMethod, transport::BoxStream, Error};
use futures::future::{BoxFuture, FutureExt};
use std::{future::Future, io, mem};
use tokio_util::sync::CancellationToken;

mod secure_sockets_layer;
pub use secure_sockets_layer::*;

mod username_password;
pub use username_password::*;

#[derive(Debug, Clone)]
pub enum AuthenticationHandler {
    NoAuthenticationRequired,
    UsernamePasswordClient(UsernamePasswordClient),
    UsernamePasswordServer(UsernamePasswordServer),
    SecureSocketsLayerClient(SecureSocketsLayer),
    SecureSocketsLayerServer(SecureSocketsLayer),
    /// Always answers `NoAcceptableMethods`, making an acceptor refuse
    /// every client.
    NoAcceptableMethods,
    /// Handlers tried in order.
    Composite(Vec<AuthenticationHandler>),
}

impl Default for AuthenticationHandler {
    fn default() -> Self {
        AuthenticationHandler::Composite(Vec::new())
    }
}

impl AuthenticationHandler {
    pub fn no_authentication_required() -> Self {
        AuthenticationHandler::NoAuthenticationRequired
    }

    pub fn no_acceptable_methods() -> Self {
        AuthenticationHandler::NoAcceptableMethods
    }

    /// Fails if either credential is longer than 255 bytes.
    pub fn username_password_client(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, Error> {
        UsernamePasswordClient::new(username, password)
            .map(AuthenticationHandler::UsernamePasswordClient)
    }

    pub fn username_password_server<F, Fut>(login: F) -> Self
    where
        F: Fn(String, String, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        AuthenticationHandler::UsernamePasswordServer(UsernamePasswordServer::new(login))
    }

    pub fn secure_sockets_layer_client<F, Fut>(handshake: F, options: Option<Vec<u8>>) -> Self
    where
        F: Fn(BoxStream, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<BoxStream>> + Send + 'static,
    {
        AuthenticationHandler::SecureSocketsLayerClient(SecureSocketsLayer::new(
            handshake, options, false,
        ))
    }

    pub fn secure_sockets_layer_server<F, Fut>(handshake: F, options: Option<Vec<u8>>) -> Self
    where
        F: Fn(BoxStream, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<BoxStream>> + Send + 'static,
    {
        AuthenticationHandler::SecureSocketsLayerServer(SecureSocketsLayer::new(
            handshake, options, true,
        ))
    }

    pub fn composite(handlers: Vec<AuthenticationHandler>) -> Self {
        AuthenticationHandler::Composite(handlers)
    }

    /// Adds `handler`, replacing a handler of the same kind if there is one.
    pub fn with(self, handler: AuthenticationHandler) -> Self {
        let mut handlers = match self {
            AuthenticationHandler::Composite(handlers) => handlers,
            other => vec![other],
        };

        match handlers
            .iter_mut()
            .find(|h| mem::discriminant(*h) == mem::discriminant(&handler))
        {
            Some(slot) => *slot = handler,
            None => handlers.push(handler),
        }

        AuthenticationHandler::Composite(handlers)
    }

    pub fn supported_methods(&self) -> Vec<AuthenticationMethod> {
        match self {
            AuthenticationHandler::NoAuthenticationRequired => {
                vec![AuthenticationMethod::NoAuthenticationRequired]
            }
            AuthenticationHandler::UsernamePasswordClient(_)
            | AuthenticationHandler::UsernamePasswordServer(_) => {
                vec![AuthenticationMethod::UsernamePassword]
            }
            AuthenticationHandler::SecureSocketsLayerClient(_)
            | AuthenticationHandler::SecureSocketsLayerServer(_) => {
                vec![AuthenticationMethod::SecureSocketsLayer]
            }
            AuthenticationHandler::NoAcceptableMethods => {
                vec![AuthenticationMethod::NoAcceptableMethods]
            }
            AuthenticationHandler::Composite(handlers) => handlers
                .iter()
                .flat_map(AuthenticationHandler::supported_methods)
                .collect(),
        }
    }

    pub fn supports(&self, method: AuthenticationMethod) -> bool {
        self.supported_methods().contains(&method)
    }

    /// Picks a method out of the peer's `offered` list.
    pub fn select_method(&self, offered: &[AuthenticationMethod]) -> Option<AuthenticationMethod> {
        match self {
            AuthenticationHandler::NoAcceptableMethods => {
                Some(AuthenticationMethod::NoAcceptableMethods)
            }
            AuthenticationHandler::Composite(handlers) => handlers
                .iter()
                .find(|h| h.supported_methods().iter().any(|m| offered.contains(m)))
                .and_then(|h| h.select_method(offered)),
            other => other
                .supported_methods()
                .into_iter()
                .find(|m| offered.contains(m)),
        }
    }

    /// Runs the subnegotiation of `method` and returns the stream the
    /// handshake continues on.
    pub fn run_method<'a>(
        &'a self,
        stream: BoxStream,
        method: AuthenticationMethod,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<BoxStream, Error>> {
        async move {
            match self {
                AuthenticationHandler::Composite(handlers) => {
                    let handler = handlers
                        .iter()
                        .find(|h| h.supports(method))
                        .ok_or(Error::UnsupportedMethod(method))?;
                    handler.run_method(stream, method, cancel).await
                }
                _ if !self.supports(method) => Err(Error::UnsupportedMethod(method)),
                AuthenticationHandler::NoAuthenticationRequired => Ok(stream),
                AuthenticationHandler::NoAcceptableMethods => Err(Error::UnsupportedMethod(method)),
                AuthenticationHandler::UsernamePasswordClient(client) => {
                    client.run(stream, cancel).await
                }
                AuthenticationHandler::UsernamePasswordServer(server) => {
                    server.run(stream, cancel).await
                }
                AuthenticationHandler::SecureSocketsLayerClient(ssl)
                | AuthenticationHandler::SecureSocketsLayerServer(ssl) => {
                    ssl.run(stream, cancel).await
                }
            }
        }
        .boxed()
    }
}
