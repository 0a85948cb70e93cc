//! Acceptor side of the handshake.

use crate::{
    auth::AuthenticationHandler,
    error::StateError,
    message::{
        write_message, AuthenticationRequest, AuthenticationResponse, ConnectRequest,
        ConnectResponse,
    },
    socks::{AuthenticationMethod, ConnectCode, ConnectMethod, ConnectionResult, Endpoint},
    transport::{
        cancellable, AsyncStream, BoxStream, ConnectionLog, ConnectionRole, LogEntry,
        LoggingStream,
    },
    tunnel::{Tunnel, TunnelControl, TunnelStats},
    ConnectionState, Error,
};
use futures::future::{BoxFuture, FutureExt};
use std::{fmt, future::Future, io, panic::AssertUnwindSafe, sync::Arc};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Opens the target-facing stream for a connect request.
pub type ConnectHandler = Arc<
    dyn Fn(ConnectMethod, Endpoint, CancellationToken) -> BoxFuture<'static, anyhow::Result<ConnectionResult>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct ServerOptions {
    authentication: AuthenticationHandler,
    connect_handler: ConnectHandler,
    connection_log: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            authentication: AuthenticationHandler::default(),
            connect_handler: Arc::new(host_unreachable),
            connection_log: false,
        }
    }
}

fn host_unreachable(
    method: ConnectMethod,
    endpoint: Endpoint,
    _cancel: CancellationToken,
) -> BoxFuture<'static, anyhow::Result<ConnectionResult>> {
    debug!(?method, %endpoint, "no connect handler configured");
    futures::future::ready(Ok(ConnectionResult::failure(ConnectCode::HostUnreachable))).boxed()
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_no_authentication_required(self) -> Self {
        self.with_authentication(AuthenticationHandler::no_authentication_required())
    }

    /// `login` decides on every username/password pair a client sends.
    pub fn with_username_password<F, Fut>(self, login: F) -> Self
    where
        F: Fn(String, String, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.with_authentication(AuthenticationHandler::username_password_server(login))
    }

    pub fn with_secure_sockets_layer<F, Fut>(self, handshake: F, options: Option<Vec<u8>>) -> Self
    where
        F: Fn(BoxStream, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<BoxStream>> + Send + 'static,
    {
        self.with_authentication(AuthenticationHandler::secure_sockets_layer_server(
            handshake, options,
        ))
    }

    pub fn with_no_acceptable_methods(self) -> Self {
        self.with_authentication(AuthenticationHandler::no_acceptable_methods())
    }

    /// Replaces a handler of the same kind, otherwise appends `handler`.
    pub fn with_authentication(mut self, handler: AuthenticationHandler) -> Self {
        self.authentication = self.authentication.with(handler);
        self
    }

    pub fn with_connect_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectMethod, Endpoint, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ConnectionResult>> + Send + 'static,
    {
        self.connect_handler =
            Arc::new(move |method, endpoint, cancel| handler(method, endpoint, cancel).boxed());
        self
    }

    pub fn with_connection_log(mut self, enabled: bool) -> Self {
        self.connection_log = enabled;
        self
    }

    pub fn authentication(&self) -> &AuthenticationHandler {
        &self.authentication
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("authentication", &self.authentication)
            .field("connection_log", &self.connection_log)
            .finish_non_exhaustive()
    }
}

pub struct Socks5Server {
    stream: Option<BoxStream>,
    remote: Option<BoxStream>,
    options: ServerOptions,
    state: ConnectionState,
    log: Option<ConnectionLog>,
    local_endpoint: Endpoint,
    remote_endpoint: Endpoint,
    connect_method: Option<ConnectMethod>,
    tunnel: TunnelControl,
}

impl Socks5Server {
    pub fn new<S>(stream: S, options: ServerOptions) -> Self
    where
        S: AsyncStream + 'static,
    {
        let log = options.connection_log.then(ConnectionLog::new);
        Socks5Server {
            stream: Some(Box::new(stream)),
            remote: None,
            options,
            state: ConnectionState::None,
            log,
            local_endpoint: Endpoint::invalid(),
            remote_endpoint: Endpoint::invalid(),
            connect_method: None,
            tunnel: TunnelControl::new(),
        }
    }

    /// Runs the whole handshake with a client, including the connect handler.
    ///
    /// On failure both the client stream and any target stream are shut
    /// down.
    pub async fn accept(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        if self.state != ConnectionState::None {
            return Err(StateError::AlreadyStarted.into());
        }
        if self.stream.is_none() {
            return Err(StateError::Closed.into());
        }

        if let Err(err) = self.handshake(cancel).await {
            debug!(%err, state = ?self.state, "socks5 accept failed");
            self.shutdown().await;
            return Err(err);
        }

        debug!(
            method = ?self.connect_method,
            remote = %self.remote_endpoint,
            local = %self.local_endpoint,
            "socks5 accepted"
        );
        Ok(())
    }

    async fn handshake(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        self.state = ConnectionState::Authentication;
        if let Some(log) = &self.log {
            log.clear();
        }

        let log = self.log.clone();
        let stream = self.stream.as_mut().ok_or(StateError::Closed)?;
        let request = cancellable(cancel, async {
            let mut tap = LoggingStream::new(&mut *stream, log.clone(), ConnectionRole::Server);
            AuthenticationRequest::read_from(&mut tap).await
        })
        .await?;

        let method = self
            .options
            .authentication
            .select_method(&request.methods)
            .unwrap_or(AuthenticationMethod::NoAcceptableMethods);
        trace!(offered = ?request.methods, ?method, "selected authentication method");

        cancellable(cancel, async {
            let mut tap = LoggingStream::new(&mut *stream, log.clone(), ConnectionRole::Server);
            write_message(&mut tap, &AuthenticationResponse::new(method)).await
        })
        .await?;
        if method == AuthenticationMethod::NoAcceptableMethods {
            return Err(Error::NoAcceptableMethods);
        }

        let stream = self.stream.take().ok_or(StateError::Closed)?;
        let stream = self
            .options
            .authentication
            .run_method(stream, method, cancel)
            .await?;
        let stream = self.stream.insert(stream);

        self.state = ConnectionState::Connection;
        let request = cancellable(cancel, async {
            let mut tap = LoggingStream::new(&mut *stream, log.clone(), ConnectionRole::Server);
            ConnectRequest::read_from(&mut tap).await
        })
        .await?;
        self.remote_endpoint = request.endpoint.clone();
        self.connect_method = Some(request.method);

        let handler = self.options.connect_handler.clone();
        let result = run_connect_handler(handler, request.method, request.endpoint, cancel).await?;

        let response = match result.into_parts() {
            Ok((remote, local_endpoint)) => {
                self.remote = Some(remote);
                self.local_endpoint = local_endpoint.clone();
                ConnectResponse::new(ConnectCode::Succeeded, local_endpoint)
            }
            Err(code) => ConnectResponse::new(code, self.remote_endpoint.clone()),
        };

        let stream = self.stream.as_mut().ok_or(StateError::Closed)?;
        cancellable(cancel, async {
            let mut tap = LoggingStream::new(&mut *stream, log.clone(), ConnectionRole::Server);
            write_message(&mut tap, &response).await
        })
        .await?;

        if response.code != ConnectCode::Succeeded {
            return Err(Error::ConnectFailed(response.code));
        }

        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn shutdown(&mut self) {
        for mut stream in [self.stream.take(), self.remote.take()].into_iter().flatten() {
            if let Err(err) = stream.shutdown().await {
                trace!(%err, "shutdown failed");
            }
        }
    }

    /// Relays between the client and the target until both sides are done.
    ///
    /// Without `leave_open` both streams are shut down afterwards and the
    /// server goes back to [`ConnectionState::None`], ready for
    /// [`Socks5Server::reattach`]. With `leave_open` the relay stops at the
    /// first EOF and both streams stay usable.
    pub async fn proxy(
        &mut self,
        cancel: &CancellationToken,
        leave_open: bool,
    ) -> Result<TunnelStats, Error> {
        if self.state != ConnectionState::Connected {
            return Err(StateError::NotConnected.into());
        }
        let (Some(local), Some(remote)) = (self.stream.as_mut(), self.remote.as_mut()) else {
            return Err(StateError::NoRemoteStream.into());
        };

        let result = Tunnel::new(local, remote, leave_open)
            .with_control(self.tunnel.clone())
            .run(cancel)
            .await;

        if let Err(Error::State(StateError::TunnelActive)) = result {
            return result;
        }
        if !leave_open {
            self.shutdown().await;
            self.state = ConnectionState::None;
        }
        result
    }

    /// Hands the server a fresh client stream after a finished proxy cycle.
    pub fn reattach<S>(&mut self, stream: S) -> Result<(), Error>
    where
        S: AsyncStream + 'static,
    {
        if self.state != ConnectionState::None || self.stream.is_some() {
            return Err(StateError::AlreadyStarted.into());
        }

        self.stream = Some(Box::new(stream));
        self.remote = None;
        self.local_endpoint = Endpoint::invalid();
        self.remote_endpoint = Endpoint::invalid();
        self.connect_method = None;
        Ok(())
    }

    /// Shuts down both streams. Calling it again does nothing.
    pub async fn disconnect(&mut self) {
        self.tunnel.stop();
        self.shutdown().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_proxy_active(&self) -> bool {
        self.tunnel.is_active()
    }

    pub fn tunnel_control(&self) -> TunnelControl {
        self.tunnel.clone()
    }

    /// The client-facing stream.
    pub fn local_stream(&mut self) -> Result<&mut BoxStream, Error> {
        if self.state != ConnectionState::Connected {
            return Err(StateError::NotConnected.into());
        }
        self.stream.as_mut().ok_or_else(|| StateError::Closed.into())
    }

    /// The target-facing stream the connect handler opened.
    pub fn remote_stream(&mut self) -> Result<&mut BoxStream, Error> {
        if self.state != ConnectionState::Connected {
            return Err(StateError::NotConnected.into());
        }
        self.remote
            .as_mut()
            .ok_or_else(|| StateError::NoRemoteStream.into())
    }

    /// Takes both streams as `(local, remote)`.
    pub fn into_streams(mut self) -> Result<(BoxStream, BoxStream), Error> {
        if self.state != ConnectionState::Connected {
            return Err(StateError::NotConnected.into());
        }
        let local = self.stream.take().ok_or(StateError::Closed)?;
        let remote = self.remote.take().ok_or(StateError::NoRemoteStream)?;
        Ok((local, remote))
    }

    /// Address the connect handler bound for the target connection.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local_endpoint
    }

    /// Address the client asked for.
    pub fn remote_endpoint(&self) -> &Endpoint {
        &self.remote_endpoint
    }

    pub fn connect_method(&self) -> Option<ConnectMethod> {
        self.connect_method
    }

    pub fn connection_log(&self) -> Vec<LogEntry> {
        self.log.as_ref().map(ConnectionLog::entries).unwrap_or_default()
    }
}

/// A connect handler that fails or panics answers `SocksFailure`.
async fn run_connect_handler(
    handler: ConnectHandler,
    method: ConnectMethod,
    endpoint: Endpoint,
    cancel: &CancellationToken,
) -> Result<ConnectionResult, Error> {
    let token = cancel.clone();
    let outcome =
        AssertUnwindSafe(async move { handler(method, endpoint, token).await }).catch_unwind();

    let outcome = cancellable(cancel, async { Ok::<_, Error>(outcome.await) }).await?;
    Ok(match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            warn!("connect handler failed: {:#}", err);
            ConnectionResult::failure(ConnectCode::SocksFailure)
        }
        Err(_) => {
            warn!("connect handler panicked");
            ConnectionResult::failure(ConnectCode::SocksFailure)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        net::Ipv4Addr,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use tokio_test::io::Builder;

    fn bound() -> Endpoint {
        Endpoint::ipv4(Ipv4Addr::new(192, 168, 0, 7), 4000)
    }

    fn succeed() -> ServerOptions {
        ServerOptions::new()
            .with_no_authentication_required()
            .with_connect_handler(|_method, _endpoint, _cancel| async {
                let (remote, _peer) = tokio::io::duplex(64);
                ConnectionResult::succeeded(Box::new(remote), bound()).map_err(anyhow::Error::from)
            })
    }

    #[tokio::test]
    async fn accepts_domain_connect() {
        let mock = Builder::new()
            .read(b"\x05\x02\x02\x00")
            .write(b"\x05\x00")
            .read(b"\x05\x01\x00\x03\x0bexample.com\x00\x50")
            .write(b"\x05\x00\x00\x01\xc0\xa8\x00\x07\x0f\xa0")
            .build();

        let mut server = Socks5Server::new(mock, succeed());
        server.accept(&CancellationToken::new()).await.unwrap();

        assert_eq!(server.state(), ConnectionState::Connected);
        assert_eq!(server.remote_endpoint(), &Endpoint::domain("example.com", 80));
        assert_eq!(server.local_endpoint(), &bound());
        assert_eq!(server.connect_method(), Some(ConnectMethod::TcpConnect));
        assert!(server.remote_stream().is_ok());
    }

    #[tokio::test]
    async fn refuses_unknown_methods_after_replying() {
        let mock = Builder::new()
            .read(b"\x05\x01\x02")
            .write(b"\x05\xff")
            .build();

        let mut server = Socks5Server::new(mock, succeed());
        let err = server.accept(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::NoAcceptableMethods));
        assert!(server.remote_endpoint().is_invalid());
        assert!(server.local_endpoint().is_invalid());
    }

    #[tokio::test]
    async fn no_acceptable_methods_handler_refuses_everyone() {
        let mock = Builder::new()
            .read(b"\x05\x01\x00")
            .write(b"\x05\xff")
            .build();

        let options = ServerOptions::new().with_no_acceptable_methods();
        let mut server = Socks5Server::new(mock, options);
        assert!(server.accept(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn default_connect_handler_answers_host_unreachable() {
        let mock = Builder::new()
            .read(b"\x05\x01\x00")
            .write(b"\x05\x00")
            .read(b"\x05\x01\x00\x01\x0a\x00\x00\x01\x00\x50")
            .write(b"\x05\x04\x00\x01\x0a\x00\x00\x01\x00\x50")
            .build();

        let options = ServerOptions::new().with_no_authentication_required();
        let mut server = Socks5Server::new(mock, options);
        let err = server.accept(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.connect_code(), Some(ConnectCode::HostUnreachable));
        assert!(matches!(
            server.local_stream(),
            Err(Error::State(StateError::NotConnected))
        ));
    }

    #[tokio::test]
    async fn failing_connect_handler_answers_socks_failure() {
        let failing = ServerOptions::new()
            .with_no_authentication_required()
            .with_connect_handler(|_method, _endpoint, _cancel| async {
                Err::<ConnectionResult, _>(anyhow::anyhow!("dial failed"))
            });
        let panicking = ServerOptions::new()
            .with_no_authentication_required()
            .with_connect_handler(|_method, _endpoint, _cancel| async {
                if true {
                    panic!("handler exploded");
                }
                ConnectionResult::failed(ConnectCode::TtlExpired).map_err(anyhow::Error::from)
            });

        for options in [failing, panicking] {
            let mock = Builder::new()
                .read(b"\x05\x01\x00")
                .write(b"\x05\x00")
                .read(b"\x05\x01\x00\x01\x0a\x00\x00\x01\x00\x50")
                .write(b"\x05\x01\x00\x01\x0a\x00\x00\x01\x00\x50")
                .build();
            let mut server = Socks5Server::new(mock, options);
            let err = server.accept(&CancellationToken::new()).await.unwrap_err();
            assert_eq!(err.connect_code(), Some(ConnectCode::SocksFailure));
        }
    }

    #[tokio::test]
    async fn handler_cannot_fake_a_success() {
        let options = ServerOptions::new()
            .with_no_authentication_required()
            .with_connect_handler(|_method, _endpoint, _cancel| async {
                let result = ConnectionResult::failed(ConnectCode::Succeeded)?;
                anyhow::Ok(result)
            });

        let mock = Builder::new()
            .read(b"\x05\x01\x00")
            .write(b"\x05\x00")
            .read(b"\x05\x01\x00\x01\x0a\x00\x00\x01\x00\x50")
            .write(b"\x05\x01\x00\x01\x0a\x00\x00\x01\x00\x50")
            .build();
        let mut server = Socks5Server::new(mock, options);
        let err = server.accept(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.connect_code(), Some(ConnectCode::SocksFailure));
        assert_ne!(server.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn denied_login_skips_connect_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let options = ServerOptions::new()
            .with_username_password(|_user, _pass, _cancel| async { anyhow::Ok(false) })
            .with_connect_handler(move |_method, _endpoint, _cancel| {
                counted.fetch_add(1, Ordering::SeqCst);
                async { ConnectionResult::failed(ConnectCode::SocksFailure).map_err(anyhow::Error::from) }
            });

        let mock = Builder::new()
            .read(b"\x05\x01\x02")
            .write(b"\x05\x02")
            .read(b"\x01\x01u\x01p")
            .write(b"\x01\x01")
            .build();
        let mut server = Socks5Server::new(mock, options);
        let err = server.accept(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn guards() {
        let mut server = Socks5Server::new(Builder::new().build(), ServerOptions::new());
        let err = server
            .proxy(&CancellationToken::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::State(StateError::NotConnected)));

        let (stream, _peer) = tokio::io::duplex(8);
        assert!(matches!(
            server.reattach(stream),
            Err(Error::State(StateError::AlreadyStarted))
        ));

        server.disconnect().await;
        server.disconnect().await;
        let err = server.accept(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::State(StateError::Closed)));

        let (stream, _peer) = tokio::io::duplex(8);
        assert!(server.reattach(stream).is_ok());
    }
}
