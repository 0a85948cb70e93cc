//! Requester side of the handshake.

use crate::{
    auth::AuthenticationHandler,
    error::StateError,
    message::{
        write_message, AuthenticationRequest, AuthenticationResponse, ConnectRequest,
        ConnectResponse,
    },
    socks::{AddressType, AuthenticationMethod, ConnectCode, ConnectMethod, Endpoint},
    transport::{
        cancellable, AsyncStream, BoxStream, ConnectionLog, ConnectionRole, LogEntry,
        LoggingStream,
    },
    ConnectionState, Error,
};
use std::{future::Future, io};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    authentication: AuthenticationHandler,
    connect_method: ConnectMethod,
    validate_endpoint: bool,
    connection_log: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            authentication: AuthenticationHandler::default(),
            connect_method: ConnectMethod::TcpConnect,
            validate_endpoint: true,
            connection_log: false,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_no_authentication_required(self) -> Self {
        self.with_authentication(AuthenticationHandler::no_authentication_required())
    }

    pub fn with_username_password(
        self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, Error> {
        let handler = AuthenticationHandler::username_password_client(username, password)?;
        Ok(self.with_authentication(handler))
    }

    pub fn with_secure_sockets_layer<F, Fut>(self, handshake: F, options: Option<Vec<u8>>) -> Self
    where
        F: Fn(BoxStream, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<BoxStream>> + Send + 'static,
    {
        self.with_authentication(AuthenticationHandler::secure_sockets_layer_client(
            handshake, options,
        ))
    }

    /// Replaces a handler of the same kind, otherwise appends `handler`.
    pub fn with_authentication(mut self, handler: AuthenticationHandler) -> Self {
        self.authentication = self.authentication.with(handler);
        self
    }

    pub fn with_connect_method(mut self, method: ConnectMethod) -> Self {
        self.connect_method = method;
        self
    }

    /// Whether the endpoint in the connect response must equal the requested
    /// one. On by default.
    pub fn with_endpoint_validation(mut self, validate: bool) -> Self {
        self.validate_endpoint = validate;
        self
    }

    pub fn with_connection_log(mut self, enabled: bool) -> Self {
        self.connection_log = enabled;
        self
    }

    pub fn authentication(&self) -> &AuthenticationHandler {
        &self.authentication
    }

    pub fn connect_method(&self) -> ConnectMethod {
        self.connect_method
    }
}

pub struct Socks5Client {
    stream: Option<BoxStream>,
    options: ClientOptions,
    state: ConnectionState,
    log: Option<ConnectionLog>,
    local_endpoint: Endpoint,
    remote_endpoint: Endpoint,
}

impl Socks5Client {
    pub fn new<S>(stream: S, options: ClientOptions) -> Self
    where
        S: AsyncStream + 'static,
    {
        let log = options.connection_log.then(ConnectionLog::new);
        Socks5Client {
            stream: Some(Box::new(stream)),
            options,
            state: ConnectionState::None,
            log,
            local_endpoint: Endpoint::invalid(),
            remote_endpoint: Endpoint::invalid(),
        }
    }

    /// Runs the whole handshake and asks the server to connect to `endpoint`.
    ///
    /// Can only be called once. On failure the transport is shut down and
    /// the client stays unusable.
    pub async fn connect(
        &mut self,
        endpoint: Endpoint,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if self.state != ConnectionState::None {
            return Err(StateError::AlreadyStarted.into());
        }
        if endpoint.address_type() == AddressType::Unknown {
            return Err(Error::InvalidArgument(
                "cannot connect to an endpoint of unknown address type".into(),
            ));
        }

        if let Err(err) = self.handshake(&endpoint, cancel).await {
            debug!(%err, state = ?self.state, "socks5 connect failed");
            self.shutdown().await;
            return Err(err);
        }

        debug!(remote = %self.remote_endpoint, local = %self.local_endpoint, "socks5 connected");
        Ok(())
    }

    async fn handshake(&mut self, endpoint: &Endpoint, cancel: &CancellationToken) -> Result<(), Error> {
        self.state = ConnectionState::Authentication;
        if let Some(log) = &self.log {
            log.clear();
        }

        let mut methods = Vec::new();
        for method in self.options.authentication.supported_methods() {
            if !methods.contains(&method) {
                methods.push(method);
            }
        }
        let request = AuthenticationRequest::new(methods);

        let log = self.log.clone();
        let stream = self.stream.as_mut().ok_or(StateError::Closed)?;
        let response = cancellable(cancel, async {
            let mut tap = LoggingStream::new(&mut *stream, log.clone(), ConnectionRole::Client);
            write_message(&mut tap, &request).await?;
            AuthenticationResponse::read_from(&mut tap).await
        })
        .await?;

        let method = response.method;
        trace!(?method, "server selected authentication method");
        if method == AuthenticationMethod::NoAcceptableMethods {
            return Err(Error::NoAcceptableMethods);
        }
        if !request.methods.contains(&method) {
            return Err(Error::UnsupportedMethod(method));
        }

        let stream = self.stream.take().ok_or(StateError::Closed)?;
        let stream = self
            .options
            .authentication
            .run_method(stream, method, cancel)
            .await?;
        let stream = self.stream.insert(stream);

        self.state = ConnectionState::Connection;
        let request = ConnectRequest::new(self.options.connect_method, endpoint.clone());
        let response = cancellable(cancel, async {
            let mut tap = LoggingStream::new(&mut *stream, log.clone(), ConnectionRole::Client);
            write_message(&mut tap, &request).await?;
            ConnectResponse::read_from(&mut tap).await
        })
        .await?;

        if response.code != ConnectCode::Succeeded {
            return Err(Error::ConnectFailed(response.code));
        }
        if self.options.validate_endpoint && response.endpoint != *endpoint {
            return Err(Error::EndpointMismatch {
                requested: endpoint.clone(),
                received: response.endpoint,
            });
        }

        self.local_endpoint = response.endpoint;
        self.remote_endpoint = endpoint.clone();
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                trace!(%err, "shutdown failed");
            }
        }
    }

    /// Shuts the transport down. Calling it again does nothing.
    pub async fn disconnect(&mut self) {
        self.shutdown().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.stream.is_some()
    }

    /// The stream to talk to the target through.
    pub fn stream(&mut self) -> Result<&mut BoxStream, Error> {
        if self.state != ConnectionState::Connected {
            return Err(StateError::NotConnected.into());
        }
        self.stream.as_mut().ok_or_else(|| StateError::Closed.into())
    }

    pub fn into_stream(mut self) -> Result<BoxStream, Error> {
        if self.state != ConnectionState::Connected {
            return Err(StateError::NotConnected.into());
        }
        self.stream.take().ok_or_else(|| StateError::Closed.into())
    }

    /// Address the server bound for the connection.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local_endpoint
    }

    /// Address the server was asked to connect to.
    pub fn remote_endpoint(&self) -> &Endpoint {
        &self.remote_endpoint
    }

    /// Handshake bytes, merged per direction. Empty unless enabled in the
    /// options.
    pub fn connection_log(&self) -> Vec<LogEntry> {
        self.log.as_ref().map(ConnectionLog::entries).unwrap_or_default()
    }
}
