//! Username/password subnegotiation of [RFC 1929].
//!
//! [RFC 1929]: https://datatracker.ietf.org/doc/html/rfc1929

use crate::{
    error::ProtocolError,
    message::{check_version, write_message, Encode},
    socks::v5,
    transport::{cancellable, BoxStream},
    Error,
};
use bytes::BufMut;
use futures::future::{BoxFuture, FutureExt};
use std::{fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Decides whether a username/password pair may pass.
pub type LoginHandler = Arc<
    dyn Fn(String, String, CancellationToken) -> BoxFuture<'static, anyhow::Result<bool>>
        + Send
        + Sync,
>;

/// ```plain
/// +-----+------+----------+------+----------+
/// | VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +-----+------+----------+------+----------+
/// |  1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +-----+------+----------+------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsernamePasswordRequest {
    pub version: u8,
    pub username: String,
    pub password: String,
}

impl UsernamePasswordRequest {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        UsernamePasswordRequest {
            version: v5::USER_PASS_VERSION,
            username: username.into(),
            password: password.into(),
        }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let version = r.read_u8().await?;
        check_version(v5::USER_PASS_VERSION, version)?;

        let username = read_field(r).await?;
        let password = read_field(r).await?;

        Ok(UsernamePasswordRequest {
            version,
            username,
            password,
        })
    }
}

async fn read_field<R>(r: &mut R) -> Result<String, Error>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_u8().await?;
    let mut raw = vec![0; len as usize];
    r.read_exact(&mut raw).await?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

impl Encode for UsernamePasswordRequest {
    fn message_size(&self) -> usize {
        3 + self.username.len() + self.password.len()
    }

    fn write_to_buf<B: BufMut>(&self, buf: &mut B) -> Result<(), ProtocolError> {
        for field in [&self.username, &self.password] {
            if field.len() > u8::MAX as usize {
                return Err(ProtocolError::CredentialTooLong(field.len()));
            }
        }

        buf.put_u8(self.version);
        buf.put_u8(self.username.len() as u8);
        buf.put_slice(self.username.as_bytes());
        buf.put_u8(self.password.len() as u8);
        buf.put_slice(self.password.as_bytes());
        Ok(())
    }
}

/// ```plain
/// +-----+--------+
/// | VER | STATUS |
/// +-----+--------+
/// |  1  |   1    |
/// +-----+--------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsernamePasswordResponse {
    pub version: u8,
    pub status: u8,
}

impl UsernamePasswordResponse {
    pub const SUCCESS: u8 = 0x00;
    pub const FAILURE: u8 = 0x01;

    pub fn new(version: u8, allowed: bool) -> Self {
        let status = if allowed { Self::SUCCESS } else { Self::FAILURE };
        UsernamePasswordResponse { version, status }
    }

    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }

    /// Does not check the version; the client compares it with its request.
    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let version = r.read_u8().await?;
        let status = r.read_u8().await?;
        Ok(UsernamePasswordResponse { version, status })
    }
}

impl Encode for UsernamePasswordResponse {
    fn message_size(&self) -> usize {
        2
    }

    fn write_to_buf<B: BufMut>(&self, buf: &mut B) -> Result<(), ProtocolError> {
        buf.put_u8(self.version);
        buf.put_u8(self.status);
        Ok(())
    }
}

/// Client side: sends fixed credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct UsernamePasswordClient {
    username: String,
    password: String,
}

impl UsernamePasswordClient {
    /// Fails if either credential is longer than 255 bytes.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self, Error> {
        let username = username.into();
        let password = password.into();

        if username.len() > u8::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "username is {} bytes long, at most 255 are allowed",
                username.len()
            )));
        }
        if password.len() > u8::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "password is {} bytes long, at most 255 are allowed",
                password.len()
            )));
        }

        Ok(UsernamePasswordClient { username, password })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) async fn run(
        &self,
        mut stream: BoxStream,
        cancel: &CancellationToken,
    ) -> Result<BoxStream, Error> {
        let request = UsernamePasswordRequest::new(self.username.clone(), self.password.clone());

        let response = cancellable(cancel, async {
            write_message(&mut stream, &request).await?;
            UsernamePasswordResponse::read_from(&mut stream).await
        })
        .await?;

        if response.version != request.version || !response.is_success() {
            debug!(
                version = response.version,
                status = response.status,
                "username/password authentication rejected"
            );
            return Err(Error::AuthenticationFailed);
        }

        Ok(stream)
    }
}

impl fmt::Debug for UsernamePasswordClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsernamePasswordClient")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Server side: asks a [`LoginHandler`] about every pair it receives.
#[derive(Clone)]
pub struct UsernamePasswordServer {
    login: LoginHandler,
}

impl UsernamePasswordServer {
    pub fn new<F, Fut>(login: F) -> Self
    where
        F: Fn(String, String, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        UsernamePasswordServer {
            login: Arc::new(move |username, password, cancel| {
                login(username, password, cancel).boxed()
            }),
        }
    }

    /// A failing or panicking login handler denies the client.
    async fn check(&self, username: String, password: String, cancel: &CancellationToken) -> bool {
        let login = AssertUnwindSafe(async {
            (self.login)(username, password, cancel.clone()).await
        });

        match login.catch_unwind().await {
            Ok(Ok(allowed)) => allowed,
            Ok(Err(err)) => {
                warn!("login handler failed: {:#}", err);
                false
            }
            Err(_) => {
                warn!("login handler panicked");
                false
            }
        }
    }

    pub(crate) async fn run(
        &self,
        mut stream: BoxStream,
        cancel: &CancellationToken,
    ) -> Result<BoxStream, Error> {
        let request = cancellable(cancel, UsernamePasswordRequest::read_from(&mut stream)).await?;

        let allowed = cancellable(cancel, async {
            let allowed = self
                .check(request.username.clone(), request.password.clone(), cancel)
                .await;
            Ok::<_, Error>(allowed)
        })
        .await?;

        let response = UsernamePasswordResponse::new(request.version, allowed);
        cancellable(cancel, write_message(&mut stream, &response)).await?;

        if !allowed {
            debug!(username = %request.username, "login denied");
            return Err(Error::AuthenticationFailed);
        }

        Ok(stream)
    }
}

impl fmt::Debug for UsernamePasswordServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsernamePasswordServer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::io::Builder;

    fn server(allow: bool) -> UsernamePasswordServer {
        UsernamePasswordServer::new(move |user, pass, _cancel| async move {
            anyhow::Ok(allow && user == "john" && pass == "secret")
        })
    }

    #[test]
    fn credential_length_is_bounded() {
        assert!(UsernamePasswordClient::new("a".repeat(255), "b".repeat(255)).is_ok());
        assert!(matches!(
            UsernamePasswordClient::new("a".repeat(256), "b"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            UsernamePasswordClient::new("a", "b".repeat(256)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            UsernamePasswordRequest::new("a".repeat(300), "").encode(),
            Err(ProtocolError::CredentialTooLong(300))
        ));
    }

    #[tokio::test]
    async fn client_sends_credentials() {
        let mock = Builder::new()
            .write(b"\x01\x04john\x06secret")
            .read(b"\x01\x00")
            .build();

        let client = UsernamePasswordClient::new("john", "secret").unwrap();
        assert!(client
            .run(Box::new(mock), &CancellationToken::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn client_fails_on_rejection_or_version_mismatch() {
        let client = UsernamePasswordClient::new("john", "secret").unwrap();

        for reply in [&b"\x01\x01"[..], &b"\x02\x00"[..]] {
            let mock = Builder::new()
                .write(b"\x01\x04john\x06secret")
                .read(reply)
                .build();
            let err = client
                .run(Box::new(mock), &CancellationToken::new())
                .await
                .err()
                .unwrap();
            assert!(matches!(err, Error::AuthenticationFailed));
        }
    }

    #[tokio::test]
    async fn server_allows_valid_login() {
        let mock = Builder::new()
            .read(b"\x01\x04john\x06secret")
            .write(b"\x01\x00")
            .build();

        assert!(server(true)
            .run(Box::new(mock), &CancellationToken::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn server_replies_then_fails_on_denial() {
        let mock = Builder::new()
            .read(b"\x01\x04john\x05wrong")
            .write(b"\x01\x01")
            .build();

        let err = server(true)
            .run(Box::new(mock), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::AuthenticationFailed));
    }

    #[tokio::test]
    async fn failing_login_handler_denies() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        let failing = UsernamePasswordServer::new(move |_user, _pass, _cancel| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Err::<bool, _>(anyhow::anyhow!("backend unavailable")) }
        });
        let panicking = UsernamePasswordServer::new(|_user, _pass, _cancel| async {
            if true {
                panic!("login exploded");
            }
            anyhow::Ok(true)
        });

        for handler in [failing, panicking] {
            let mock = Builder::new()
                .read(b"\x01\x01a\x01b")
                .write(b"\x01\x01")
                .build();
            let err = handler
                .run(Box::new(mock), &CancellationToken::new())
                .await
                .err()
                .unwrap();
            assert!(matches!(err, Error::AuthenticationFailed));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_rejects_wrong_subnegotiation_version() {
        let mock = Builder::new().read(b"\x05").build();

        let err = server(true)
            .run(Box::new(mock), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InvalidVersion {
                expected: 1,
                found: 5
            })
        ));
    }

    #[tokio::test]
    async fn cancelled_before_request() {
        let mock = Builder::new().build();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = server(true).run(Box::new(mock), &cancel).await.err().unwrap();
        assert!(err.is_cancelled());
    }
}
