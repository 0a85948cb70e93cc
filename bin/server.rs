use clap::Parser;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use yew_socks5::{
    ConnectCode, ConnectMethod, ConnectionResult, Endpoint, Error, ServerOptions, Socks5Server,
};

/// SOCKS5 proxy that dials TCP targets directly.
#[derive(Debug, Parser)]
#[command(name = "socks5-server", version)]
struct Args {
    /// Address to accept clients on.
    #[arg(long, env = "SOCKS5_LISTEN", default_value = "127.0.0.1:1080")]
    listen: SocketAddr,

    /// Require this username (together with --password).
    #[arg(long, env = "SOCKS5_USERNAME", requires = "password")]
    username: Option<String>,

    #[arg(long, env = "SOCKS5_PASSWORD", requires = "username")]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let options = ServerOptions::new().with_connect_handler(dial);
    let options = match (args.username, args.password) {
        (Some(username), Some(password)) => {
            options.with_username_password(move |user, pass, _cancel| {
                let allowed = user == username && pass == password;
                async move { anyhow::Ok(allowed) }
            })
        }
        _ => options.with_no_authentication_required(),
    };

    let listener = TcpListener::bind(args.listen).await?;
    info!(addr = %listener.local_addr()?, "listening");

    let shutdown = CancellationToken::new();
    loop {
        tokio::select! {
            res = listener.accept() => {
                let (conn, peer) = match res {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                };

                let options = options.clone();
                let cancel = shutdown.child_token();
                tokio::spawn(async move {
                    if let Err(err) = serve(conn, options, cancel).await {
                        debug!(%peer, %err, "session ended");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                shutdown.cancel();
                break;
            }
        }
    }

    Ok(())
}

async fn serve(conn: TcpStream, options: ServerOptions, cancel: CancellationToken) -> Result<(), Error> {
    let mut server = Socks5Server::new(conn, options);
    server.accept(&cancel).await?;

    let target = server.remote_endpoint().clone();
    let stats = server.proxy(&cancel, false).await?;
    debug!(%target, sent = stats.a_to_b, received = stats.b_to_a, "session finished");
    Ok(())
}

async fn dial(
    method: ConnectMethod,
    endpoint: Endpoint,
    cancel: CancellationToken,
) -> anyhow::Result<ConnectionResult> {
    if method != ConnectMethod::TcpConnect {
        return Ok(ConnectionResult::failed(ConnectCode::CommandNotSupported)?);
    }

    let connect = TcpStream::connect((endpoint.address(), endpoint.port()));
    let stream = tokio::select! {
        _ = cancel.cancelled() => anyhow::bail!("cancelled while dialing {}", endpoint),
        res = connect => res,
    };

    match stream {
        Ok(stream) => {
            let local = Endpoint::from(stream.local_addr()?);
            Ok(ConnectionResult::succeeded(Box::new(stream), local)?)
        }
        Err(err) => {
            debug!(%endpoint, %err, "dial failed");
            Ok(ConnectionResult::failed(ConnectCode::from(&err))?)
        }
    }
}
