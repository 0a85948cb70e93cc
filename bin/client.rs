use clap::Parser;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use yew_socks5::{ClientOptions, Endpoint, Socks5Client};

/// Connects to a target through a SOCKS5 proxy and pipes stdin/stdout.
#[derive(Debug, Parser)]
#[command(name = "socks5-client", version)]
struct Args {
    /// Proxy to connect through.
    #[arg(long, env = "SOCKS5_PROXY", default_value = "127.0.0.1:1080")]
    proxy: String,

    /// Target as `host:port` or `[v6]:port`.
    target: Endpoint,

    #[arg(long, env = "SOCKS5_USERNAME", requires = "password")]
    username: Option<String>,

    #[arg(long, env = "SOCKS5_PASSWORD", requires = "username")]
    password: Option<String>,

    /// Fail if the proxy answers with a different endpoint than requested.
    /// Most servers answer with their bound address, so this is off.
    #[arg(long)]
    validate_endpoint: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let options = ClientOptions::new().with_endpoint_validation(args.validate_endpoint);
    let options = match (args.username, args.password) {
        (Some(username), Some(password)) => options.with_username_password(username, password)?,
        _ => options.with_no_authentication_required(),
    };

    let conn = TcpStream::connect(&args.proxy).await?;
    let mut client = Socks5Client::new(conn, options);

    let cancel = CancellationToken::new();
    client.connect(args.target, &cancel).await?;
    info!(target = %client.remote_endpoint(), bound = %client.local_endpoint(), "connected");

    let stream = client.into_stream()?;
    let (mut reader, mut writer) = tokio::io::split(stream);

    let upload = async {
        let mut stdin = BufReader::new(tokio::io::stdin());
        let n = tokio::io::copy(&mut stdin, &mut writer).await?;
        writer.shutdown().await?;
        anyhow::Ok(n)
    };
    let download = async {
        let mut stdout = tokio::io::stdout();
        let n = tokio::io::copy(&mut reader, &mut stdout).await?;
        stdout.flush().await?;
        anyhow::Ok(n)
    };

    tokio::select! {
        res = async { tokio::try_join!(upload, download) } => {
            let (sent, received) = res?;
            debug!(sent, received, "done");
        }
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    Ok(())
}
