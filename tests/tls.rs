use std::{io, sync::Arc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::{
    rustls::{
        self,
        pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName},
    },
    TlsAcceptor, TlsConnector,
};
use tokio_util::sync::CancellationToken;
use yew_socks5::{
    BoxStream, ClientOptions, ConnectionResult, Endpoint, ServerOptions, Socks5Client,
    Socks5Server,
};

fn tls_pair() -> (TlsAcceptor, TlsConnector) {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .self_signed(&key_pair)
        .unwrap();
    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let server = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der.into())
        .unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

    (
        TlsAcceptor::from(Arc::new(server)),
        TlsConnector::from(Arc::new(client)),
    )
}

fn options(options_blob: Option<Vec<u8>>) -> (ClientOptions, ServerOptions) {
    let (acceptor, connector) = tls_pair();

    let client = ClientOptions::new().with_secure_sockets_layer(
        move |stream: BoxStream, _cancel| {
            let connector = connector.clone();
            async move {
                let tls = connector
                    .connect(ServerName::try_from("localhost").map_err(io::Error::other)?, stream)
                    .await?;
                io::Result::Ok(Box::new(tls) as BoxStream)
            }
        },
        options_blob.clone(),
    );

    let server = ServerOptions::new()
        .with_secure_sockets_layer(
            move |stream: BoxStream, _cancel| {
                let acceptor = acceptor.clone();
                async move {
                    let tls = acceptor.accept(stream).await?;
                    io::Result::Ok(Box::new(tls) as BoxStream)
                }
            },
            options_blob,
        )
        .with_connect_handler(|_method, endpoint, _cancel| async move {
            let (remote, _peer) = tokio::io::duplex(64);
            let result = ConnectionResult::succeeded(Box::new(remote), endpoint)?;
            anyhow::Ok(result)
        });

    (client, server)
}

async fn exchange_over_tls(options_blob: Option<Vec<u8>>) {
    let (client_options, server_options) = options(options_blob);
    let (a, b) = tokio::io::duplex(16 * 1024);
    let mut client = Socks5Client::new(a, client_options);
    let mut server = Socks5Server::new(b, server_options);

    let cancel = CancellationToken::new();
    let target = Endpoint::domain("internal.example", 8443);
    let (client_res, server_res) = tokio::join!(
        client.connect(target.clone(), &cancel),
        server.accept(&cancel)
    );
    client_res.unwrap();
    server_res.unwrap();
    assert_eq!(server.remote_endpoint(), &target);

    let upload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let download: Vec<u8> = (0..50_000u32).map(|i| (i % 13) as u8).collect();

    let client_stream = client.stream().unwrap();
    let server_stream = server.local_stream().unwrap();

    let client_side = async {
        client_stream.write_all(&upload).await.unwrap();
        client_stream.flush().await.unwrap();
        let mut got = vec![0u8; download.len()];
        client_stream.read_exact(&mut got).await.unwrap();
        got
    };
    let server_side = async {
        let mut got = vec![0u8; upload.len()];
        server_stream.read_exact(&mut got).await.unwrap();
        server_stream.write_all(&download).await.unwrap();
        server_stream.flush().await.unwrap();
        got
    };

    let (client_got, server_got) = tokio::join!(client_side, server_side);
    assert_eq!(server_got, upload);
    assert_eq!(client_got, download);

    client.disconnect().await;
    server.disconnect().await;
}

#[tokio::test]
async fn tls_handshake_and_data_flow() {
    exchange_over_tls(None).await;
}

#[tokio::test]
async fn tls_with_option_negotiation() {
    exchange_over_tls(Some(vec![0])).await;
}
