//! TLS handshake, ALPN selection, and slot reclamation

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use http::{Response, StatusCode};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use hearth::{Handler, MuxFactory, ResponseBody, Server, ServerEngine, ServerOptions};

fn hello_handler() -> Handler {
    Handler::new(|_req| async {
        Ok::<_, std::convert::Infallible>(
            Response::builder()
                .status(StatusCode::OK)
                .body(ResponseBody::from("hello"))
                .unwrap(),
        )
    })
}

/// Self-signed material for localhost
struct TestCert {
    cert_der: CertificateDer<'static>,
    key_der: PrivateKeyDer<'static>,
    cert_pem: String,
    key_pem: String,
}

fn test_cert() -> TestCert {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("certificate generation should succeed");
    TestCert {
        cert_der: generated.cert.der().clone(),
        key_der: PrivateKeyDer::Pkcs8(generated.key_pair.serialize_der().into()),
        cert_pem: generated.cert.pem(),
        key_pem: generated.key_pair.serialize_pem(),
    }
}

/// Accepts any server certificate; the tests own both endpoints
#[derive(Debug)]
struct AcceptAnyCert(rustls::crypto::CryptoProvider);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn client_config(alpn: &[&[u8]]) -> Arc<rustls::ClientConfig> {
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(
            rustls::crypto::ring::default_provider(),
        )))
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

async fn tls_connect(
    server: &Server,
    alpn: &[&[u8]],
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let tcp = TcpStream::connect(server.local_addr()).await.unwrap();
    TlsConnector::from(client_config(alpn))
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .expect("TLS handshake should succeed")
}

#[tokio::test]
async fn test_tls_exchange_round_trip() {
    let cert = test_cert();
    let mut cert_file = tempfile::NamedTempFile::new().unwrap();
    cert_file.write_all(cert.cert_pem.as_bytes()).unwrap();
    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file.write_all(cert.key_pem.as_bytes()).unwrap();

    let server = ServerEngine::start(
        ServerOptions::new(hello_handler())
            .with_tls_pem(cert_file.path().to_path_buf(), key_file.path().to_path_buf()),
    )
    .await
    .unwrap();

    let mut tls = tls_connect(&server, &[b"http/1.1"]).await;
    tls.write_all(b"GET / HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    tls.read_to_end(&mut response).await.ok();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.ends_with("hello"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_h2_negotiated_while_disabled_fails_connection() {
    // an externally built config offering h2 even though multiplexing is
    // off: the engine must fail the connection, not silently downgrade
    let cert = test_cert();
    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.cert_der.clone()], cert.key_der)
        .unwrap();
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let server = ServerEngine::start(
        ServerOptions::new(hello_handler()).with_tls_config(Arc::new(server_config)),
    )
    .await
    .unwrap();

    let mut tls = tls_connect(&server, &[b"h2"]).await;
    assert_eq!(
        tls.get_ref().1.alpn_protocol(),
        Some(&b"h2"[..]),
        "the peer negotiated h2"
    );

    // the engine closes without any response bytes
    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(2), tls.read(&mut buf))
        .await
        .expect("close should arrive in time");
    assert!(matches!(read, Ok(0) | Err(_)), "expected closed connection");

    server.shutdown().await;
}

#[tokio::test]
async fn test_stalled_handshake_releases_slot() {
    let cert = test_cert();
    let mut cert_file = tempfile::NamedTempFile::new().unwrap();
    cert_file.write_all(cert.cert_pem.as_bytes()).unwrap();
    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file.write_all(cert.key_pem.as_bytes()).unwrap();

    let server = ServerEngine::start(
        ServerOptions::new(hello_handler())
            .with_tls_pem(cert_file.path().to_path_buf(), key_file.path().to_path_buf())
            .with_max_connections(1)
            .with_idle_timeout(Duration::from_millis(200)),
    )
    .await
    .unwrap();

    // occupy the only slot with a connection that never handshakes
    let mut stalled = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), stalled.read(&mut buf))
        .await
        .expect("idle deadline should cut the handshake off");
    assert!(matches!(read, Ok(0) | Err(_)));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // the slot is back: a well-behaved client completes an exchange
    let mut tls = tls_connect(&server, &[b"http/1.1"]).await;
    tls.write_all(b"GET / HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tls.read_to_end(&mut response).await.ok();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_h2_with_multiplexing_runs_the_mux_driver() {
    let cert = test_cert();
    let mut cert_file = tempfile::NamedTempFile::new().unwrap();
    cert_file.write_all(cert.cert_pem.as_bytes()).unwrap();
    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file.write_all(cert.key_pem.as_bytes()).unwrap();

    let mux = MuxFactory::new(|mut io, ctx| async move {
        assert!(ctx.is_secure());
        io.write_all(b"mux driver engaged").await?;
        io.shutdown().await?;
        Ok(())
    });

    let server = ServerEngine::start(
        ServerOptions::new(hello_handler())
            .with_tls_pem(cert_file.path().to_path_buf(), key_file.path().to_path_buf())
            .with_multiplexing(mux),
    )
    .await
    .unwrap();

    let mut tls = tls_connect(&server, &[b"h2"]).await;
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));

    let mut response = Vec::new();
    tls.read_to_end(&mut response).await.ok();
    assert_eq!(response, b"mux driver engaged");

    server.shutdown().await;
}
