//! TLS interception end to end: CONNECT through the gateway, leaf minted
//! from the configured root, plaintext visible in between.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;

use tapgate::profile::MitmConfig;
use tapgate::{Gateway, Profile};

fn self_signed(cn: &str) -> (X509, PKey<Private>) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    let not_before = Asn1Time::days_from_now(0).unwrap();
    let not_after = Asn1Time::days_from_now(30).unwrap();
    builder.set_not_before(&not_before).unwrap();
    builder.set_not_after(&not_after).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

fn root_p12_b64(cn: &str) -> String {
    let (cert, key) = self_signed(cn);
    let der = Pkcs12::builder()
        .name(cn)
        .pkey(&key)
        .cert(&cert)
        .build2("")
        .unwrap()
        .to_der()
        .unwrap();
    base64::engine::general_purpose::STANDARD.encode(der)
}

/// TLS origin with a self-signed certificate that records the plaintext
/// request head it receives.
async fn spawn_tls_origin() -> (SocketAddr, tokio::sync::oneshot::Receiver<String>) {
    let (cert, key) = self_signed("itest origin");
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls::pki_types::CertificateDer::from(cert.to_der().unwrap())],
            rustls::pki_types::PrivateKeyDer::Pkcs8(rustls::pki_types::PrivatePkcs8KeyDer::from(
                key.private_key_to_pkcs8().unwrap(),
            )),
        )
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await.unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            tls.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let _ = tx.send(String::from_utf8(head).unwrap());

        tls.write_all(
            b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\nConnection: close\r\n\r\nsecret",
        )
        .await
        .unwrap();
        let _ = tls.shutdown().await;
    });

    (addr, rx)
}

/// Client-side verifier that records the certificate the proxy presents.
#[derive(Debug)]
struct RecordingVerifier {
    provider: Arc<rustls::crypto::CryptoProvider>,
    seen: Arc<Mutex<Option<Vec<u8>>>>,
}

impl rustls::client::danger::ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        *self.seen.lock() = Some(end_entity.as_ref().to_vec());
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[tokio::test]
async fn connect_is_intercepted_for_matching_host() {
    let (origin, origin_saw) = spawn_tls_origin().await;

    let profile = Profile {
        http_listen: Some("127.0.0.1:0".parse().unwrap()),
        rules: vec!["FINAL,DIRECT".to_string()],
        mitm: Some(MitmConfig {
            skip_cert_verify: true,
            hostnames: vec!["127.0.0.1".to_string()],
            root_p12_b64: Some(root_p12_b64("tapgate itest root")),
            passphrase: None,
        }),
        ..Default::default()
    };
    let gateway = Arc::new(Gateway::from_profile(&profile).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = listener.local_addr().unwrap();
    tokio::spawn(gateway.serve_http(listener));

    // CONNECT through the gateway
    let mut stream = TcpStream::connect(gateway_addr).await.unwrap();
    let connect = format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await.unwrap();
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    assert!(String::from_utf8(head).unwrap().starts_with("HTTP/1.1 200"));

    // TLS toward what the client believes is the origin
    let seen = Arc::new(Mutex::new(None));
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let client_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(RecordingVerifier {
            provider,
            seen: seen.clone(),
        }))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = rustls::pki_types::ServerName::try_from("127.0.0.1").unwrap();
    let mut tls = connector.connect(server_name, stream).await.unwrap();

    tls.write_all(
        b"GET /secret HTTP/1.1\r\n\
          Host: 127.0.0.1\r\n\
          Accept-Encoding: gzip\r\n\
          Connection: close\r\n\r\n",
    )
    .await
    .unwrap();

    let mut response = Vec::new();
    tls.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("secret"));

    // The origin saw decoded plaintext, with capture forcing identity
    let origin_head = origin_saw.await.unwrap();
    assert!(origin_head.starts_with("GET /secret HTTP/1.1\r\n"));
    assert!(origin_head.contains("Accept-Encoding: identity\r\n"));

    // The client was shown a gateway-minted leaf, not the origin's cert
    let presented = seen.lock().clone().expect("no certificate recorded");
    let presented = X509::from_der(&presented).unwrap();
    let cn = presented
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .unwrap()
        .data()
        .as_utf8()
        .unwrap()
        .to_string();
    assert_eq!(cn, "127.0.0.1");
    let issuer = presented
        .issuer_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .unwrap()
        .data()
        .as_utf8()
        .unwrap()
        .to_string();
    assert_eq!(issuer, "tapgate itest root");
}

#[tokio::test]
async fn non_tls_payload_falls_back_to_tunnel() {
    // Plain echo origin
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 64];
        if let Ok(n) = stream.read(&mut buf).await {
            let _ = stream.write_all(&buf[..n]).await;
        }
    });

    let profile = Profile {
        http_listen: Some("127.0.0.1:0".parse().unwrap()),
        rules: vec!["FINAL,DIRECT".to_string()],
        mitm: Some(MitmConfig {
            skip_cert_verify: true,
            hostnames: vec!["127.0.0.1".to_string()],
            root_p12_b64: Some(root_p12_b64("tapgate itest root")),
            passphrase: None,
        }),
        ..Default::default()
    };
    let gateway = Arc::new(Gateway::from_profile(&profile).unwrap());
    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = http_listener.local_addr().unwrap();
    tokio::spawn(gateway.serve_http(http_listener));

    let mut stream = TcpStream::connect(gateway_addr).await.unwrap();
    let connect = format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await.unwrap();
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }

    // Not a ClientHello: interception must stand down and tunnel instead
    stream.write_all(b"PLAIN-BYTES").await.unwrap();
    let mut echoed = [0u8; 11];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"PLAIN-BYTES");
}
