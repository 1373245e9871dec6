#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Once};

use scoped_http::{Error, HandlerError, HttpServerConfig, RequestScope, Server, ServerBuilder};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

pub fn setup_logger() {
    static START: Once = Once::new();
    START.call_once(|| {
        let test_log = std::env::var("TEST_LOG")
            .map(|x| x != "0" && x.to_lowercase() != "false")
            .unwrap_or(false);
        let level = if test_log {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        };
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Warn)
            .filter_module("scoped_http", level)
            .target(pretty_env_logger::env_logger::Target::Stdout)
            .init();
    });
}

pub fn plaintext_config() -> HttpServerConfig {
    serde_json::from_str(r#"{ "bindTarget": { "host": "127.0.0.1", "port": 0 } }"#).unwrap()
}

/// Bind a server and run `handler` until the returned server is shut down.
pub async fn serve<F, Fut>(
    builder: ServerBuilder,
    handler: F,
) -> (Arc<Server>, SocketAddr, JoinHandle<Result<(), Error>>)
where
    F: Fn(RequestScope) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    setup_logger();

    let server = Arc::new(builder.bind().await.expect("bind"));
    let addr = server.local_addr().expect("local_addr");

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(handler).await })
    };

    (server, addr, serving)
}

/// Read from the socket until the response head's terminating CRLFCRLF.
pub async fn read_header(tcp: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut one = [0_u8; 1];

    loop {
        let n = tcp.read(&mut one).await.expect("read head byte");
        assert!(n > 0, "EOF inside response head: {:?}", buf);
        buf.push(one[0]);

        if buf.ends_with(b"\r\n\r\n") {
            return String::from_utf8(buf).expect("utf8 head");
        }
    }
}

/// Read until the peer closes the connection.
pub async fn read_until_closed(tcp: &mut TcpStream) -> Vec<u8> {
    let mut all = Vec::new();
    tcp.read_to_end(&mut all).await.expect("read to end");
    all
}

/// Self-signed PKI material for the TLS tests.
pub struct TestPki {
    pub ca_pem: String,
    pub server_chain_pem: String,
    pub server_key_pem: String,
    pub client_chain_pem: String,
    pub client_key_pem: String,
}

pub fn generate_pki() -> TestPki {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "scoped-http test CA");
    ca_params.distinguished_name = dn;

    let ca_key = KeyPair::generate().unwrap();
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let mut server_params = CertificateParams::new(vec!["localhost".into()]).unwrap();
    server_params
        .subject_alt_names
        .push(rcgen::SanType::IpAddress("127.0.0.1".parse().unwrap()));
    let server_key = KeyPair::generate().unwrap();
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .unwrap();

    let client_params = CertificateParams::new(vec!["client.test".into()]).unwrap();
    let client_key = KeyPair::generate().unwrap();
    let client_cert = client_params
        .signed_by(&client_key, &ca_cert, &ca_key)
        .unwrap();

    TestPki {
        ca_pem: ca_cert.pem(),
        server_chain_pem: format!("{}{}", server_cert.pem(), ca_cert.pem()),
        server_key_pem: server_key.serialize_pem(),
        client_chain_pem: client_cert.pem(),
        client_key_pem: client_key.serialize_pem(),
    }
}
