//! Transport security and ALPN selection.
//!
//! Decides between plaintext HTTP/1.1 and TLS with HTTP/1.1 ↔ HTTP/2
//! negotiation, including mutual TLS with an optional custom peer
//! verification callback. TLS mechanics themselves are rustls; this
//! module only assembles configurations and exposes the negotiation
//! outcome (protocol, peer chain) to the dispatcher.

use std::fmt;
use std::io::Cursor;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::codec::{BoxIo, ConnectionInfo};
use crate::config::{CertificateVerificationMode, TlsIdentitySource, TransportSecurityConfig};
use crate::error::{ConfigError, Error};
use crate::middleware::BoxFuture;
use crate::parts::Protocol;

/// Outcome of a custom peer verification callback.
#[derive(Debug)]
pub enum PeerVerification {
    /// The chain is acceptable.
    CertificateVerified,
    /// Reject the handshake with the given reason.
    Failed(String),
}

/// Custom verification callback for mTLS peers.
///
/// Runs after the built-in chain verification, with the certificate
/// chain the peer presented (end entity first). Providing one of these
/// in a non-mTLS mode is a configuration error.
pub trait PeerVerifier: Send + Sync + 'static {
    /// Judge the presented chain.
    fn verify(&self, chain: &[CertificateDer<'_>]) -> PeerVerification;
}

impl<F> PeerVerifier for F
where
    F: Fn(&[CertificateDer<'_>]) -> PeerVerification + Send + Sync + 'static,
{
    fn verify(&self, chain: &[CertificateDer<'_>]) -> PeerVerification {
        (self)(chain)
    }
}

/// Where a reloading transport fetches fresh key material from.
pub trait CertificateSource: Send + Sync + 'static {
    /// Fetch the current chain (leaf first) and private key.
    fn fetch(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error>;
}

/// [`CertificateSource`] reading PEM files from disk.
pub struct PemFileSource {
    chain_path: String,
    key_path: String,
}

impl PemFileSource {
    /// Read from the given chain/key paths.
    pub fn new(chain_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        PemFileSource {
            chain_path: chain_path.into(),
            key_path: key_path.into(),
        }
    }
}

impl CertificateSource for PemFileSource {
    fn fetch(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
        let chain_pem = std::fs::read(&self.chain_path)?;
        let key_pem = std::fs::read(&self.key_path)?;

        let chain = parse_chain(&chain_pem)?;
        let key = parse_key(&key_pem)?;

        Ok((chain, key))
    }
}

fn parse_chain(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, Error> {
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut Cursor::new(pem))
        .collect::<Result<_, _>>()
        .map_err(|e| ConfigError::InvalidPem(e.to_string()))?;

    if chain.is_empty() {
        return Err(ConfigError::MissingCertificate.into());
    }

    Ok(chain)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, Error> {
    rustls_pemfile::private_key(&mut Cursor::new(pem))
        .map_err(|e| ConfigError::InvalidKey(e.to_string()))?
        .ok_or_else(|| ConfigError::InvalidKey("no private key in pem".into()).into())
}

fn load_identity(
    source: &TlsIdentitySource,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    match source {
        TlsIdentitySource::Inline {
            certificate_chain,
            private_key,
        } => Ok((
            parse_chain(certificate_chain.as_bytes())?,
            parse_key(private_key.as_bytes())?,
        )),
        TlsIdentitySource::Paths {
            certificate_chain,
            private_key,
        } => PemFileSource::new(certificate_chain, private_key).fetch(),
    }
}

fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<CertifiedKey, Error> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| Error::Config(ConfigError::InvalidKey(e.to_string())))?;

    Ok(CertifiedKey::new(chain, signing_key))
}

/// Server certificate resolver whose key material can be swapped while
/// serving.
pub struct ReloadingResolver {
    current: RwLock<Arc<CertifiedKey>>,
}

impl fmt::Debug for ReloadingResolver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ReloadingResolver")
    }
}

impl ReloadingResolver {
    fn new(initial: CertifiedKey) -> Arc<Self> {
        Arc::new(ReloadingResolver {
            current: RwLock::new(Arc::new(initial)),
        })
    }

    fn reload_from(&self, source: &dyn CertificateSource) -> Result<(), Error> {
        let (chain, key) = source.fetch()?;
        let ck = certified_key(chain, key)?;

        *self.current.write().unwrap() = Arc::new(ck);

        Ok(())
    }
}

impl ResolvesServerCert for ReloadingResolver {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.current.read().unwrap().clone())
    }
}

/// Client certificate verifier that runs the built-in chain checks, then
/// hands the presented chain to a user callback.
struct CallbackVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    callback: Arc<dyn PeerVerifier>,
}

impl fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CallbackVerifier")
    }
}

impl ClientCertVerifier for CallbackVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let verified = self.inner.verify_client_cert(end_entity, intermediates, now)?;

        let mut chain = Vec::with_capacity(1 + intermediates.len());
        chain.push(end_entity.clone());
        chain.extend(intermediates.iter().cloned());

        match self.callback.verify(&chain) {
            PeerVerification::CertificateVerified => Ok(verified),
            PeerVerification::Failed(reason) => {
                debug!("Peer verification callback rejected chain: {}", reason);
                Err(rustls::Error::General(reason))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn client_verifier(
    trust_roots: &Option<Vec<String>>,
    mode: CertificateVerificationMode,
    callback: Option<Arc<dyn PeerVerifier>>,
) -> Result<Arc<dyn ClientCertVerifier>, Error> {
    let mut roots = RootCertStore::empty();

    match trust_roots {
        Some(pems) => {
            for pem in pems {
                for cert in parse_chain(pem.as_bytes())? {
                    roots
                        .add(cert)
                        .map_err(|e| ConfigError::InvalidPem(e.to_string()))?;
                }
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for e in &native.errors {
                debug!("Skipping unusable system root: {}", e);
            }
            for cert in native.certs {
                // ignore individual unusable system roots.
                roots.add(cert).ok();
            }
        }
    }

    if roots.is_empty() {
        return Err(ConfigError::MissingCertificate.into());
    }

    let builder = WebPkiClientVerifier::builder(Arc::new(roots));

    let inner = match mode {
        CertificateVerificationMode::OptionalVerification => {
            builder.allow_unauthenticated().build()
        }
        CertificateVerificationMode::NoHostnameVerification => builder.build(),
    }
    .map_err(|e| Error::Config(ConfigError::InvalidPem(e.to_string())))?;

    Ok(match callback {
        Some(callback) => Arc::new(CallbackVerifier { inner, callback }),
        None => inner,
    })
}

/// Listener-side transport: plaintext, or a TLS acceptor built from the
/// configured security mode.
pub(crate) struct Transport {
    acceptor: Option<TlsAcceptor>,
}

/// A built transport plus the background certificate refresh work the
/// reloading modes need.
pub(crate) struct TransportBuild {
    pub transport: Transport,
    pub reload: Option<BoxFuture<'static, ()>>,
}

impl fmt::Debug for TransportBuild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBuild").finish_non_exhaustive()
    }
}

impl Transport {
    /// Assemble the transport for a security mode.
    ///
    /// `alpn` is the protocol offer list derived from the registered
    /// codecs, most preferred first. A custom verification callback is
    /// only legal in the mTLS modes.
    pub fn build(
        security: &TransportSecurityConfig,
        verifier: Option<Arc<dyn PeerVerifier>>,
        alpn: Vec<Vec<u8>>,
    ) -> Result<TransportBuild, Error> {
        if verifier.is_some() && !security.is_mtls() {
            return Err(ConfigError::VerifierWithoutMtls.into());
        }

        let builder = rustls::ServerConfig::builder();

        let (mut config, reload) = match security {
            TransportSecurityConfig::Plaintext => {
                return Ok(TransportBuild {
                    transport: Transport { acceptor: None },
                    reload: None,
                });
            }

            TransportSecurityConfig::Tls { identity } => {
                let (chain, key) = load_identity(identity)?;
                let config = builder
                    .with_no_client_auth()
                    .with_single_cert(chain, key)?;
                (config, None)
            }

            TransportSecurityConfig::ReloadingTls { identity, .. } => {
                let (resolver, reload) =
                    reloading_resolver(identity, security.refresh_interval())?;
                let config = builder.with_no_client_auth().with_cert_resolver(resolver);
                (config, reload)
            }

            TransportSecurityConfig::Mtls {
                identity,
                trust_roots,
                certificate_verification_mode,
            } => {
                let (chain, key) = load_identity(identity)?;
                let v = client_verifier(trust_roots, *certificate_verification_mode, verifier)?;
                let config = builder
                    .with_client_cert_verifier(v)
                    .with_single_cert(chain, key)?;
                (config, None)
            }

            TransportSecurityConfig::ReloadingMtls {
                identity,
                trust_roots,
                certificate_verification_mode,
                ..
            } => {
                let (resolver, reload) =
                    reloading_resolver(identity, security.refresh_interval())?;
                let v = client_verifier(trust_roots, *certificate_verification_mode, verifier)?;
                let config = builder
                    .with_client_cert_verifier(v)
                    .with_cert_resolver(resolver);
                (config, reload)
            }
        };

        config.alpn_protocols = alpn;

        Ok(TransportBuild {
            transport: Transport {
                acceptor: Some(TlsAcceptor::from(Arc::new(config))),
            },
            reload,
        })
    }

    /// Turn an accepted TCP stream into a transport stream: TLS
    /// handshake (when configured), ALPN outcome, peer chain.
    pub async fn establish(&self, tcp: TcpStream) -> Result<(BoxIo, ConnectionInfo), Error> {
        let peer_addr = tcp.peer_addr().ok();
        let local_addr = tcp.local_addr().ok();

        let acceptor = match &self.acceptor {
            None => {
                let info = ConnectionInfo {
                    peer_addr,
                    local_addr,
                    protocol: Protocol::Http1,
                    tls: false,
                    peer_certificates: None,
                };
                return Ok((Box::new(tcp), info));
            }
            Some(v) => v,
        };

        let stream = acceptor.accept(tcp).await?;

        let (_, conn) = stream.get_ref();

        // no client ALPN, or plain http/1.1, both land on HTTP/1.1.
        let protocol = conn
            .alpn_protocol()
            .and_then(Protocol::from_alpn)
            .unwrap_or(Protocol::Http1);

        let peer_certificates = conn.peer_certificates().map(|c| c.to_vec());

        debug!(
            "TLS established, protocol {:?}, client cert: {}",
            protocol,
            peer_certificates.is_some()
        );

        let info = ConnectionInfo {
            peer_addr,
            local_addr,
            protocol,
            tls: true,
            peer_certificates,
        };

        Ok((Box::new(stream), info))
    }
}

fn reloading_resolver(
    identity: &TlsIdentitySource,
    every: Option<Duration>,
) -> Result<(Arc<ReloadingResolver>, Option<BoxFuture<'static, ()>>), Error> {
    let source: Arc<dyn CertificateSource> = match identity {
        TlsIdentitySource::Paths {
            certificate_chain,
            private_key,
        } => Arc::new(PemFileSource::new(certificate_chain, private_key)),
        TlsIdentitySource::Inline { .. } => {
            return Err(ConfigError::InvalidPem(
                "reloading TLS requires path based key material".into(),
            )
            .into());
        }
    };

    let (chain, key) = source.fetch()?;
    let resolver = ReloadingResolver::new(certified_key(chain, key)?);

    let every = every.unwrap_or(Duration::from_secs(30));

    let reload = {
        let resolver = resolver.clone();
        Box::pin(async move {
            let mut interval = tokio::time::interval(every);
            // the first tick fires immediately and we already loaded.
            interval.tick().await;

            loop {
                interval.tick().await;
                match resolver.reload_from(&*source) {
                    Ok(()) => trace!("Reloaded server certificate"),
                    Err(e) => warn!("Certificate reload failed: {}", e),
                }
            }
        }) as BoxFuture<'static, ()>
    };

    Ok((resolver, Some(reload)))
}


#[cfg(test)]
mod tests {
    use super::*;

    fn inline_identity(pki: &test_pki::TestPki) -> TlsIdentitySource {
        TlsIdentitySource::Inline {
            certificate_chain: pki.server_chain_pem.clone(),
            private_key: pki.server_key_pem.clone(),
        }
    }

    #[test]
    fn tls_transport_builds_from_inline_pem() {
        let pki = test_pki::generate();

        let build = Transport::build(
            &TransportSecurityConfig::Tls {
                identity: inline_identity(&pki),
            },
            None,
            vec![b"http/1.1".to_vec()],
        )
        .unwrap();

        assert!(build.transport.acceptor.is_some());
        assert!(build.reload.is_none());
    }

    #[test]
    fn plaintext_has_no_acceptor() {
        let build =
            Transport::build(&TransportSecurityConfig::Plaintext, None, vec![]).unwrap();

        assert!(build.transport.acceptor.is_none());
    }

    #[test]
    fn mtls_transport_builds_with_explicit_roots() {
        let pki = test_pki::generate();

        let build = Transport::build(
            &TransportSecurityConfig::Mtls {
                identity: inline_identity(&pki),
                trust_roots: Some(vec![pki.ca_pem.clone()]),
                certificate_verification_mode: CertificateVerificationMode::OptionalVerification,
            },
            Some(Arc::new(|_chain: &[CertificateDer<'_>]| {
                PeerVerification::CertificateVerified
            })),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        )
        .unwrap();

        assert!(build.transport.acceptor.is_some());
    }

    #[test]
    fn verifier_outside_mtls_is_a_config_error() {
        let pki = test_pki::generate();

        let err = Transport::build(
            &TransportSecurityConfig::Tls {
                identity: inline_identity(&pki),
            },
            Some(Arc::new(|_chain: &[CertificateDer<'_>]| {
                PeerVerification::CertificateVerified
            })),
            vec![],
        )
        .unwrap_err();

        assert!(matches!(
            err,
            Error::Config(ConfigError::VerifierWithoutMtls)
        ));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let err = Transport::build(
            &TransportSecurityConfig::Tls {
                identity: TlsIdentitySource::Inline {
                    certificate_chain: "not a pem".into(),
                    private_key: "not a key".into(),
                },
            },
            None,
            vec![],
        )
        .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
    }
}
