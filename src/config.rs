//! Server configuration model.
//!
//! All types deserialize with serde from the `httpServer.*` configuration
//! tree (camelCase keys). Configuration is immutable once the server is
//! constructed; numeric HTTP/2 tunables are clamped to their legal ranges
//! at that point rather than rejected.

use serde::Deserialize;
use std::time::Duration;

use crate::error::ConfigError;

/// Top level configuration for one server (`httpServer.*`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpServerConfig {
    /// Host and port to bind.
    pub bind_target: BindTarget,
    /// Transport security selection. Defaults to plaintext.
    #[serde(default)]
    pub transport_security: TransportSecurityConfig,
    /// Low/high watermarks for the per-stream part channels.
    #[serde(default, rename = "backpressureStrategy")]
    pub backpressure: Watermarks,
    /// HTTP/2 tunables handed to the HTTP/2 codec collaborator.
    #[serde(default)]
    pub http2: Http2Settings,
}

impl HttpServerConfig {
    /// Validate invariants and clamp tunables into their legal ranges.
    pub fn normalize(mut self) -> Result<Self, ConfigError> {
        self.backpressure.validate()?;
        self.http2 = self.http2.clamped();
        Ok(self)
    }
}

/// Where to bind the listening socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindTarget {
    /// Host name or literal v4/v6 address.
    pub host: String,
    /// TCP port. `0` asks the OS for an ephemeral port.
    pub port: u16,
}

/// Backpressure watermarks for the buffered part channels.
///
/// The producing side of a channel pauses when the number of buffered
/// elements reaches `high` and resumes once it drops below `low`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Watermarks {
    /// Resume threshold.
    #[serde(default = "default_low")]
    pub low: usize,
    /// Pause threshold.
    #[serde(default = "default_high")]
    pub high: usize,
}

fn default_low() -> usize {
    2
}

fn default_high() -> usize {
    10
}

impl Default for Watermarks {
    fn default() -> Self {
        Watermarks {
            low: default_low(),
            high: default_high(),
        }
    }
}

impl Watermarks {
    /// Check `low <= high`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.low > self.high {
            return Err(ConfigError::InvalidWatermarks {
                low: self.low,
                high: self.high,
            });
        }
        Ok(())
    }
}

/// Smallest legal HTTP/2 frame size (2^14), also the default.
pub const H2_MIN_FRAME_SIZE: u32 = 1 << 14;
/// Largest legal HTTP/2 frame size (2^24 - 1).
pub const H2_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;
/// Largest legal HTTP/2 flow control window (2^31 - 1).
pub const H2_MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// HTTP/2 settings applied by the transport selector when `h2` is
/// negotiated. The values are clamped, not rejected.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Http2Settings {
    /// SETTINGS_MAX_FRAME_SIZE, clamped to `[2^14, 2^24 - 1]`.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,
    /// Initial flow control window, clamped to `[0, 2^31 - 1]`.
    #[serde(default = "default_target_window_size")]
    pub target_window_size: u32,
    /// SETTINGS_MAX_CONCURRENT_STREAMS. Unlimited when absent.
    #[serde(default)]
    pub max_concurrent_streams: Option<u32>,
}

fn default_max_frame_size() -> u32 {
    H2_MIN_FRAME_SIZE
}

fn default_target_window_size() -> u32 {
    (1 << 16) - 1
}

impl Default for Http2Settings {
    fn default() -> Self {
        Http2Settings {
            max_frame_size: default_max_frame_size(),
            target_window_size: default_target_window_size(),
            max_concurrent_streams: None,
        }
    }
}

impl Http2Settings {
    /// Clamp both tunables into their legal ranges.
    pub fn clamped(self) -> Self {
        Http2Settings {
            max_frame_size: self.max_frame_size.clamp(H2_MIN_FRAME_SIZE, H2_MAX_FRAME_SIZE),
            target_window_size: self.target_window_size.min(H2_MAX_WINDOW_SIZE),
            max_concurrent_streams: self.max_concurrent_streams,
        }
    }
}

/// Transport security selection (`httpServer.transportSecurity`).
///
/// The PEM material is either inlined (`...PEMString`) or read from disk
/// (`...PEMPath`); the reloading variants re-read the disk material every
/// `refreshInterval` seconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "security", rename_all = "camelCase")]
pub enum TransportSecurityConfig {
    /// No TLS; HTTP/1.1 only.
    #[default]
    Plaintext,
    /// TLS with a static key and chain.
    #[serde(rename_all = "camelCase")]
    Tls {
        /// Identity for the handshake.
        #[serde(flatten)]
        identity: TlsIdentitySource,
    },
    /// TLS re-reading the key and chain periodically.
    #[serde(rename = "reloadingTLS", rename_all = "camelCase")]
    ReloadingTls {
        /// Identity for the handshake; must be path-based.
        #[serde(flatten)]
        identity: TlsIdentitySource,
        /// Seconds between reloads.
        #[serde(default = "default_refresh_interval")]
        refresh_interval: u64,
    },
    /// Mutual TLS with a static key and chain.
    #[serde(rename = "mTLS", rename_all = "camelCase")]
    Mtls {
        /// Identity for the handshake.
        #[serde(flatten)]
        identity: TlsIdentitySource,
        /// PEM encoded trust roots for client certificates. System roots
        /// when absent.
        #[serde(default)]
        trust_roots: Option<Vec<String>>,
        /// How strictly to verify the client certificate.
        #[serde(default)]
        certificate_verification_mode: CertificateVerificationMode,
    },
    /// Mutual TLS re-reading the key and chain periodically.
    #[serde(rename = "reloadingMTLS", rename_all = "camelCase")]
    ReloadingMtls {
        /// Identity for the handshake; must be path-based.
        #[serde(flatten)]
        identity: TlsIdentitySource,
        /// Seconds between reloads.
        #[serde(default = "default_refresh_interval")]
        refresh_interval: u64,
        /// PEM encoded trust roots for client certificates. System roots
        /// when absent.
        #[serde(default)]
        trust_roots: Option<Vec<String>>,
        /// How strictly to verify the client certificate.
        #[serde(default)]
        certificate_verification_mode: CertificateVerificationMode,
    },
}

fn default_refresh_interval() -> u64 {
    30
}

impl TransportSecurityConfig {
    /// True for the `mTLS` and `reloadingMTLS` modes.
    pub fn is_mtls(&self) -> bool {
        matches!(
            self,
            TransportSecurityConfig::Mtls { .. } | TransportSecurityConfig::ReloadingMtls { .. }
        )
    }

    /// True for anything but `plaintext`.
    pub fn is_tls(&self) -> bool {
        !matches!(self, TransportSecurityConfig::Plaintext)
    }

    /// Reload interval for the reloading modes.
    pub fn refresh_interval(&self) -> Option<Duration> {
        match self {
            TransportSecurityConfig::ReloadingTls { refresh_interval, .. }
            | TransportSecurityConfig::ReloadingMtls { refresh_interval, .. } => {
                Some(Duration::from_secs(*refresh_interval))
            }
            _ => None,
        }
    }
}

/// Where the server's own certificate chain and private key come from.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TlsIdentitySource {
    /// Inline PEM strings.
    Inline {
        /// PEM encoded certificate chain, leaf first.
        #[serde(rename = "certificateChainPEMString")]
        certificate_chain: String,
        /// PEM encoded private key.
        #[serde(rename = "privateKeyPEMString")]
        private_key: String,
    },
    /// PEM files on disk.
    Paths {
        /// Path to the PEM encoded certificate chain, leaf first.
        #[serde(rename = "certificateChainPEMPath")]
        certificate_chain: String,
        /// Path to the PEM encoded private key.
        #[serde(rename = "privateKeyPEMPath")]
        private_key: String,
    },
}

/// How client certificates are verified in the mTLS modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CertificateVerificationMode {
    /// A client certificate is verified when presented, but a client
    /// without one is still accepted.
    #[default]
    OptionalVerification,
    /// A client certificate is required and chain-verified, but no
    /// hostname checks are applied to it.
    NoHostnameVerification,
}
