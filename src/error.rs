use std::fmt;
use std::io;

/// Errors thrown by user handler code.
///
/// Handlers are free to use any error type; the dispatcher only logs the
/// error and tears the stream down.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Possible errors from this crate.
#[derive(Debug)]
pub enum Error {
    /// A user/usage problem such as sending more bytes than a content-length header specifies.
    User(String),
    /// A wrapped std::io::Error from the underlying transport (socket).
    Io(io::Error),
    /// HTTP/1.1 parse errors from the `httparse` crate.
    Http11Parser(httparse::Error),
    /// Http errors from the `http` crate.
    Http(http::Error),
    /// TLS errors from the `rustls` crate.
    Tls(rustls::Error),
    /// Invalid server configuration.
    Config(ConfigError),
    /// The server has shut down; its listening address is no longer available.
    Closed,
}

/// Configuration problems detected before the server starts.
#[derive(Debug)]
pub enum ConfigError {
    /// A custom peer verification callback was supplied, but the transport
    /// security mode is not one of the mTLS modes.
    VerifierWithoutMtls,
    /// Backpressure watermarks must satisfy `low <= high`.
    InvalidWatermarks {
        /// Configured low watermark.
        low: usize,
        /// Configured high watermark.
        high: usize,
    },
    /// The TLS mode requires a certificate chain and none was usable.
    MissingCertificate,
    /// The private key could not be parsed or is unsupported.
    InvalidKey(String),
    /// PEM material could not be decoded.
    InvalidPem(String),
    /// The bind target host/port did not resolve to a socket address.
    InvalidBindTarget(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::User(v) => write!(f, "{}", v),
            Error::Io(v) => fmt::Display::fmt(v, f),
            Error::Http11Parser(v) => write!(f, "http11 parser: {}", v),
            Error::Http(v) => write!(f, "http api: {}", v),
            Error::Tls(v) => write!(f, "tls: {}", v),
            Error::Config(v) => write!(f, "config: {}", v),
            Error::Closed => write!(f, "server closed"),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::VerifierWithoutMtls => {
                write!(f, "custom verification callback provided when not using mTLS")
            }
            ConfigError::InvalidWatermarks { low, high } => {
                write!(f, "backpressure watermarks out of order: low {} > high {}", low, high)
            }
            ConfigError::MissingCertificate => write!(f, "no usable certificate chain"),
            ConfigError::InvalidKey(v) => write!(f, "invalid private key: {}", v),
            ConfigError::InvalidPem(v) => write!(f, "invalid pem: {}", v),
            ConfigError::InvalidBindTarget(v) => write!(f, "invalid bind target: {}", v),
        }
    }
}

impl std::error::Error for Error {}
impl std::error::Error for ConfigError {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Error::Http11Parser(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::Http(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}
