use thiserror::Error;

/// Proxy gateway error types
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("unsupported protocol version: {0:#04x}")]
    InvalidProtocolVersion(u8),

    #[error("non-zero reserved byte: {0:#04x}")]
    InvalidReservedByte(u8),

    #[error("unknown address type: {0:#04x}")]
    InvalidAddressType(u8),

    #[error("address not encodable: {0}")]
    InvalidAddress(String),

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("authentication required")]
    AuthRequired,

    #[error("bad credentials")]
    BadCredentials,

    #[error("SOCKS request failed: {}", crate::codec::reply_reason(*.0))]
    ReplyFailed(u8),

    #[error("unexpected response from upstream proxy: {0}")]
    InvalidProxyResponse(String),

    #[error("malformed HTTP message: {0}")]
    MalformedHttp(String),

    #[error("HTTP protocol misuse: {0}")]
    ProtocolMisuse(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("connection rejected by policy: {0}")]
    Rejected(String),

    #[error("operation inappropriate for state: {0}")]
    InvalidState(&'static str),

    #[error("rule parse error at line {line}: {message}")]
    ParseErrorAtLine { line: usize, message: String },

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("invalid external resource: {0}")]
    Resource(String),

    #[error("GeoIP error: {0}")]
    GeoError(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<openssl::error::ErrorStack> for ProxyError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        ProxyError::Certificate(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
