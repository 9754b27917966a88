//! TLS interception: settings and hostname patterns, the certificate
//! authority that mints leaves, ClientHello detection, and plaintext
//! capture.

pub mod authority;
pub mod capture;
pub mod detect;

pub use authority::{CertAuthority, CertEntry};
pub use detect::{is_tls_client_hello, sniff};

/// Interception settings carried by the profile.
#[derive(Debug, Clone, Default)]
pub struct MitmSettings {
    /// Accept any certificate from the origin side.
    pub skip_cert_verify: bool,
    /// Hostname patterns selected for interception: literals or `*.suffix`.
    pub hostnames: Vec<String>,
    /// DER bytes of the PKCS#12 bundle holding the signing root.
    pub root_p12: Option<Vec<u8>>,
    /// Bundle passphrase; absent means empty.
    pub passphrase: Option<String>,
}

impl MitmSettings {
    /// Whether interception can run at all.
    pub fn usable(&self) -> bool {
        self.root_p12.is_some() && !self.hostnames.is_empty()
    }
}

/// Pick the pattern key for a peer hostname. Exact literals win over
/// `*.suffix` wildcards; a wildcard needs the dot, so `*.example.com`
/// covers `api.example.com` but not `example.com` itself.
pub fn select_pattern(patterns: &[String], host: &str) -> Option<String> {
    if let Some(exact) = patterns
        .iter()
        .find(|p| !p.starts_with("*.") && p.eq_ignore_ascii_case(host))
    {
        return Some(exact.clone());
    }
    patterns
        .iter()
        .filter(|p| p.starts_with("*."))
        .find(|p| {
            let dot_suffix = &p[1..]; // ".suffix"
            host.len() > dot_suffix.len()
                && host
                    .to_ascii_lowercase()
                    .ends_with(&dot_suffix.to_ascii_lowercase())
        })
        .cloned()
}
