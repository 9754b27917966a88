//! Leaf-certificate issuance for intercepted hosts.
//!
//! The signing root comes from a PKCS#12 bundle. Leaves are minted per
//! pattern key (the matched literal or `*.suffix`, not the peer hostname),
//! cached until the pattern set changes, and handed out as rustls-ready
//! material.

use std::collections::HashMap;
use std::sync::Arc;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::debug;

use crate::error::{ProxyError, Result};

use super::{select_pattern, MitmSettings};

/// Leaf validity window.
const LEAF_VALIDITY_DAYS: u32 = 30;

/// Bits of serial-number entropy; at least 64 are required, more is fine.
const SERIAL_BITS: i32 = 120;

/// A minted leaf: the chain presented to clients and its private key.
pub struct CertEntry {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl CertEntry {
    /// A rustls server configuration presenting this leaf.
    pub fn server_config(&self) -> Result<rustls::ServerConfig> {
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), self.key.clone_key())?;
        Ok(config)
    }
}

struct AuthorityState {
    patterns: Vec<String>,
    entries: HashMap<String, Arc<CertEntry>>,
}

/// Signs leaves with a configured root. One mutex serializes pattern
/// changes and cache mutation, so concurrent requests for the same key
/// produce exactly one issuance.
pub struct CertAuthority {
    root_cert: X509,
    root_key: PKey<Private>,
    state: Mutex<AuthorityState>,
}

impl std::fmt::Debug for CertAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Root key material stays out of logs
        f.debug_struct("CertAuthority").finish_non_exhaustive()
    }
}

impl CertAuthority {
    /// Parse a PKCS#12 bundle. The passphrase may be empty.
    pub fn from_p12(der: &[u8], passphrase: &str, patterns: Vec<String>) -> Result<Self> {
        let parsed = Pkcs12::from_der(der)?.parse2(passphrase)?;
        let root_cert = parsed.cert.ok_or_else(|| {
            ProxyError::Certificate("PKCS#12 bundle carries no certificate".to_string())
        })?;
        let root_key = parsed.pkey.ok_or_else(|| {
            ProxyError::Certificate("PKCS#12 bundle carries no private key".to_string())
        })?;
        Ok(Self {
            root_cert,
            root_key,
            state: Mutex::new(AuthorityState {
                patterns,
                entries: HashMap::new(),
            }),
        })
    }

    /// Build from profile settings. `None` when interception is not
    /// configured; a broken bundle is an error so the misconfiguration is
    /// visible at startup.
    pub fn from_settings(settings: &MitmSettings) -> Result<Option<Self>> {
        let Some(der) = settings.root_p12.as_deref() else {
            return Ok(None);
        };
        let passphrase = settings.passphrase.as_deref().unwrap_or("");
        Ok(Some(Self::from_p12(
            der,
            passphrase,
            settings.hostnames.clone(),
        )?))
    }

    /// The leaf for a peer hostname, minted on first use.
    ///
    /// Returns `None` when no pattern covers the host; interception is
    /// disabled for that connection.
    pub fn leaf_for(&self, host: &str) -> Result<Option<Arc<CertEntry>>> {
        let mut state = self.state.lock();
        let Some(key) = select_pattern(&state.patterns, host) else {
            return Ok(None);
        };
        if let Some(entry) = state.entries.get(&key) {
            return Ok(Some(entry.clone()));
        }
        let entry = Arc::new(self.mint(&key)?);
        state.entries.insert(key.clone(), entry.clone());
        debug!(pattern = %key, host = %host, "minted interception leaf");
        Ok(Some(entry))
    }

    /// Replace the pattern set. Entries whose key disappears are dropped;
    /// survivors keep their certificate.
    pub fn reset_patterns(&self, patterns: Vec<String>) {
        let mut state = self.state.lock();
        state.entries.retain(|key, _| patterns.contains(key));
        state.patterns = patterns;
    }

    pub fn cached_len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether some pattern covers this host, without minting anything.
    pub fn has_pattern(&self, host: &str) -> bool {
        select_pattern(&self.state.lock().patterns, host).is_some()
    }

    /// Mint a leaf for a pattern key: fresh RSA-2048, v3, random serial,
    /// thirty-day validity, CN and SAN set to the key, signed by the root
    /// with SHA-256.
    fn mint(&self, key_name: &str) -> Result<CertEntry> {
        let leaf_key = PKey::from_rsa(Rsa::generate(2048)?)?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(LEAF_VALIDITY_DAYS)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.set_issuer_name(self.root_cert.subject_name())?;

        let mut subject = X509NameBuilder::new()?;
        subject.append_entry_by_text("CN", key_name)?;
        let subject = subject.build();
        builder.set_subject_name(&subject)?;

        builder.set_pubkey(&leaf_key)?;

        let san = SubjectAlternativeName::new()
            .dns(key_name)
            .build(&builder.x509v3_context(Some(&self.root_cert), None))?;
        builder.append_extension(san)?;

        builder.sign(&self.root_key, MessageDigest::sha256())?;
        let leaf = builder.build();

        let chain = vec![CertificateDer::from(leaf.to_der()?)];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            leaf_key.private_key_to_pkcs8()?,
        ));
        Ok(CertEntry { chain, key })
    }
}
