//! The profile a host hands to the gateway: listeners, rules, egress
//! policies, and interception settings.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use base64::Engine;
use serde::Deserialize;

use crate::error::{ProxyError, Result};
use crate::mitm::MitmSettings;

/// How egress is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundMode {
    /// Everything dials directly.
    Direct,
    /// Everything uses the policy named by `global_policy`.
    Global,
    /// The rule table decides.
    #[default]
    Rule,
}

/// Credentials required from downstream clients on both listeners.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// A named upstream proxy.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PolicyConfig {
    Socks5 {
        address: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    Http {
        address: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
}

/// Interception section of the profile.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MitmConfig {
    #[serde(default)]
    pub skip_cert_verify: bool,
    #[serde(default)]
    pub hostnames: Vec<String>,
    /// Base64 of the PKCS#12 bundle with the signing root.
    #[serde(default)]
    pub root_p12_b64: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl MitmConfig {
    pub fn to_settings(&self) -> Result<MitmSettings> {
        let root_p12 = match &self.root_p12_b64 {
            Some(b64) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(b64.trim())
                    .map_err(|e| {
                        ProxyError::Config(format!("root_p12_b64 is not valid base64: {}", e))
                    })?,
            ),
            None => None,
        };
        Ok(MitmSettings {
            skip_cert_verify: self.skip_cert_verify,
            hostnames: self.hostnames.clone(),
            root_p12,
            passphrase: self.passphrase.clone(),
        })
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub socks_listen: Option<SocketAddr>,
    #[serde(default)]
    pub http_listen: Option<SocketAddr>,
    /// Rule lines in the text form, evaluated top to bottom.
    #[serde(default)]
    pub rules: Vec<String>,
    /// Named upstream proxies referenced by rule policies.
    #[serde(default)]
    pub policies: HashMap<String, PolicyConfig>,
    #[serde(default)]
    pub mitm: Option<MitmConfig>,
    #[serde(default)]
    pub outbound_mode: OutboundMode,
    /// Policy every connection uses in `global` mode.
    #[serde(default)]
    pub global_policy: Option<String>,
    #[serde(default)]
    pub authentication: Option<Credentials>,
    /// Directory holding downloaded external rule resources.
    #[serde(default)]
    pub resource_dir: Option<PathBuf>,
    /// MaxMind database for GEOIP rules.
    #[serde(default)]
    pub geoip_database: Option<PathBuf>,
}

impl Profile {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let profile: Profile = serde_json::from_str(json)
            .map_err(|e| ProxyError::Config(format!("invalid profile: {}", e)))?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ProxyError::Config(format!(
                "failed to read profile {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json_str(&text)
    }

    /// Startup validation of settings that cannot fail late.
    pub fn validate(&self) -> Result<()> {
        if self.socks_listen.is_none() && self.http_listen.is_none() {
            return Err(ProxyError::Config(
                "no listener configured: set socks_listen and/or http_listen".to_string(),
            ));
        }
        if self.outbound_mode == OutboundMode::Global && self.global_policy.is_none() {
            return Err(ProxyError::Config(
                "outbound_mode is global but global_policy is not set".to_string(),
            ));
        }
        if let Some(mitm) = &self.mitm {
            if !mitm.hostnames.is_empty() && mitm.root_p12_b64.is_none() {
                return Err(ProxyError::Config(
                    "mitm hostnames configured without a root PKCS#12 bundle".to_string(),
                ));
            }
        }
        Ok(())
    }
}
