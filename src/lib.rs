//! tapgate - an intercepting proxy gateway
//!
//! This library accepts client connections over SOCKS5 and HTTP/1.1
//! (including the CONNECT tunnel), selects an upstream transport based on
//! routing rules, and relays traffic bidirectionally. For selected
//! hostnames it can terminate TLS with a leaf certificate signed by a
//! configured root, re-encrypt toward the origin, and log the plaintext
//! HTTP exchanges in between.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tapgate::{Gateway, Profile};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> tapgate::Result<()> {
//!     let profile = Profile::from_json_str(
//!         r#"{
//!             "socks_listen": "127.0.0.1:1080",
//!             "http_listen": "127.0.0.1:8080",
//!             "rules": [
//!                 "DOMAIN-SUFFIX,apple.com,corp",
//!                 "IP-CIDR,10.0.0.0/8,DIRECT",
//!                 "FINAL,DIRECT"
//!             ],
//!             "policies": {
//!                 "corp": { "type": "socks5", "address": "10.1.1.1:1080" }
//!             }
//!         }"#,
//!     )?;
//!     Arc::new(Gateway::from_profile(&profile)?).run().await
//! }
//! ```
//!
//! # Rule Syntax
//!
//! One rule per line, first match wins, `FINAL` closes the list:
//!
//! ```text
//! DOMAIN,api.example.com,corp
//! DOMAIN-SUFFIX,apple.com,corp     // and subdomains
//! DOMAIN-KEYWORD,tracker,REJECT
//! DOMAIN-SET,https://example.com/ads.list,REJECT
//! IP-CIDR,192.168.0.0/16,DIRECT
//! GEOIP,CN,DIRECT
//! RULE-SET,file:///etc/tapgate/extra.list,corp
//! # DOMAIN,disabled.example.com,DIRECT
//! FINAL,DIRECT
//! ```

pub mod address;
pub mod codec;
pub mod error;
pub mod geo;
pub mod http;
pub mod mitm;
pub mod outbound;
pub mod pipeline;
pub mod profile;
pub mod relay;
pub mod rules;
pub mod socks;

// Re-export commonly used items
pub use address::{Address, CidrRange};
pub use error::{ProxyError, Result};
pub use geo::GeoDb;
pub use mitm::{CertAuthority, MitmSettings};
pub use outbound::{Direct, HttpConnectProxy, Outbound, ProxyStream, Reject, Socks5Proxy};
pub use pipeline::Gateway;
pub use profile::{OutboundMode, PolicyConfig, Profile};
pub use rules::{parse_rules, Destination, Rule, RuleKind, RuleTable};
