//! The per-connection orchestrator.
//!
//! One builder assembles every handler stack: SOCKS5 and HTTP ingress,
//! rule-based egress selection, pure tunnels, and TLS interception with
//! capture.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::error::{ProxyError, Result};
use crate::geo::GeoDb;
use crate::http;
use crate::mitm::{self, CertAuthority};
use crate::outbound::{
    Direct, HttpConnectProxy, Outbound, PrefixedStream, ProxyStream, Reject, Socks5Proxy,
};
use crate::profile::{OutboundMode, PolicyConfig, Profile};
use crate::relay;
use crate::rules::{
    parse_rules, Destination, Rule, RuleKind, RuleParser, RuleTable, ResourceLoader,
    SystemResolver, DEFAULT_DECISION_CACHE,
};
use crate::socks;

/// The assembled gateway. Shared across connection tasks via `Arc`.
pub struct Gateway {
    socks_listen: Option<SocketAddr>,
    http_listen: Option<SocketAddr>,
    socks_auth: Option<socks::ServerAuth>,
    http_auth: Option<http::ProxyAuth>,
    mode: OutboundMode,
    global_policy: Option<String>,
    table: RuleTable,
    outbounds: HashMap<String, Arc<dyn Outbound>>,
    authority: Option<CertAuthority>,
    tls_verified: Arc<rustls::ClientConfig>,
    tls_insecure: Arc<rustls::ClientConfig>,
    skip_cert_verify: bool,
}

impl Gateway {
    /// Build the gateway from a validated profile: load resources, compile
    /// the rule table, resolve policy names, and parse the MitM root.
    pub fn from_profile(profile: &Profile) -> Result<Self> {
        profile.validate()?;

        let geo = Arc::new(match &profile.geoip_database {
            Some(path) => GeoDb::open(path)?,
            None => GeoDb::empty(),
        });

        let rules = if profile.rules.is_empty() {
            parse_rules("FINAL,DIRECT")?
        } else {
            let text = profile.rules.join("\n");
            match &profile.resource_dir {
                Some(dir) => RuleParser::with_loader(ResourceLoader::new(dir)).parse(&text)?,
                None => parse_rules(&text)?,
            }
        };

        let mut outbounds: HashMap<String, Arc<dyn Outbound>> = HashMap::new();
        for (name, config) in &profile.policies {
            let outbound: Arc<dyn Outbound> = match config {
                PolicyConfig::Socks5 {
                    address,
                    username,
                    password,
                } => match (username, password) {
                    (Some(user), Some(pass)) => {
                        Arc::new(Socks5Proxy::with_auth(address.clone(), user, pass)?)
                    }
                    _ => Arc::new(Socks5Proxy::new(address.clone())),
                },
                PolicyConfig::Http {
                    address,
                    username,
                    password,
                } => match (username, password) {
                    (Some(user), Some(pass)) => {
                        Arc::new(HttpConnectProxy::with_auth(address.clone(), user, pass))
                    }
                    _ => Arc::new(HttpConnectProxy::new(address.clone())),
                },
            };
            outbounds.insert(name.to_lowercase(), outbound);
        }
        outbounds
            .entry("direct".to_string())
            .or_insert_with(|| Arc::new(Direct::new()));
        outbounds
            .entry("reject".to_string())
            .or_insert_with(|| Arc::new(Reject::new()));

        // Every policy a rule can decide must resolve to an outbound
        let mut referenced = HashSet::new();
        collect_policies(&rules, &mut referenced);
        if let Some(global) = &profile.global_policy {
            referenced.insert(global.clone());
        }
        for name in &referenced {
            if !outbounds.contains_key(&name.to_lowercase()) {
                return Err(ProxyError::Config(format!("unknown policy: {}", name)));
            }
        }

        let table = RuleTable::new(
            rules,
            geo,
            Box::new(SystemResolver::new()),
            DEFAULT_DECISION_CACHE,
        )?;

        let authority = match &profile.mitm {
            Some(config) => CertAuthority::from_settings(&config.to_settings()?)?,
            None => None,
        };
        let skip_cert_verify = profile
            .mitm
            .as_ref()
            .map(|m| m.skip_cert_verify)
            .unwrap_or(false);

        let (tls_verified, tls_insecure) = build_tls_client_configs();

        Ok(Self {
            socks_listen: profile.socks_listen,
            http_listen: profile.http_listen,
            socks_auth: profile
                .authentication
                .as_ref()
                .map(|c| socks::ServerAuth::new(c.username.clone(), c.password.clone())),
            http_auth: profile
                .authentication
                .as_ref()
                .map(|c| http::ProxyAuth::new(c.username.clone(), c.password.clone())),
            mode: profile.outbound_mode,
            global_policy: profile.global_policy.clone(),
            table,
            outbounds,
            authority,
            tls_verified,
            tls_insecure,
            skip_cert_verify,
        })
    }

    /// Bind the configured listeners and serve until the task is dropped.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut accept_loops = Vec::new();

        if let Some(addr) = self.socks_listen {
            let listener = TcpListener::bind(addr).await?;
            info!(listen = %addr, "SOCKS5 listener up");
            accept_loops.push(tokio::spawn(self.clone().serve_socks(listener)));
        }
        if let Some(addr) = self.http_listen {
            let listener = TcpListener::bind(addr).await?;
            info!(listen = %addr, "HTTP listener up");
            accept_loops.push(tokio::spawn(self.clone().serve_http(listener)));
        }

        for task in accept_loops {
            let _ = task.await;
        }
        Ok(())
    }

    /// Accept SOCKS5 clients on an already bound listener.
    pub async fn serve_socks(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let gateway = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = gateway.handle_socks(stream).await {
                            debug!(%peer, error = %e, "SOCKS5 connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "SOCKS5 accept failed");
                }
            }
        }
    }

    /// Accept HTTP proxy clients on an already bound listener.
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let gateway = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = gateway.handle_http(stream).await {
                            debug!(%peer, error = %e, "HTTP connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "HTTP accept failed");
                }
            }
        }
    }

    async fn handle_socks(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let dialer = RoutedDialer {
            gateway: self.as_ref(),
        };
        let established =
            socks::server::serve(&mut stream, self.socks_auth.as_ref(), &dialer).await?;
        self.splice(
            stream,
            established.outbound,
            &established.target,
            established.leftover,
        )
        .await
    }

    async fn handle_http(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        match http::server::accept(&mut stream, self.http_auth.as_ref()).await? {
            None => Ok(()),
            Some(http::Accepted::Connect { target, leftover }) => {
                // The 200 is already on the wire; a failed dial just closes
                let outbound = self.dial_routed(&target).await?;
                self.splice(stream, outbound, &target, leftover).await
            }
            Some(http::Accepted::Forward {
                target,
                request,
                body,
                leftover,
            }) => match self.dial_routed(&target).await {
                Ok(mut origin) => {
                    let capture = self.capture_enabled(&target.host());
                    http::server::forward_exchanges(
                        &mut stream,
                        &mut origin,
                        Some((request, body)),
                        leftover,
                        capture,
                    )
                    .await
                }
                Err(e) => {
                    let _ = http::server::respond_error(&mut stream, 502, "Bad Gateway").await;
                    Err(e)
                }
            },
        }
    }

    /// Route a destination to its policy name.
    async fn route_policy(&self, target: &Address) -> Result<String> {
        let name = match self.mode {
            OutboundMode::Direct => "DIRECT".to_string(),
            OutboundMode::Global => self
                .global_policy
                .clone()
                .ok_or_else(|| ProxyError::Config("global mode without policy".to_string()))?,
            OutboundMode::Rule => self.table.route(&Destination::from_address(target)).await,
        };
        Ok(name)
    }

    /// Dial a destination through whatever policy routing selects.
    async fn dial_routed(&self, target: &Address) -> Result<Box<dyn ProxyStream>> {
        let policy = self.route_policy(target).await?;
        let outbound = self
            .outbounds
            .get(&policy.to_lowercase())
            .cloned()
            .ok_or_else(|| ProxyError::Config(format!("unknown policy: {}", policy)))?;
        debug!(dest = %target, policy = %policy, "dialing");
        outbound.dial(target).await
    }

    fn capture_enabled(&self, host: &str) -> bool {
        self.authority
            .as_ref()
            .is_some_and(|authority| authority.has_pattern(host))
    }

    /// Join a negotiated client connection to its outbound: either a pure
    /// byte tunnel or, for selected hostnames, a TLS interception stack.
    ///
    /// Interception never proceeds on a certificate problem or when the
    /// payload turns out not to be TLS; both cases degrade to tunneling.
    async fn splice(
        &self,
        mut client: TcpStream,
        mut outbound: Box<dyn ProxyStream>,
        target: &Address,
        leftover: Vec<u8>,
    ) -> Result<()> {
        let host = target.host();
        let leaf = match &self.authority {
            Some(authority) => match authority.leaf_for(&host) {
                Ok(leaf) => leaf,
                Err(e) => {
                    warn!(host = %host, error = %e, "leaf issuance failed, tunneling instead");
                    None
                }
            },
            None => None,
        };

        let Some(leaf) = leaf else {
            relay::pump_with_leftover(&mut client, &mut outbound, &leftover).await?;
            return Ok(());
        };

        let (is_tls, buffered) = mitm::sniff(&mut client, leftover).await?;
        if !is_tls {
            debug!(host = %host, "expected TLS but saw something else, tunneling");
            relay::pump_with_leftover(&mut client, &mut outbound, &buffered).await?;
            return Ok(());
        }

        let server_config = match leaf.server_config() {
            Ok(config) => config,
            Err(e) => {
                warn!(host = %host, error = %e, "leaf rejected by TLS stack, tunneling");
                relay::pump_with_leftover(&mut client, &mut outbound, &buffered).await?;
                return Ok(());
            }
        };
        let sni = match rustls::pki_types::ServerName::try_from(host.clone()) {
            Ok(name) => name,
            Err(_) => {
                debug!(host = %host, "host not usable as SNI, tunneling");
                relay::pump_with_leftover(&mut client, &mut outbound, &buffered).await?;
                return Ok(());
            }
        };

        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        let mut client_tls = acceptor
            .accept(PrefixedStream::new(client, buffered))
            .await?;

        let connector = TlsConnector::from(if self.skip_cert_verify {
            self.tls_insecure.clone()
        } else {
            self.tls_verified.clone()
        });
        let mut origin_tls = connector.connect(sni, outbound).await?;

        debug!(host = %host, "interception established");
        let result =
            http::server::forward_exchanges(&mut client_tls, &mut origin_tls, None, Vec::new(), true)
                .await;
        // Send close_notify both ways so neither peer sees a truncation
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut client_tls).await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut origin_tls).await;
        result
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("socks_listen", &self.socks_listen)
            .field("http_listen", &self.http_listen)
            .field("mode", &self.mode)
            .field("rule_count", &self.table.rule_count())
            .finish_non_exhaustive()
    }
}

/// Outbound adapter handed to the SOCKS server: dialing consults routing.
struct RoutedDialer<'a> {
    gateway: &'a Gateway,
}

#[async_trait]
impl Outbound for RoutedDialer<'_> {
    async fn dial(&self, addr: &Address) -> Result<Box<dyn ProxyStream>> {
        self.gateway.dial_routed(addr).await
    }
}

/// Policies named anywhere in the rule list, rule-set children included.
fn collect_policies(rules: &[Rule], out: &mut HashSet<String>) {
    for rule in rules {
        out.insert(rule.policy.clone());
        if let RuleKind::RuleSet(children) = &rule.kind {
            collect_policies(children, out);
        }
    }
}

fn build_tls_client_configs() -> (Arc<rustls::ClientConfig>, Arc<rustls::ClientConfig>) {
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let verified = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let insecure = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
        .with_no_client_auth();

    (Arc::new(verified), Arc::new(insecure))
}

/// Origin-side verifier used with `skip_cert_verify`: accepts any chain
/// but still checks handshake signatures.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
