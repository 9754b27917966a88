//! Snapshot-served rule table.
//!
//! Readers route against an immutable snapshot; reloads swap the snapshot
//! atomically and never mutate a list that is being served. Decisions are
//! memoized in an LRU cache.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::geo::GeoDb;

use super::{Destination, Rule};

/// Default LRU size for routing decisions.
pub const DEFAULT_DECISION_CACHE: NonZeroUsize = NonZeroUsize::new(1024).unwrap();

/// DNS hook used when IP rules must be evaluated against a domain-only
/// destination. A failed resolution simply leaves those rules unmatched.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Option<IpAddr>;
}

/// Resolves through the system DNS via tokio.
#[derive(Debug, Default)]
pub struct SystemResolver;

impl SystemResolver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        tokio::net::lookup_host(format!("{}:0", host))
            .await
            .ok()?
            .map(|sa| sa.ip())
            .next()
    }
}

/// Resolver that never finds an address.
#[derive(Debug, Default)]
pub struct NilResolver;

impl NilResolver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Resolver for NilResolver {
    async fn resolve(&self, _host: &str) -> Option<IpAddr> {
        None
    }
}

#[derive(Debug)]
struct Snapshot {
    rules: Vec<Rule>,
    needs_ip: bool,
}

impl Snapshot {
    fn build(rules: Vec<Rule>) -> Result<Self> {
        validate(&rules)?;
        let needs_ip = rules.iter().any(|r| !r.disabled && r.needs_ip());
        Ok(Self { rules, needs_ip })
    }
}

/// The rule list is evaluated top to bottom; the first non-disabled match
/// wins. `FINAL` must close the list, so evaluation always decides.
fn validate(rules: &[Rule]) -> Result<()> {
    let Some(last) = rules.last() else {
        return Err(ProxyError::InvalidRule(
            "rule list is empty; a FINAL rule is mandatory".to_string(),
        ));
    };
    if !last.is_final() || last.disabled {
        return Err(ProxyError::InvalidRule(
            "the last rule must be an enabled FINAL".to_string(),
        ));
    }
    if rules.iter().rev().skip(1).any(Rule::is_final) {
        return Err(ProxyError::InvalidRule(
            "FINAL must be the last rule".to_string(),
        ));
    }
    Ok(())
}

/// Routing rule table shared across connections.
pub struct RuleTable {
    snapshot: RwLock<Arc<Snapshot>>,
    cache: Mutex<LruCache<Destination, String>>,
    resolver: Box<dyn Resolver>,
    geo: Arc<GeoDb>,
}

impl std::fmt::Debug for RuleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleTable")
            .field("rule_count", &self.rule_count())
            .finish_non_exhaustive()
    }
}

impl RuleTable {
    pub fn new(
        rules: Vec<Rule>,
        geo: Arc<GeoDb>,
        resolver: Box<dyn Resolver>,
        cache_size: NonZeroUsize,
    ) -> Result<Self> {
        let snapshot = Snapshot::build(rules)?;
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            cache: Mutex::new(LruCache::new(cache_size)),
            resolver,
            geo,
        })
    }

    /// Swap in a new rule list, as on an external-resource reload. Serving
    /// reads continue on the old snapshot until the swap completes.
    pub fn replace_rules(&self, rules: Vec<Rule>) -> Result<()> {
        let snapshot = Snapshot::build(rules)?;
        *self.snapshot.write() = Arc::new(snapshot);
        self.cache.lock().clear();
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.snapshot.read().rules.len()
    }

    /// Map a destination to its egress policy name.
    pub async fn route(&self, dest: &Destination) -> String {
        if let Some(hit) = self.cache.lock().get(dest) {
            return hit.clone();
        }

        let snapshot = self.snapshot.read().clone();

        let mut candidate = dest.clone();
        if snapshot.needs_ip && candidate.ip.is_none() && !candidate.host.is_empty() {
            candidate.ip = self.resolver.resolve(&candidate.host).await;
        }

        let policy = snapshot
            .rules
            .iter()
            .find_map(|rule| rule.decide(&candidate, &self.geo))
            // validate() guarantees an enabled FINAL closes the list
            .unwrap_or(snapshot.rules[snapshot.rules.len() - 1].policy.as_str())
            .to_string();

        debug!(dest = %candidate.host, policy = %policy, "routed");
        self.cache.lock().put(dest.clone(), policy.clone());
        policy
    }
}
