//! Routing rules: the ordered list that maps a destination to an egress
//! policy name.
//!
//! Rules are parsed from their text form (`parser`), may pull in external
//! domain-set / rule-set resources (`resource`), and are served from a
//! swappable snapshot with a decision cache (`table`).

use std::net::IpAddr;

use crate::address::{Address, CidrRange};
use crate::geo::GeoDb;

mod parser;
mod resource;
mod table;

pub use parser::{parse_rules, RuleParser};
pub use resource::{resource_local_name, DomainSet, ResourceLoader};
pub use table::{NilResolver, Resolver, RuleTable, SystemResolver, DEFAULT_DECISION_CACHE};

/// What a rule is evaluated against: a hostname, an IP, or both once a
/// domain has been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Lowercased hostname, empty when only an IP is known.
    pub host: String,
    /// Literal or resolved address.
    pub ip: Option<IpAddr>,
}

impl Destination {
    pub fn domain(host: impl Into<String>) -> Self {
        Self {
            host: host.into().to_lowercase(),
            ip: None,
        }
    }

    pub fn ip(ip: IpAddr) -> Self {
        Self {
            host: String::new(),
            ip: Some(ip),
        }
    }

    /// Classify a negotiated address: IP literals become IP destinations,
    /// names become domain destinations.
    pub fn from_address(addr: &Address) -> Self {
        match addr {
            Address::Domain(host, _) => Self::domain(host.clone()),
            Address::Ip(sa) => Self::ip(sa.ip()),
        }
    }
}

/// Rule kind plus whatever compiled state the kind needs.
#[derive(Debug, Clone)]
pub enum RuleKind {
    /// `DOMAIN`: exact hostname match.
    Domain,
    /// `DOMAIN-SUFFIX`: the name itself or any subdomain, on a dotted
    /// boundary.
    DomainSuffix,
    /// `DOMAIN-KEYWORD`: substring match.
    DomainKeyword,
    /// `DOMAIN-SET`: entries loaded from an external resource.
    DomainSet(DomainSet),
    /// `IP-CIDR`: v4 or v6 range containment.
    IpCidr(CidrRange),
    /// `GEOIP`: country of the destination IP.
    Geoip,
    /// `RULE-SET`: rules loaded from an external resource.
    RuleSet(Vec<Rule>),
    /// `FINAL`: always matches; must terminate the list.
    Final,
}

impl RuleKind {
    /// The identifier used in the text form.
    pub fn ident(&self) -> &'static str {
        match self {
            RuleKind::Domain => "DOMAIN",
            RuleKind::DomainSuffix => "DOMAIN-SUFFIX",
            RuleKind::DomainKeyword => "DOMAIN-KEYWORD",
            RuleKind::DomainSet(_) => "DOMAIN-SET",
            RuleKind::IpCidr(_) => "IP-CIDR",
            RuleKind::Geoip => "GEOIP",
            RuleKind::RuleSet(_) => "RULE-SET",
            RuleKind::Final => "FINAL",
        }
    }
}

/// One routing rule. All kinds share the disabled flag, raw expression,
/// policy name and trailing comment.
#[derive(Debug, Clone)]
pub struct Rule {
    pub kind: RuleKind,
    pub disabled: bool,
    pub expression: String,
    pub policy: String,
    pub comment: String,
}

impl Rule {
    /// Evaluate this rule. Returns the policy that decided the match: the
    /// rule's own policy, or for `RULE-SET` the matching child's.
    pub fn decide<'a>(&'a self, dest: &Destination, geo: &GeoDb) -> Option<&'a str> {
        if self.disabled {
            return None;
        }
        let host = dest.host.as_str();
        let matched = match &self.kind {
            RuleKind::Domain => !host.is_empty() && host == self.expression,
            RuleKind::DomainSuffix => {
                !host.is_empty()
                    && (host == self.expression
                        || host
                            .strip_suffix(self.expression.as_str())
                            .is_some_and(|head| head.ends_with('.')))
            }
            RuleKind::DomainKeyword => !host.is_empty() && host.contains(self.expression.as_str()),
            RuleKind::DomainSet(set) => !host.is_empty() && set.matches(host),
            RuleKind::IpCidr(cidr) => dest.ip.is_some_and(|ip| cidr.contains(ip)),
            RuleKind::Geoip => dest
                .ip
                .and_then(|ip| geo.country_code(ip))
                .is_some_and(|code| code == self.expression),
            RuleKind::RuleSet(children) => {
                return children.iter().find_map(|child| child.decide(dest, geo));
            }
            RuleKind::Final => true,
        };
        matched.then_some(self.policy.as_str())
    }

    pub fn is_final(&self) -> bool {
        matches!(self.kind, RuleKind::Final)
    }

    /// Whether evaluating this rule can require a resolved IP.
    pub fn needs_ip(&self) -> bool {
        match &self.kind {
            RuleKind::IpCidr(_) | RuleKind::Geoip => true,
            RuleKind::RuleSet(children) => children.iter().any(|c| !c.disabled && c.needs_ip()),
            _ => false,
        }
    }
}
