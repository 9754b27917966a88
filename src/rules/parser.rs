//! Text form of the rule list.
//!
//! One rule per line: `IDENT , EXPR , POLICY [ // COMMENT ]`. `FINAL` has
//! no expression. A leading `#` keeps the rule but disables it. Whitespace
//! around commas is trimmed.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::address::CidrRange;
use crate::error::{ProxyError, Result};

use super::resource::{DomainSet, ResourceLoader, MAX_RESOURCE_DEPTH};
use super::{Rule, RuleKind};

static IDENT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9-]*$").unwrap());

/// Parse a rule list that uses no external resources.
pub fn parse_rules(text: &str) -> Result<Vec<Rule>> {
    RuleParser::new().parse(text)
}

/// Rule-list parser. Carries the resource loader and the in-progress
/// resource stack used to refuse rule-set cycles.
#[derive(Debug, Default)]
pub struct RuleParser {
    loader: Option<ResourceLoader>,
    loading: Vec<String>,
}

impl RuleParser {
    /// A parser without resource access; `DOMAIN-SET`/`RULE-SET` rules fail.
    pub fn new() -> Self {
        Self::default()
    }

    /// A parser that reads external resources through `loader`.
    pub fn with_loader(loader: ResourceLoader) -> Self {
        Self {
            loader: Some(loader),
            loading: Vec::new(),
        }
    }

    pub fn parse(&mut self, text: &str) -> Result<Vec<Rule>> {
        self.parse_with_default(text, None)
    }

    fn parse_with_default(&mut self, text: &str, default_policy: Option<&str>) -> Result<Vec<Rule>> {
        let mut rules = Vec::new();
        for (line_num, line) in text.lines().enumerate() {
            if let Some(rule) = self.parse_line(line, line_num + 1, default_policy)? {
                rules.push(rule);
            }
        }
        Ok(rules)
    }

    fn parse_line(
        &mut self,
        line: &str,
        line_num: usize,
        default_policy: Option<&str>,
    ) -> Result<Option<Rule>> {
        let mut line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let disabled = if let Some(rest) = line.strip_prefix('#') {
            line = rest.trim_start();
            if line.is_empty() {
                return Ok(None);
            }
            true
        } else {
            false
        };

        let fail = |message: String| ProxyError::ParseErrorAtLine { line: line_num, message };

        let mut parts: Vec<&str> = line.split(',').map(str::trim).collect();

        // The trailing comment lives in the last field: `POLICY // text`.
        // The marker needs leading whitespace so a resource URL in a
        // policy-less line keeps its scheme separator.
        let mut comment = String::new();
        if let Some(last) = parts.last_mut() {
            if let Some(idx) = last.find("//") {
                if idx == 0 || last[..idx].ends_with(char::is_whitespace) {
                    comment = last[idx + 2..].trim().to_string();
                    *last = last[..idx].trim_end();
                }
            }
        }

        let ident = parts[0].to_uppercase();
        if !IDENT_PATTERN.is_match(&ident) {
            return Err(fail(format!("invalid rule identifier: {}", parts[0])));
        }

        let policy_at = |idx: usize| -> Result<String> {
            match parts.get(idx).filter(|p| !p.is_empty()) {
                Some(p) => Ok(p.to_string()),
                None => default_policy
                    .map(str::to_string)
                    .ok_or_else(|| fail("missing policy".to_string())),
            }
        };

        if ident == "FINAL" {
            let policy = policy_at(1)?;
            return Ok(Some(Rule {
                kind: RuleKind::Final,
                disabled,
                expression: String::new(),
                policy,
                comment,
            }));
        }

        let expression = parts
            .get(1)
            .filter(|e| !e.is_empty())
            .map(|e| e.to_string())
            .ok_or_else(|| fail("missing expression".to_string()))?;
        let policy = policy_at(2)?;

        let kind = match ident.as_str() {
            "DOMAIN" => RuleKind::Domain,
            "DOMAIN-SUFFIX" => RuleKind::DomainSuffix,
            "DOMAIN-KEYWORD" => RuleKind::DomainKeyword,
            "DOMAIN-SET" => {
                let text = self.read_resource(&expression, line_num)?;
                RuleKind::DomainSet(DomainSet::parse(&text))
            }
            "IP-CIDR" => RuleKind::IpCidr(
                CidrRange::parse(&expression)
                    .map_err(|e| fail(e.to_string()))?,
            ),
            "GEOIP" => RuleKind::Geoip,
            "RULE-SET" => RuleKind::RuleSet(self.load_rule_set(&expression, &policy, line_num)?),
            other => return Err(fail(format!("unknown rule kind: {}", other))),
        };

        // Domain and country expressions are matched case-insensitively
        let expression = match kind {
            RuleKind::Domain | RuleKind::DomainSuffix | RuleKind::DomainKeyword => {
                expression.to_lowercase()
            }
            RuleKind::Geoip => expression.to_uppercase(),
            _ => expression,
        };

        Ok(Some(Rule {
            kind,
            disabled,
            expression,
            policy,
            comment,
        }))
    }

    fn read_resource(&self, expression: &str, line_num: usize) -> Result<String> {
        let loader = self.loader.as_ref().ok_or_else(|| ProxyError::Resource(format!(
            "rule at line {} references external resource {} but no resource directory is configured",
            line_num, expression
        )))?;
        loader.read(expression)
    }

    fn load_rule_set(
        &mut self,
        expression: &str,
        parent_policy: &str,
        line_num: usize,
    ) -> Result<Vec<Rule>> {
        if self.loading.iter().any(|e| e == expression) {
            return Err(ProxyError::Resource(format!(
                "rule-set cycle detected at {}",
                expression
            )));
        }
        if self.loading.len() >= MAX_RESOURCE_DEPTH {
            return Err(ProxyError::Resource(format!(
                "rule-set nesting exceeds depth {} at {}",
                MAX_RESOURCE_DEPTH, expression
            )));
        }

        let text = self.read_resource(expression, line_num)?;
        self.loading.push(expression.to_string());
        let result = self.parse_with_default(&text, Some(parent_policy));
        self.loading.pop();
        result
    }
}
