//! Canonical rule records and rule sets
//!
//! Rules arrive from two places: the control plane (JSON records whose fields
//! may be missing) and the ufw status probe (text columns such as `Anywhere`).
//! Both are mapped through [`normalize`] into a [`CanonicalRule`] so that the
//! diff compares like with like.
//!
//! # Identity
//!
//! Two rules are the same rule iff their [`RuleKey`]s are equal. The key is the
//! `(from, protocol, port)` triple, folded to lower case unless the agent runs
//! with [`CaseFolding::Sensitive`]. The stored record keeps its original casing
//! so that commands sent to ufw reproduce exactly what the control plane sent.
//!
//! Sources are the exception: ufw stores addresses in its own form (no `/32`
//! or `/128`, host bits cleared, compressed lower-case IPv6) and prints them
//! back that way, so parseable sources are rewritten to that form here.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Default value for any missing rule field.
pub const ANY: &str = "any";

/// Token ufw prints for an unrestricted source or destination.
pub const UNRESTRICTED: &str = "Anywhere";

/// Case policy applied when building comparison keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseFolding {
    /// Keys are compared exactly as written
    Sensitive,
    /// Keys are folded to lower case before comparison
    #[default]
    Insensitive,
}

impl CaseFolding {
    pub fn from_case_sensitive(case_sensitive: bool) -> Self {
        if case_sensitive {
            Self::Sensitive
        } else {
            Self::Insensitive
        }
    }
}

/// A rule as received from the control plane, every field optional
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRule {
    #[serde(default, deserialize_with = "string_or_number")]
    pub from: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub protocol: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub port: Option<String>,
}

impl RawRule {
    pub fn new(from: &str, protocol: &str, port: &str) -> Self {
        Self {
            from: Some(from.to_string()),
            protocol: Some(protocol.to_string()),
            port: Some(port.to_string()),
        }
    }

    pub fn normalize(&self) -> CanonicalRule {
        normalize(
            self.from.as_deref().unwrap_or_default(),
            self.protocol.as_deref().unwrap_or_default(),
            self.port.as_deref().unwrap_or_default(),
        )
    }
}

/// Control planes sometimes send ports as bare numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, found {other}"
        ))),
    }
}

/// A rule with every field explicit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalRule {
    pub from: String,
    pub protocol: String,
    pub port: String,
}

impl CanonicalRule {
    /// Comparison key under the given case policy.
    pub fn key(&self, folding: CaseFolding) -> RuleKey {
        let raw = format!("{}|{}|{}", self.from, self.protocol, self.port);
        match folding {
            CaseFolding::Sensitive => RuleKey(raw),
            CaseFolding::Insensitive => RuleKey(raw.to_lowercase()),
        }
    }

    /// Whether the source is unrestricted, in any casing.
    pub fn is_any_source(&self) -> bool {
        self.from.eq_ignore_ascii_case(ANY)
    }

    pub fn is_any_protocol(&self) -> bool {
        self.protocol == ANY
    }

    pub fn is_any_port(&self) -> bool {
        self.port.eq_ignore_ascii_case(ANY)
    }
}

impl fmt::Display for CanonicalRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "From: {}, Protocol: {}, Port: {}",
            self.from, self.protocol, self.port
        )
    }
}

/// Maps raw rule fields to a canonical record.
///
/// Never fails: blank fields become `"any"`, ufw's `Anywhere` and every casing
/// of `any` become `"any"`, addresses are rewritten by [`canonical_source`], and
/// the protocol is always lower-cased. `port` keeps its casing.
pub fn normalize(raw_from: &str, raw_protocol: &str, raw_port: &str) -> CanonicalRule {
    let from = raw_from.trim();
    let from = if from.is_empty()
        || from.eq_ignore_ascii_case(UNRESTRICTED)
        || from.eq_ignore_ascii_case(ANY)
    {
        ANY.to_string()
    } else {
        canonical_source(from)
    };

    let protocol = raw_protocol.trim();
    let protocol = if protocol.is_empty() {
        ANY.to_string()
    } else {
        protocol.to_ascii_lowercase()
    };

    let port = raw_port.trim();
    let port = if port.is_empty() {
        ANY.to_string()
    } else {
        port.to_string()
    };

    CanonicalRule {
        from,
        protocol,
        port,
    }
}

/// Rewrites an address or network the way ufw stores it.
///
/// `203.0.113.7/32` becomes `203.0.113.7`, `10.0.0.5/8` becomes `10.0.0.0/8`
/// and `2001:DB8:0::1` becomes `2001:db8::1`. Values that do not parse are
/// returned unchanged so that validation can reject them.
pub fn canonical_source(from: &str) -> String {
    if !from.contains('/') {
        return from
            .parse::<IpAddr>()
            .map_or_else(|_| from.to_string(), |addr| addr.to_string());
    }

    match from.parse::<IpNetwork>() {
        Ok(network) => {
            let full_length = match network {
                IpNetwork::V4(_) => 32,
                IpNetwork::V6(_) => 128,
            };
            if network.prefix() == full_length {
                network.ip().to_string()
            } else {
                format!("{}/{}", network.network(), network.prefix())
            }
        }
        Err(_) => from.to_string(),
    }
}

/// Opaque comparison key, ordered lexicographically
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleKey(String);

impl RuleKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A snapshot of rules keyed by canonical key, rebuilt every cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    rules: BTreeMap<RuleKey, CanonicalRule>,
    folding: CaseFolding,
}

impl RuleSet {
    pub fn empty(folding: CaseFolding) -> Self {
        Self {
            rules: BTreeMap::new(),
            folding,
        }
    }

    /// Builds a set from canonical rules. Duplicates collapse; the first
    /// occurrence is kept.
    pub fn from_rules(rules: impl IntoIterator<Item = CanonicalRule>, folding: CaseFolding) -> Self {
        let mut map = BTreeMap::new();
        for rule in rules {
            map.entry(rule.key(folding)).or_insert(rule);
        }
        Self {
            rules: map,
            folding,
        }
    }

    /// Normalizes and collects raw control-plane rules.
    pub fn from_raw<'a>(raw: impl IntoIterator<Item = &'a RawRule>, folding: CaseFolding) -> Self {
        Self::from_rules(raw.into_iter().map(RawRule::normalize), folding)
    }

    pub fn folding(&self) -> CaseFolding {
        self.folding
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn contains_key(&self, key: &RuleKey) -> bool {
        self.rules.contains_key(key)
    }

    pub fn contains(&self, rule: &CanonicalRule) -> bool {
        self.rules.contains_key(&rule.key(self.folding))
    }

    /// Rules in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&RuleKey, &CanonicalRule)> {
        self.rules.iter()
    }

    pub fn rules(&self) -> impl Iterator<Item = &CanonicalRule> {
        self.rules.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_fields_default_to_any() {
        let rule = normalize("", "", "");
        assert_eq!(rule.from, "any");
        assert_eq!(rule.protocol, "any");
        assert_eq!(rule.port, "any");
    }

    #[test]
    fn test_whitespace_only_is_blank() {
        let rule = normalize("  ", "\t", " ");
        assert_eq!(rule, normalize("", "", ""));
    }

    #[test]
    fn test_anywhere_maps_to_any() {
        let probe = normalize("Anywhere", "tcp", "22");
        let desired = RawRule {
            from: None,
            protocol: Some("tcp".into()),
            port: Some("22".into()),
        }
        .normalize();
        assert_eq!(probe, desired);
    }

    #[test]
    fn test_protocol_is_always_lowercased() {
        let rule = normalize("10.0.0.0/8", "TCP", "22");
        assert_eq!(rule.protocol, "tcp");
        let folded = RuleSet::from_rules([rule.clone()], CaseFolding::Sensitive);
        assert!(folded.contains(&normalize("10.0.0.0/8", "tcp", "22")));
    }

    #[test]
    fn test_port_keeps_casing() {
        let rule = normalize("any", "udp", "Http");
        assert_eq!(rule.port, "Http");
    }

    #[test]
    fn test_any_keyword_folds_in_every_casing() {
        for from in ["ANY", "Any", "any", " aNy "] {
            assert_eq!(normalize(from, "tcp", "22").from, "any");
        }
    }

    #[test]
    fn test_sources_take_ufw_form() {
        assert_eq!(normalize("203.0.113.7/32", "", "").from, "203.0.113.7");
        assert_eq!(normalize("10.0.0.5/8", "", "").from, "10.0.0.0/8");
        assert_eq!(normalize("10.0.0.0/8", "", "").from, "10.0.0.0/8");
        assert_eq!(normalize("2001:DB8:0:0::1", "", "").from, "2001:db8::1");
        assert_eq!(normalize("2001:db8::1/128", "", "").from, "2001:db8::1");
        assert_eq!(normalize("2001:DB8::5/32", "", "").from, "2001:db8::/32");
    }

    #[test]
    fn test_unparseable_source_is_kept_for_validation() {
        assert_eq!(normalize("--force", "", "").from, "--force");
        assert_eq!(normalize("10.0.0.1/99", "", "").from, "10.0.0.1/99");
    }

    #[test]
    fn test_case_insensitive_keys_match() {
        let upper = normalize("any", "tcp", "SSH");
        let lower = normalize("any", "tcp", "ssh");
        assert_eq!(
            upper.key(CaseFolding::Insensitive),
            lower.key(CaseFolding::Insensitive)
        );
    }

    #[test]
    fn test_case_sensitive_keys_differ() {
        let upper = normalize("any", "tcp", "SSH");
        let lower = normalize("any", "tcp", "ssh");
        assert_ne!(
            upper.key(CaseFolding::Sensitive),
            lower.key(CaseFolding::Sensitive)
        );
    }

    #[test]
    fn test_duplicates_collapse_first_wins() {
        let set = RuleSet::from_rules(
            [normalize("any", "tcp", "SSH"), normalize("any", "tcp", "ssh")],
            CaseFolding::Insensitive,
        );
        assert_eq!(set.len(), 1);
        assert_eq!(set.rules().next().map(|r| r.port.as_str()), Some("SSH"));
    }

    #[test]
    fn test_iteration_is_key_ordered() {
        let set = RuleSet::from_rules(
            [
                normalize("", "tcp", "80"),
                normalize("", "tcp", "22"),
                normalize("10.0.0.1", "udp", "53"),
            ],
            CaseFolding::Insensitive,
        );
        let ports: Vec<&str> = set.rules().map(|r| r.port.as_str()).collect();
        assert_eq!(ports, vec!["53", "22", "80"]);
    }

    #[test]
    fn test_raw_rule_accepts_numeric_port() {
        let raw: RawRule = serde_json::from_str(r#"{"from": "", "protocol": "tcp", "port": 443}"#)
            .unwrap();
        assert_eq!(raw.port.as_deref(), Some("443"));
        assert_eq!(raw.normalize().port, "443");
    }

    #[test]
    fn test_raw_rule_missing_and_null_fields() {
        let raw: RawRule = serde_json::from_str(r#"{"port": null}"#).unwrap();
        assert_eq!(raw.normalize(), normalize("", "", ""));
    }

    #[test]
    fn test_raw_rule_rejects_objects() {
        let raw = serde_json::from_str::<RawRule>(r#"{"port": {"n": 1}}"#);
        assert!(raw.is_err());
    }

    #[test]
    fn test_display_matches_log_format() {
        let rule = normalize("", "tcp", "22");
        assert_eq!(rule.to_string(), "From: any, Protocol: tcp, Port: 22");
    }
}
