//! Desired-state document returned by the control plane
//!
//! ```json
//! { "firewall": { "rules": [ { "from": "10.0.0.0/8", "protocol": "tcp", "port": "22" } ] } }
//! ```
//!
//! A missing, `null`, or empty `rules` array means "no desired rules". A
//! document without a `firewall` object is rejected: that is a broken
//! response, not an instruction to flush the allow-list.

use crate::core::error::{Error, Result};
use crate::core::rule::RawRule;
use serde::Deserialize;
use serde_json::Value;

const ORIGIN: &str = "desired state";

#[derive(Debug, Deserialize)]
struct Document {
    firewall: Option<FirewallSection>,
}

#[derive(Debug, Deserialize)]
struct FirewallSection {
    #[serde(default)]
    rules: Option<Vec<RawRule>>,
}

/// A parsed desired-state document
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    pub rules: Vec<RawRule>,
    /// The document as received, kept for the last-applied snapshot
    pub document: Value,
}

impl DesiredState {
    /// Parses a response body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] for invalid JSON, a non-object document, a
    /// missing or null `firewall` object, or malformed rule records.
    pub fn parse(body: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(body)
            .map_err(|e| Error::parse(ORIGIN, format!("invalid JSON: {e}"), body))?;
        Self::from_value(document, body)
    }

    fn from_value(document: Value, body: &str) -> Result<Self> {
        if !document.is_object() {
            return Err(Error::parse(ORIGIN, "document is not a JSON object", body));
        }

        let parsed: Document = serde_json::from_value(document.clone())
            .map_err(|e| Error::parse(ORIGIN, format!("unexpected shape: {e}"), body))?;

        let firewall = parsed
            .firewall
            .ok_or_else(|| Error::parse(ORIGIN, "missing `firewall` object", body))?;

        Ok(Self {
            rules: firewall.rules.unwrap_or_default(),
            document,
        })
    }
}
