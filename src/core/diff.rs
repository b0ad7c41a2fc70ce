//! Set difference between the current and desired rule sets

use crate::core::rule::{CanonicalRule, RuleSet};

/// What one cycle has to change, in deterministic key order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    /// Rules in desired, absent from current
    pub to_add: Vec<CanonicalRule>,
    /// Rules in current, absent from desired
    pub to_remove: Vec<CanonicalRule>,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_add.len() + self.to_remove.len()
    }
}

/// Computes `to_add = desired \ current` and `to_remove = current \ desired`.
///
/// An empty `desired` is not special: every owned rule in `current` ends up in
/// `to_remove`. Both sets must have been built under the same case policy.
pub fn diff(current: &RuleSet, desired: &RuleSet) -> ReconciliationPlan {
    debug_assert_eq!(
        current.folding(),
        desired.folding(),
        "rule sets built under different case policies"
    );

    let to_add = desired
        .iter()
        .filter(|(key, _)| !current.contains_key(key))
        .map(|(_, rule)| rule.clone())
        .collect();

    let to_remove = current
        .iter()
        .filter(|(key, _)| !desired.contains_key(key))
        .map(|(_, rule)| rule.clone())
        .collect();

    ReconciliationPlan { to_add, to_remove }
}
