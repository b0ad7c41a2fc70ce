//! Rule applier
//!
//! Turns a [`ReconciliationPlan`] into ufw mutations:
//!
//! 1. every addition, each preceded by a best-effort re-probe so that a rule
//!    added by someone else since the cycle's probe is not added twice
//! 2. every removal, except one whose `delete` command would hit the same
//!    physical rule as an add that ufw just reported as already present
//! 3. one `reload`, only if at least one mutation changed the table
//!
//! Adding first keeps allowed traffic flowing when a rule is replaced. A
//! failed rule is logged and counted; it never stops the remaining rules. There
//! is no rollback: a failed reload leaves the applied mutations in place and
//! the next cycle reconciles from whatever the filter then reports.

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::core::diff::ReconciliationPlan;
use crate::core::error::{Error, UfwErrorPattern};
use crate::core::rule::{CanonicalRule, CaseFolding};
use crate::core::ufw::{Mutation, PacketFilter, same_table_entry};
use crate::validators::validate_rule;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which side of the plan a rule came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RuleAction {
    Add,
    Remove,
}

/// A rule that could not be applied
#[derive(Debug, Clone, Serialize)]
pub struct RuleFailure {
    pub action: RuleAction,
    pub rule: CanonicalRule,
    pub message: String,
}

/// What the applier did
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub added: usize,
    pub removed: usize,
    /// Adds skipped because the rule was already there
    pub already_present: usize,
    /// Removes ufw reported as no-ops
    pub already_absent: usize,
    /// Removes skipped because ufw holds them as a rule that is still desired
    pub shared_kept: usize,
    pub failures: Vec<RuleFailure>,
    /// Whether `ufw reload` ran and succeeded
    pub committed: bool,
    /// Rules left untouched because shutdown was requested
    pub skipped_on_shutdown: usize,
    /// Set when the reload failed
    pub error: Option<Error>,
}

impl ApplyOutcome {
    pub fn changes_made(&self) -> bool {
        self.added + self.removed > 0
    }
}

/// Applies plans through a [`PacketFilter`]
pub struct RuleApplier<'a> {
    filter: &'a dyn PacketFilter,
    folding: CaseFolding,
    audit: Option<&'a AuditLog>,
    cycle_id: Uuid,
}

impl<'a> RuleApplier<'a> {
    pub fn new(filter: &'a dyn PacketFilter, folding: CaseFolding, cycle_id: Uuid) -> Self {
        Self {
            filter,
            folding,
            audit: None,
            cycle_id,
        }
    }

    pub fn with_audit(mut self, audit: Option<&'a AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    /// Applies `plan`. Never returns early on a per-rule failure.
    ///
    /// Once `cancel` fires no further rule command is started; a command that
    /// is already running completes. Changes made before that point are still
    /// committed.
    pub async fn apply(&self, plan: &ReconciliationPlan, cancel: &CancellationToken) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let mut present: Vec<&CanonicalRule> = Vec::new();
        let steps = plan
            .to_add
            .iter()
            .map(|rule| (RuleAction::Add, rule))
            .chain(plan.to_remove.iter().map(|rule| (RuleAction::Remove, rule)));

        for (index, (action, rule)) in steps.enumerate() {
            if cancel.is_cancelled() {
                outcome.skipped_on_shutdown = plan.len() - index;
                warn!(
                    remaining = outcome.skipped_on_shutdown,
                    "shutdown requested; not starting further rule commands"
                );
                break;
            }

            match action {
                RuleAction::Add => {
                    if self.add(rule, &mut outcome).await {
                        present.push(rule);
                    }
                }
                RuleAction::Remove => {
                    if let Some(kept) = present.iter().find(|kept| same_table_entry(kept, rule)) {
                        warn!(
                            rule = %rule,
                            kept = %kept,
                            "ufw stores this rule as a desired one; not deleting it"
                        );
                        outcome.shared_kept += 1;
                        continue;
                    }
                    self.remove(rule, &mut outcome).await;
                }
            }
        }

        if outcome.changes_made() {
            self.commit(&mut outcome).await;
        } else {
            debug!("no rule changed; skipping reload");
        }

        outcome
    }

    /// Returns true when ufw already held the rule.
    async fn add(&self, rule: &CanonicalRule, outcome: &mut ApplyOutcome) -> bool {
        if let Err(message) = validate_rule(rule) {
            self.fail(RuleAction::Add, rule, message, outcome).await;
            return false;
        }

        // Best-effort: a failed re-probe does not block the add
        match self.filter.list_rules(self.folding).await {
            Ok(current) if current.contains(rule) => {
                debug!(rule = %rule, "rule appeared since probe; skipping add");
                outcome.already_present += 1;
                return true;
            }
            Ok(_) => {}
            Err(e) => debug!(rule = %rule, error = %e, "re-probe before add failed"),
        }

        match self.filter.add_rule(rule).await {
            Ok(Mutation::Changed) => {
                info!(rule = %rule, "added rule");
                outcome.added += 1;
                self.audit_rule(EventType::AddRule, rule, None).await;
                false
            }
            Ok(Mutation::Unchanged) => {
                debug!(rule = %rule, "ufw reports rule already present");
                outcome.already_present += 1;
                true
            }
            Err(e) => {
                self.fail(RuleAction::Add, rule, e.to_string(), outcome).await;
                false
            }
        }
    }

    async fn remove(&self, rule: &CanonicalRule, outcome: &mut ApplyOutcome) {
        if let Err(message) = validate_rule(rule) {
            self.fail(RuleAction::Remove, rule, message, outcome).await;
            return;
        }

        match self.filter.remove_rule(rule).await {
            Ok(Mutation::Changed) => {
                info!(rule = %rule, "removed rule");
                outcome.removed += 1;
                self.audit_rule(EventType::RemoveRule, rule, None).await;
            }
            Ok(Mutation::Unchanged) => {
                debug!(rule = %rule, "ufw reports rule already gone");
                outcome.already_absent += 1;
            }
            Err(e) => self.fail(RuleAction::Remove, rule, e.to_string(), outcome).await,
        }
    }

    async fn commit(&self, outcome: &mut ApplyOutcome) {
        let applied = outcome.added + outcome.removed;
        match self.filter.commit().await {
            Ok(()) => {
                info!(applied, "ufw reloaded");
                outcome.committed = true;
                self.audit_commit(applied, None).await;
            }
            Err(e) => {
                let hint = UfwErrorPattern::match_error(&e.to_string());
                warn!(
                    applied,
                    error = %e,
                    hint = %hint.user_message,
                    suggestions = ?hint.suggestions,
                    "ufw reload failed"
                );
                self.audit_commit(applied, Some(e.to_string())).await;
                outcome.error = Some(Error::Commit {
                    applied,
                    source: Box::new(e),
                });
            }
        }
    }

    async fn fail(
        &self,
        action: RuleAction,
        rule: &CanonicalRule,
        message: String,
        outcome: &mut ApplyOutcome,
    ) {
        let hint = UfwErrorPattern::match_error(&message);
        warn!(
            action = %action,
            rule = %rule,
            error = %message,
            hint = %hint.user_message,
            suggestions = ?hint.suggestions,
            "rule failed"
        );
        let event_type = match action {
            RuleAction::Add => EventType::AddRule,
            RuleAction::Remove => EventType::RemoveRule,
        };
        self.audit_rule(event_type, rule, Some(message.clone())).await;
        outcome.failures.push(RuleFailure {
            action,
            rule: rule.clone(),
            message,
        });
    }

    async fn audit_rule(&self, event_type: EventType, rule: &CanonicalRule, error: Option<String>) {
        if let Some(audit) = self.audit {
            let event = AuditEvent::new(
                event_type,
                self.cycle_id,
                error.is_none(),
                serde_json::json!({ "rule": rule }),
                error,
            );
            audit.record(event).await;
        }
    }

    async fn audit_commit(&self, applied: usize, error: Option<String>) {
        if let Some(audit) = self.audit {
            let event = AuditEvent::new(
                EventType::Reload,
                self.cycle_id,
                error.is_none(),
                serde_json::json!({ "applied": applied }),
                error,
            );
            audit.record(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::normalize;
    use crate::core::test_helpers::{FakeFilter, FilterCall, strip_host_prefix};

    fn plan(add: &[(&str, &str, &str)], remove: &[(&str, &str, &str)]) -> ReconciliationPlan {
        ReconciliationPlan {
            to_add: add.iter().map(|(f, p, port)| normalize(f, p, port)).collect(),
            to_remove: remove.iter().map(|(f, p, port)| normalize(f, p, port)).collect(),
        }
    }

    fn applier(filter: &FakeFilter) -> RuleApplier<'_> {
        RuleApplier::new(filter, CaseFolding::Insensitive, Uuid::nil())
    }

    #[tokio::test]
    async fn test_adds_run_before_removes() {
        let filter = FakeFilter::with_rules([normalize("10.0.0.1", "tcp", "22")]);
        let plan = plan(&[("10.0.0.2", "tcp", "22")], &[("10.0.0.1", "tcp", "22")]);

        let outcome = applier(&filter).apply(&plan, &CancellationToken::new()).await;

        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.removed, 1);
        assert!(outcome.committed);
        let mutations: Vec<FilterCall> = filter
            .calls()
            .into_iter()
            .filter(|c| !matches!(c, FilterCall::List))
            .collect();
        assert!(matches!(mutations[0], FilterCall::Add(_)));
        assert!(matches!(mutations[1], FilterCall::Remove(_)));
        assert!(matches!(mutations[2], FilterCall::Commit));
    }

    #[tokio::test]
    async fn test_empty_plan_does_not_commit() {
        let filter = FakeFilter::default();
        let outcome = applier(&filter)
            .apply(&ReconciliationPlan::default(), &CancellationToken::new())
            .await;
        assert!(!outcome.committed);
        assert_eq!(filter.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let filter = FakeFilter::default();
        filter.fail_add_for(&normalize("10.0.0.2", "tcp", "22"));
        let plan = plan(
            &[("10.0.0.1", "tcp", "22"), ("10.0.0.2", "tcp", "22"), ("10.0.0.3", "tcp", "22")],
            &[],
        );

        let outcome = applier(&filter).apply(&plan, &CancellationToken::new()).await;

        assert_eq!(outcome.added, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].rule.from, "10.0.0.2");
        assert!(outcome.committed);
        assert_eq!(filter.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_all_failures_skip_commit() {
        let filter = FakeFilter::default();
        filter.fail_add_for(&normalize("10.0.0.1", "tcp", "22"));
        let plan = plan(&[("10.0.0.1", "tcp", "22")], &[]);

        let outcome = applier(&filter).apply(&plan, &CancellationToken::new()).await;

        assert_eq!(outcome.failures.len(), 1);
        assert!(!outcome.committed);
        assert_eq!(filter.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_rule_never_reaches_filter() {
        let filter = FakeFilter::default();
        let plan = plan(&[("--force", "tcp", "22"), ("", "tcp", "99999")], &[]);

        let outcome = applier(&filter).apply(&plan, &CancellationToken::new()).await;

        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(filter.add_count(), 0);
    }

    #[tokio::test]
    async fn test_reprobe_skips_rule_added_concurrently() {
        let filter = FakeFilter::with_rules([normalize("", "tcp", "22")]);
        let plan = plan(&[("Anywhere", "TCP", "22")], &[]);

        let outcome = applier(&filter).apply(&plan, &CancellationToken::new()).await;

        assert_eq!(outcome.already_present, 1);
        assert_eq!(filter.add_count(), 0);
        assert!(!outcome.committed);
    }

    #[tokio::test]
    async fn test_reprobe_failure_does_not_block_add() {
        let filter = FakeFilter::default();
        filter.fail_list(true);
        let plan = plan(&[("", "tcp", "22")], &[]);

        let outcome = applier(&filter).apply(&plan, &CancellationToken::new()).await;

        assert_eq!(outcome.added, 1);
        assert!(outcome.committed);
    }

    #[tokio::test]
    async fn test_commit_failure_is_reported_without_rollback() {
        let filter = FakeFilter::default();
        filter.fail_commit(true);
        let plan = plan(&[("", "tcp", "22")], &[]);

        let outcome = applier(&filter).apply(&plan, &CancellationToken::new()).await;

        assert_eq!(outcome.added, 1);
        assert!(!outcome.committed);
        assert!(matches!(outcome.error, Some(Error::Commit { applied: 1, .. })));
        assert_eq!(filter.rules().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_issues_nothing() {
        let filter = FakeFilter::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let plan = plan(&[("", "tcp", "22")], &[("", "tcp", "80")]);

        let outcome = applier(&filter).apply(&plan, &cancel).await;

        assert_eq!(outcome.skipped_on_shutdown, 2);
        assert_eq!(filter.add_count() + filter.remove_count(), 0);
        assert!(!outcome.committed);
    }

    #[tokio::test]
    async fn test_unchanged_remove_is_not_a_change() {
        let filter = FakeFilter::default();
        let plan = plan(&[], &[("", "tcp", "22")]);

        let outcome = applier(&filter).apply(&plan, &CancellationToken::new()).await;

        assert_eq!(outcome.already_absent, 1);
        assert_eq!(outcome.removed, 0);
        assert!(!outcome.committed);
    }

    #[tokio::test]
    async fn test_failed_remove_is_isolated() {
        let filter = FakeFilter::with_rules([
            normalize("10.0.0.1", "tcp", "22"),
            normalize("10.0.0.2", "tcp", "22"),
        ]);
        filter.fail_remove_for(&normalize("10.0.0.1", "tcp", "22"));
        let plan = plan(&[], &[("10.0.0.1", "tcp", "22"), ("10.0.0.2", "tcp", "22")]);

        let outcome = applier(&filter).apply(&plan, &CancellationToken::new()).await;

        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].action, RuleAction::Remove);
        assert_eq!(outcome.failures[0].rule.from, "10.0.0.1");
        assert_eq!(filter.remove_count(), 2);
        assert_eq!(filter.commit_count(), 1);
        assert_eq!(filter.rules(), vec![normalize("10.0.0.1", "tcp", "22")]);
    }

    #[tokio::test]
    async fn test_remove_sharing_a_table_entry_with_kept_add_is_skipped() {
        let stored = normalize("203.0.113.7", "tcp", "22");
        let filter = FakeFilter::with_rules([stored.clone()]).storing_as(strip_host_prefix);
        let plan = ReconciliationPlan {
            to_add: vec![CanonicalRule {
                from: "203.0.113.7/32".to_string(),
                protocol: "tcp".to_string(),
                port: "22".to_string(),
            }],
            to_remove: vec![stored.clone()],
        };

        let outcome = applier(&filter).apply(&plan, &CancellationToken::new()).await;

        assert_eq!(outcome.already_present, 1);
        assert_eq!(outcome.shared_kept, 1);
        assert_eq!(outcome.removed, 0);
        assert_eq!(filter.remove_count(), 0);
        assert!(!outcome.committed);
        assert_eq!(filter.rules(), vec![stored]);
    }
}
