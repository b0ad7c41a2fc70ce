//! Shared test utilities for core module tests
//!
//! Provides an in-memory packet filter and a canned rule source so that the
//! applier and the reconciliation loop can be tested without ufw or a network.
//! This module is only compiled in test mode.

use crate::core::desired::DesiredState;
use crate::core::error::{Error, Result};
use crate::core::reconcile::RuleSource;
use crate::core::rule::{CanonicalRule, CaseFolding, RuleKey, RuleSet};
use crate::core::ufw::{BoxFuture, Mutation, PacketFilter};
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Mutex for tests that need exclusive access to environment variables.
///
/// Use this when your test needs to:
/// 1. Temporarily change env vars to different values
/// 2. Restore env vars after the test
/// 3. Test behavior when env vars are absent
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("FWSYNC_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("FWSYNC_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

fn fake_key(rule: &CanonicalRule) -> RuleKey {
    rule.key(CaseFolding::Insensitive)
}

/// Drops a full-length prefix from the source, as ufw does when it stores a rule.
pub fn strip_host_prefix(rule: &CanonicalRule) -> CanonicalRule {
    let from = rule
        .from
        .strip_suffix("/32")
        .or_else(|| rule.from.strip_suffix("/128"))
        .unwrap_or(&rule.from);
    CanonicalRule {
        from: from.to_string(),
        ..rule.clone()
    }
}

/// One call made against a [`FakeFilter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterCall {
    List,
    Add(CanonicalRule),
    Remove(CanonicalRule),
    Commit,
}

#[derive(Debug, Default)]
struct FakeState {
    rules: Vec<CanonicalRule>,
    calls: Vec<FilterCall>,
    fail_add: HashSet<RuleKey>,
    fail_remove: HashSet<RuleKey>,
}

/// In-memory [`PacketFilter`] with call recording and failure injection
#[derive(Debug, Default)]
pub struct FakeFilter {
    state: Mutex<FakeState>,
    fail_list: AtomicBool,
    fail_commit: AtomicBool,
    delay: Option<Duration>,
    rewrite: Option<fn(&CanonicalRule) -> CanonicalRule>,
}

impl FakeFilter {
    pub fn with_rules(rules: impl IntoIterator<Item = CanonicalRule>) -> Self {
        let filter = Self::default();
        filter.lock().rules.extend(rules);
        filter
    }

    /// Makes every mutation take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Passes every added or removed rule through `rewrite` first, the way
    /// ufw stores addresses in its own form.
    pub fn storing_as(mut self, rewrite: fn(&CanonicalRule) -> CanonicalRule) -> Self {
        self.rewrite = Some(rewrite);
        self
    }

    fn stored_form(&self, rule: &CanonicalRule) -> CanonicalRule {
        self.rewrite.map_or_else(|| rule.clone(), |rewrite| rewrite(rule))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn fail_add_for(&self, rule: &CanonicalRule) {
        self.lock().fail_add.insert(fake_key(rule));
    }

    pub fn fail_remove_for(&self, rule: &CanonicalRule) {
        self.lock().fail_remove.insert(fake_key(rule));
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Current table contents, in insertion order.
    pub fn rules(&self) -> Vec<CanonicalRule> {
        self.lock().rules.clone()
    }

    pub fn calls(&self) -> Vec<FilterCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn count(&self, pred: impl Fn(&FilterCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn add_count(&self) -> usize {
        self.count(|c| matches!(c, FilterCall::Add(_)))
    }

    pub fn remove_count(&self) -> usize {
        self.count(|c| matches!(c, FilterCall::Remove(_)))
    }

    pub fn commit_count(&self) -> usize {
        self.count(|c| matches!(c, FilterCall::Commit))
    }

    pub fn mutation_count(&self) -> usize {
        self.add_count() + self.remove_count()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn command_error(command: &str, rule: &CanonicalRule) -> Error {
        Error::Command {
            command: format!("ufw {command} {rule}"),
            message: "injected failure".to_string(),
            exit_code: Some(1),
        }
    }
}

impl PacketFilter for FakeFilter {
    fn list_rules<'a>(&'a self, folding: CaseFolding) -> BoxFuture<'a, Result<RuleSet>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(FilterCall::List);
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(Error::parse("ufw status", "injected failure", ""));
            }
            Ok(RuleSet::from_rules(state.rules.clone(), folding))
        })
    }

    fn add_rule<'a>(&'a self, rule: &'a CanonicalRule) -> BoxFuture<'a, Result<Mutation>> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.lock();
            state.calls.push(FilterCall::Add(rule.clone()));
            if state.fail_add.contains(&fake_key(rule)) {
                return Err(Self::command_error("allow", rule));
            }
            let stored = self.stored_form(rule);
            let key = fake_key(&stored);
            if state.rules.iter().any(|r| fake_key(r) == key) {
                return Ok(Mutation::Unchanged);
            }
            state.rules.push(stored);
            Ok(Mutation::Changed)
        })
    }

    fn remove_rule<'a>(&'a self, rule: &'a CanonicalRule) -> BoxFuture<'a, Result<Mutation>> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.lock();
            state.calls.push(FilterCall::Remove(rule.clone()));
            if state.fail_remove.contains(&fake_key(rule)) {
                return Err(Self::command_error("delete allow", rule));
            }
            let key = fake_key(&self.stored_form(rule));
            match state.rules.iter().position(|r| fake_key(r) == key) {
                Some(index) => {
                    state.rules.remove(index);
                    Ok(Mutation::Changed)
                }
                None => Ok(Mutation::Unchanged),
            }
        })
    }

    fn commit<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.lock().calls.push(FilterCall::Commit);
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(Error::Command {
                    command: "ufw reload".to_string(),
                    message: "injected failure".to_string(),
                    exit_code: Some(1),
                });
            }
            Ok(())
        })
    }
}

/// Canned [`RuleSource`] serving a JSON body, with concurrency tracking
#[derive(Debug, Default)]
pub struct StaticSource {
    body: Mutex<String>,
    fail_fetch: AtomicBool,
    delay: Option<Duration>,
    fetches: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl StaticSource {
    pub fn from_body(body: impl Into<String>) -> Self {
        Self {
            body: Mutex::new(body.into()),
            ..Self::default()
        }
    }

    /// Serves a well-formed document with the given `(from, protocol, port)` rules.
    pub fn with_rules(rules: &[(&str, &str, &str)]) -> Self {
        Self::from_body(rules_document(rules))
    }

    /// Makes every fetch take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_body(&self, body: impl Into<String>) {
        *self
            .body
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = body.into();
    }

    pub fn set_rules(&self, rules: &[(&str, &str, &str)]) {
        self.set_body(rules_document(rules));
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Highest number of fetches observed running at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl RuleSource for StaticSource {
    fn fetch<'a>(&'a self) -> BoxFuture<'a, Result<DesiredState>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail_fetch.load(Ordering::SeqCst) {
                return Err(Error::Fetch {
                    endpoint: "static".to_string(),
                    message: "injected failure".to_string(),
                    status: Some(503),
                });
            }
            let body = self
                .body
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();
            DesiredState::parse(&body)
        })
    }
}

/// Builds a desired-state document from `(from, protocol, port)` triples.
pub fn rules_document(rules: &[(&str, &str, &str)]) -> String {
    let rules: Vec<serde_json::Value> = rules
        .iter()
        .map(|(from, protocol, port)| {
            serde_json::json!({ "from": from, "protocol": protocol, "port": port })
        })
        .collect();
    serde_json::json!({ "firewall": { "rules": rules } }).to_string()
}
