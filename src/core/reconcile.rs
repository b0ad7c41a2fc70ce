//! Reconciliation cycle and loop
//!
//! One cycle is: fetch desired state, probe the filter, diff, apply, and
//! optionally reload. Cycles are triggered at startup, on every timer tick and
//! on a resync request (SIGHUP). At most one cycle runs at a time; a trigger
//! that arrives while a cycle is running is dropped and counted, never queued.
//!
//! ```text
//!            trigger                      cycle finished
//!   Idle ─────────────────▶ Running ─────────────────────▶ Idle
//!     ▲                        │ trigger (dropped, counted)
//!     └────────────────────────┘
//! ```

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::core::apply::{ApplyOutcome, RuleApplier};
use crate::core::desired::DesiredState;
use crate::core::diff::{ReconciliationPlan, diff};
use crate::core::error::{Error, Result};
use crate::core::rule::{CaseFolding, RuleSet};
use crate::core::snapshot::{AppliedSnapshot, save_snapshot};
use crate::core::ufw::{BoxFuture, PacketFilter};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Supplies the desired rule set
pub trait RuleSource: Send + Sync {
    fn fetch<'a>(&'a self) -> BoxFuture<'a, Result<DesiredState>>;
}

/// Awaits `fut` unless `cancel` fires first.
async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Outcome of one reconciliation cycle
#[derive(Debug, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub desired: usize,
    pub current: usize,
    pub added: usize,
    pub removed: usize,
    pub already_present: usize,
    pub failed: usize,
    pub committed: bool,
    #[serde(serialize_with = "error_text")]
    pub error: Option<Error>,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn error_text<S: serde::Serializer>(
    e: &Option<Error>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match e {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

impl CycleReport {
    fn new(cycle_id: Uuid) -> Self {
        Self {
            cycle_id,
            started_at: chrono::Utc::now(),
            duration: Duration::ZERO,
            desired: 0,
            current: 0,
            added: 0,
            removed: 0,
            already_present: 0,
            failed: 0,
            committed: false,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed == 0
    }

    fn absorb(&mut self, outcome: ApplyOutcome) {
        self.added = outcome.added;
        self.removed = outcome.removed;
        self.already_present = outcome.already_present;
        self.failed = outcome.failures.len();
        self.committed = outcome.committed;
        self.error = outcome.error;
    }

    /// Emits the report through `tracing`.
    pub fn log(&self) {
        let duration_ms = u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX);
        match &self.error {
            None if self.failed == 0 => info!(
                cycle_id = %self.cycle_id,
                duration_ms,
                desired = self.desired,
                current = self.current,
                added = self.added,
                removed = self.removed,
                already_present = self.already_present,
                committed = self.committed,
                "cycle completed"
            ),
            None => warn!(
                cycle_id = %self.cycle_id,
                duration_ms,
                added = self.added,
                removed = self.removed,
                failed = self.failed,
                committed = self.committed,
                "cycle completed with failed rules"
            ),
            Some(Error::Cancelled) => info!(
                cycle_id = %self.cycle_id,
                duration_ms,
                "cycle cancelled by shutdown"
            ),
            Some(e) => error!(
                cycle_id = %self.cycle_id,
                duration_ms,
                added = self.added,
                removed = self.removed,
                failed = self.failed,
                error = %e,
                "cycle failed"
            ),
        }
    }
}

/// Desired and current state plus the plan between them
#[derive(Debug)]
pub struct PreparedCycle {
    pub desired: RuleSet,
    pub current: RuleSet,
    pub plan: ReconciliationPlan,
}

/// Runs reconciliation cycles against one source and one filter
pub struct Reconciler {
    source: Arc<dyn RuleSource>,
    filter: Arc<dyn PacketFilter>,
    folding: CaseFolding,
    snapshot_path: Option<PathBuf>,
    audit: Option<AuditLog>,
    enforce: bool,
}

impl Reconciler {
    pub fn new(source: Arc<dyn RuleSource>, filter: Arc<dyn PacketFilter>, folding: CaseFolding) -> Self {
        Self {
            source,
            filter,
            folding,
            snapshot_path: None,
            audit: None,
            enforce: true,
        }
    }

    /// With enforcement off, cycles only fetch and snapshot the desired
    /// state; the filter is never probed or changed.
    pub fn with_enforcement(mut self, enforce: bool) -> Self {
        self.enforce = enforce;
        self
    }

    /// Writes the last fetched document to `path` every cycle.
    pub fn with_snapshot(mut self, path: Option<PathBuf>) -> Self {
        self.snapshot_path = path;
        self
    }

    pub fn with_audit(mut self, audit: Option<AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn filter(&self) -> &dyn PacketFilter {
        self.filter.as_ref()
    }

    pub fn folding(&self) -> CaseFolding {
        self.folding
    }

    /// Fetches, probes and diffs without touching the filter.
    ///
    /// # Errors
    ///
    /// Returns the fetch, parse or probe error, or [`Error::Cancelled`] when
    /// `cancel` fires first.
    pub async fn prepare(&self, cancel: &CancellationToken) -> Result<PreparedCycle> {
        let desired = self.fetch_desired(cancel).await?;
        if desired.is_empty() {
            warn!("desired rule set is empty; every owned rule will be removed");
        }

        let current = cancellable(cancel, self.filter.list_rules(self.folding)).await?;
        let plan = diff(&current, &desired);

        Ok(PreparedCycle {
            desired,
            current,
            plan,
        })
    }

    /// Fetches and canonicalizes the desired state, writing the snapshot.
    pub async fn fetch_desired(&self, cancel: &CancellationToken) -> Result<RuleSet> {
        let state = cancellable(cancel, self.source.fetch()).await?;
        let desired = RuleSet::from_raw(&state.rules, self.folding);
        self.write_snapshot(state.document);
        Ok(desired)
    }

    fn write_snapshot(&self, document: serde_json::Value) {
        if let Some(path) = &self.snapshot_path
            && let Err(e) = save_snapshot(path, &AppliedSnapshot::new(document))
        {
            warn!(path = %path.display(), error = %e, "failed to write last-applied snapshot");
        }
    }

    /// Runs one full cycle. Never fails: every error ends up in the report.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::new(Uuid::new_v4());

        let span = info_span!("cycle", cycle_id = %report.cycle_id);
        async {
            if !self.enforce {
                match self.fetch_desired(cancel).await {
                    Ok(desired) => {
                        report.desired = desired.len();
                        info!(rules = report.desired, "firewall management disabled; rules not applied");
                    }
                    Err(e) => report.error = Some(e),
                }
                return;
            }

            match self.prepare(cancel).await {
                Ok(prepared) => {
                    report.desired = prepared.desired.len();
                    report.current = prepared.current.len();
                    if prepared.plan.is_empty() {
                        debug!(rules = report.desired, "firewall already in sync");
                    } else {
                        info!(
                            to_add = prepared.plan.to_add.len(),
                            to_remove = prepared.plan.to_remove.len(),
                            "applying plan"
                        );
                    }
                    let outcome = RuleApplier::new(self.filter.as_ref(), self.folding, report.cycle_id)
                        .with_audit(self.audit.as_ref())
                        .apply(&prepared.plan, cancel)
                        .await;
                    report.absorb(outcome);
                }
                Err(e) => report.error = Some(e),
            }
        }
        .instrument(span)
        .await;

        report.duration = started.elapsed();
        report.log();
        self.audit_cycle(&report).await;
        report
    }

    async fn audit_cycle(&self, report: &CycleReport) {
        let Some(audit) = &self.audit else {
            return;
        };
        let details = serde_json::to_value(report).unwrap_or_default();
        let event = AuditEvent::new(
            EventType::Cycle,
            report.cycle_id,
            report.is_success(),
            details,
            report.error.as_ref().map(ToString::to_string),
        );
        audit.record(event).await;
    }
}

/// Loop state as seen by triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CycleState {
    Idle,
    Running,
}

/// Admits at most one cycle at a time
#[derive(Debug, Default)]
pub struct CycleGate {
    running: AtomicBool,
    dropped: AtomicU64,
}

impl CycleGate {
    /// Moves `Idle -> Running`. Returns `None` and counts the trigger as
    /// dropped when a cycle is already running.
    pub fn try_enter(self: &Arc<Self>) -> Option<CycleGuard> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(CycleGuard(Arc::clone(self)))
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn state(&self) -> CycleState {
        if self.running.load(Ordering::Acquire) {
            CycleState::Running
        } else {
            CycleState::Idle
        }
    }

    pub fn dropped_triggers(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Returns the gate to `Idle` when dropped
#[derive(Debug)]
pub struct CycleGuard(Arc<CycleGate>);

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

/// What started a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Trigger {
    Timer,
    Resync,
}

/// Counters reported when the loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles_started: u64,
    pub triggers_dropped: u64,
}

/// Runs cycles until `cancel` fires.
///
/// The first timer tick fires immediately, which is the startup cycle. Ticks
/// missed while a cycle runs are skipped rather than burst. On cancellation no
/// new cycle starts and the in-flight one, if any, is awaited.
pub async fn run_reconciliation_loop(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    resync: Arc<Notify>,
    cancel: CancellationToken,
) -> LoopStats {
    let gate = Arc::new(CycleGate::default());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut stats = LoopStats::default();
    let mut in_flight: Option<JoinHandle<()>> = None;

    info!(interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "reconciliation loop started");

    loop {
        let trigger = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => Trigger::Timer,
            () = resync.notified() => Trigger::Resync,
        };

        let Some(guard) = gate.try_enter() else {
            info!(
                trigger = %trigger,
                dropped = gate.dropped_triggers(),
                "cycle still running; trigger dropped"
            );
            continue;
        };

        debug!(trigger = %trigger, "starting cycle");
        stats.cycles_started += 1;

        let reconciler = Arc::clone(&reconciler);
        let token = cancel.clone();
        in_flight = Some(tokio::spawn(async move {
            let _guard = guard;
            reconciler.run_cycle(&token).await;
        }));
    }

    if let Some(handle) = in_flight {
        if gate.state() == CycleState::Running {
            info!("waiting for in-flight cycle to finish");
        }
        if let Err(e) = handle.await {
            error!(error = %e, "cycle task panicked");
        }
    }

    stats.triggers_dropped = gate.dropped_triggers();
    info!(
        cycles = stats.cycles_started,
        dropped = stats.triggers_dropped,
        "reconciliation loop stopped"
    );
    stats
}
