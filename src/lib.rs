//! fwsync - firewall rule synchronization agent
//!
//! Keeps the host's ufw allow-list equal to a firewall policy declared on a
//! remote control plane. Each cycle fetches the desired rules, probes ufw for
//! the rules it currently holds, diffs the two canonical sets, and applies the
//! difference one rule at a time.
//!
//! # Architecture
//!
//! - [`core`] - Rule canonicalization, diffing, the ufw adapter, the applier
//!   and the reconciliation loop
//! - [`client`] - Control-plane HTTP client (desired state, health telemetry)
//! - [`config`] - YAML + environment configuration
//! - [`health`] - Host health collection loop
//! - [`audit`] - JSON-lines audit trail of cycles and rule mutations
//! - [`elevation`] - Running ufw through sudo or run0 when not root
//! - [`validators`] - Rule field validation before any ufw invocation
//!
//! # Safety Features
//!
//! - Fetch or probe failures abort the cycle before any rule is touched
//! - Only plain allow rules are owned; everything else in ufw is left alone
//! - One cycle at a time; overlapping triggers are dropped
//! - Shutdown never interrupts a rule command halfway
//! - Arguments reach ufw without a shell

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod client;
pub mod config;
pub mod core;
pub mod elevation;
pub mod health;
pub mod logging;
pub mod shutdown;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::rule::{CanonicalRule, CaseFolding, RawRule, RuleSet};
