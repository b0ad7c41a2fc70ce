//! Core reconciliation functionality
//!
//! This module contains the types and logic that keep the ufw allow-list in
//! sync with the desired rule set. It provides:
//!
//! - [`rule`]: Canonical rule records, the normalizer and rule sets
//! - [`desired`]: Parsing of the control plane's desired-state document
//! - [`diff`]: Set difference between current and desired rules
//! - [`ufw`]: The packet-filter interface and its ufw implementation
//! - [`apply`]: Applying a plan through the packet filter
//! - [`reconcile`]: One reconciliation cycle and the loop that schedules cycles
//! - [`snapshot`]: Last-applied desired-state snapshot
//! - [`verify`]: Startup checks of the ufw installation
//! - [`error`]: Error types for reconciliation

pub mod apply;
pub mod desired;
pub mod diff;
pub mod error;
pub mod reconcile;
pub mod rule;
pub mod snapshot;
pub mod ufw;
pub mod verify;

#[cfg(test)]
pub mod test_helpers;
