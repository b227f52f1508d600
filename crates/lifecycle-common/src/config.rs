//! Operator configuration
//!
//! The CLI populates [`OperatorConfig`]; tests use `Default` and override
//! what they need.

use std::time::Duration;

use crate::{Error, FIELD_MANAGER};

/// Tunables for the CSV controller
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Only reconcile CSVs in this namespace (`None` = all namespaces)
    pub watch_namespace: Option<String>,
    /// Field manager recorded on writes
    pub field_manager: String,
    /// Upper bound on a single reconcile pass
    pub reconcile_timeout: Duration,
    /// Requeue interval while requirements are unmet
    pub requeue_pending: Duration,
    /// Requeue interval while an install is in flight
    pub requeue_installing: Duration,
    /// Drift-check interval for Succeeded CSVs
    pub requeue_succeeded: Duration,
    /// Retry interval for Failed CSVs
    pub requeue_failed: Duration,
    /// Requeue interval while a replacement is bridged
    pub requeue_replacing: Duration,
    /// Immediate re-read-and-retry attempts after a write conflict
    pub max_conflict_retries: u32,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            field_manager: FIELD_MANAGER.to_string(),
            reconcile_timeout: Duration::from_secs(60),
            requeue_pending: Duration::from_secs(10),
            requeue_installing: Duration::from_secs(5),
            requeue_succeeded: Duration::from_secs(300),
            requeue_failed: Duration::from_secs(30),
            requeue_replacing: Duration::from_secs(5),
            max_conflict_retries: 3,
        }
    }
}

impl OperatorConfig {
    /// Reject settings that would stall or hot-loop the controller
    pub fn validate(&self) -> Result<(), Error> {
        if self.field_manager.trim().is_empty() {
            return Err(Error::validation("field manager must not be empty"));
        }
        if self.reconcile_timeout.is_zero() {
            return Err(Error::validation("reconcile timeout must be greater than zero"));
        }
        for (name, interval) in [
            ("pending", self.requeue_pending),
            ("installing", self.requeue_installing),
            ("succeeded", self.requeue_succeeded),
            ("failed", self.requeue_failed),
            ("replacing", self.requeue_replacing),
        ] {
            if interval.is_zero() {
                return Err(Error::validation(format!(
                    "{name} requeue interval must be greater than zero"
                )));
            }
        }
        if let Some(ns) = &self.watch_namespace {
            if ns.is_empty() {
                return Err(Error::validation("watch namespace must not be empty when set"));
            }
        }
        Ok(())
    }
}
