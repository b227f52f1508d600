//! Phase state machine
//!
//! The controller decides a [`Target`] phase for each pass; this module checks
//! the transition is legal, folds it into the existing status, and writes it
//! only when something changed.

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, info};

use lifecycle_common::crd::{
    ClusterServiceVersion, ClusterServiceVersionStatus, CsvCondition, CsvPhase, CsvReason,
    RequirementStatus, MAX_CONDITIONS,
};
use lifecycle_common::Error;

use crate::store::ClusterStore;

/// Whether a CSV in `from` may move to `to`
pub fn can_transition(from: CsvPhase, to: CsvPhase) -> bool {
    use CsvPhase::*;
    if from == to {
        return true;
    }
    match (from, to) {
        (Deleting, Pending) => true,
        (Deleting, _) => false,
        (Replacing, Pending | Deleting) => true,
        (Replacing, _) => false,
        (_, Deleting) => false,
        (Succeeded, Replacing) => true,
        (_, Replacing) => false,
        (_, Failed | Unknown) => true,
        (Pending | Unknown, InstallReady) => true,
        (InstallReady | Installing | Failed | Unknown, Installing | Succeeded) => true,
        (Succeeded, Installing) => true,
        (InstallReady | Installing | Failed | Unknown, Pending) => true,
        (Failed, InstallReady) => true,
        _ => false,
    }
}

/// What the controller wants the status to say after this pass
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub phase: CsvPhase,
    pub reason: CsvReason,
    pub message: String,
    /// Fresh requirement results; `None` keeps the recorded ones
    pub requirements: Option<Vec<RequirementStatus>>,
}

impl Target {
    pub fn new(phase: CsvPhase, reason: CsvReason, message: impl Into<String>) -> Self {
        Self {
            phase,
            reason,
            message: message.into(),
            requirements: None,
        }
    }

    pub fn with_requirements(mut self, requirements: Vec<RequirementStatus>) -> Self {
        self.requirements = Some(requirements);
        self
    }
}

/// Status after applying `target`, or `None` when nothing would change.
///
/// Timestamps only move when the status actually changes, so repeating a
/// pass against an unchanged cluster writes nothing.
pub fn next_status(
    current: Option<&ClusterServiceVersionStatus>,
    target: &Target,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Option<ClusterServiceVersionStatus>, Error> {
    let current = current.cloned().unwrap_or_default();
    if !can_transition(current.phase, target.phase) {
        return Err(Error::internal_with_context(
            "phase",
            format!("illegal transition {} -> {}", current.phase, target.phase),
        ));
    }

    let requirements = target
        .requirements
        .clone()
        .unwrap_or_else(|| current.requirement_status.clone());
    let observed_generation = generation.or(current.observed_generation);
    let phase_changed = current.phase != target.phase || current.last_transition_time.is_none();
    let unchanged = !phase_changed
        && current.reason == Some(target.reason)
        && current.message.as_deref() == Some(target.message.as_str())
        && current.requirement_status == requirements
        && current.observed_generation == observed_generation;
    if unchanged {
        return Ok(None);
    }

    let last_transition_time = if phase_changed {
        now
    } else {
        current.last_transition_time.unwrap_or(now)
    };

    let mut conditions = current.conditions;
    if phase_changed || current.reason != Some(target.reason) {
        conditions.push(CsvCondition {
            phase: target.phase,
            reason: Some(target.reason),
            message: Some(target.message.clone()),
            last_update_time: now,
            last_transition_time,
        });
        if conditions.len() > MAX_CONDITIONS {
            let excess = conditions.len() - MAX_CONDITIONS;
            conditions.drain(..excess);
        }
    }

    Ok(Some(ClusterServiceVersionStatus {
        phase: target.phase,
        reason: Some(target.reason),
        message: Some(target.message.clone()),
        last_update_time: Some(now),
        last_transition_time: Some(last_transition_time),
        observed_generation,
        requirement_status: requirements,
        conditions,
    }))
}

/// Outcome of [`transition`]
#[derive(Clone, Debug)]
pub enum Transition {
    /// The status already said this; nothing was written
    Unchanged(ClusterServiceVersion),
    /// The status was written; `from` is the phase before the write
    Written {
        csv: ClusterServiceVersion,
        from: CsvPhase,
    },
}

impl Transition {
    pub fn csv(&self) -> &ClusterServiceVersion {
        match self {
            Transition::Unchanged(csv) | Transition::Written { csv, .. } => csv,
        }
    }

    /// True when the write moved the CSV to a different phase
    pub fn changed_phase(&self) -> bool {
        match self {
            Transition::Unchanged(_) => false,
            Transition::Written { csv, from } => csv.phase() != *from,
        }
    }
}

/// Move `csv` toward `target`, writing conditionally on its resourceVersion.
///
/// A conflict re-reads the CSV and recomputes the status against the fresh
/// copy, at most `max_retries` times.
pub async fn transition(
    store: &dyn ClusterStore,
    csv: &ClusterServiceVersion,
    target: &Target,
    now: DateTime<Utc>,
    max_retries: u32,
) -> Result<Transition, Error> {
    let namespace = csv.namespace().unwrap_or_default();
    let name = csv.name_any();
    let mut current = csv.clone();
    let mut attempt = 0;
    loop {
        let Some(status) = next_status(
            current.status.as_ref(),
            target,
            current.metadata.generation,
            now,
        )?
        else {
            return Ok(Transition::Unchanged(current));
        };

        let from = current.phase();
        let mut updated = current.clone();
        updated.status = Some(status);
        match store.update_csv_status(&updated).await {
            Ok(written) => {
                if from != target.phase {
                    info!(csv = %name, from = %from, to = %target.phase, reason = %target.reason, "phase transition");
                }
                return Ok(Transition::Written { csv: written, from });
            }
            Err(e) if e.is_conflict() && attempt < max_retries => {
                attempt += 1;
                debug!(csv = %name, attempt, "status write conflicted, re-reading");
                current = store
                    .get_csv(&namespace, &name)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("ClusterServiceVersion {namespace}/{name}")))?;
            }
            Err(e) => return Err(e),
        }
    }
}
