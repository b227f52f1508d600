//! Replacement chain and garbage collection
//!
//! A CSV with `replaces: P` takes over from P in three steps, one link per pass:
//!
//! 1. once the successor is Succeeded, a Succeeded P moves to Replacing
//! 2. once nothing the successor also manages still records P as an owner,
//!    P moves to Deleting
//! 3. P is deleted; the garbage collector removes what only P owned and the
//!    finalizer removes P's label-owned objects
//!
//! P is never deleted unless its successor is Succeeded.

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use lifecycle_common::crd::{ClusterServiceVersion, CsvPhase, CsvReason};
use lifecycle_common::Error;

use crate::phase::{transition, Target, Transition};
use crate::plan::observed_keys;
use crate::resource::{CsvOwner, ResourceKey, ResourceKind};
use crate::store::ClusterStore;
use crate::strategy::InstallStrategy;

/// The CSV in `siblings` that names `csv` in `replaces`, if any
pub fn find_successor<'a>(
    csv: &ClusterServiceVersion,
    siblings: &'a [ClusterServiceVersion],
) -> Option<&'a ClusterServiceVersion> {
    let name = csv.name_any();
    siblings.iter().find(|s| {
        s.spec.replaces.as_deref() == Some(name.as_str()) && s.name_any() != name && !s.is_deleting()
    })
}

/// Whether `successor` has started writing install components, so shared
/// objects may already carry its spec.
///
/// Until then the predecessor keeps reconciling normally.
pub fn has_started_install(successor: &ClusterServiceVersion) -> bool {
    match successor.phase() {
        CsvPhase::Installing | CsvPhase::Succeeded | CsvPhase::Replacing | CsvPhase::Deleting => true,
        CsvPhase::Failed => {
            successor.status.as_ref().and_then(|s| s.reason) == Some(CsvReason::InstallComponentFailed)
        }
        CsvPhase::Pending | CsvPhase::InstallReady | CsvPhase::Unknown => false,
    }
}

/// Move the predecessor of a Succeeded `csv` to Replacing.
///
/// Returns the predecessor when it was transitioned. A `replaces` naming a
/// CSV that does not exist is not an error.
pub async fn retire_predecessor(
    store: &dyn ClusterStore,
    csv: &ClusterServiceVersion,
    now: DateTime<Utc>,
    max_retries: u32,
) -> Result<Option<ClusterServiceVersion>, Error> {
    let Some(predecessor_name) = csv.spec.replaces.as_deref() else {
        return Ok(None);
    };
    let namespace = csv.namespace().unwrap_or_default();
    let Some(predecessor) = store.get_csv(&namespace, predecessor_name).await? else {
        debug!(csv = %csv.name_any(), predecessor = predecessor_name, "replaced CSV not found");
        return Ok(None);
    };
    if predecessor.phase() != CsvPhase::Succeeded || predecessor.is_deleting() {
        return Ok(None);
    }

    let target = Target::new(
        CsvPhase::Replacing,
        CsvReason::BeingReplaced,
        format!("being replaced by csv: {}", csv.name_any()),
    );
    match transition(store, &predecessor, &target, now, max_retries).await? {
        Transition::Written { csv, .. } => Ok(Some(csv)),
        Transition::Unchanged(_) => Ok(None),
    }
}

/// Keys `csv` could have written, from its own spec; empty if the spec is unusable
fn managed_keys(csv: &ClusterServiceVersion) -> Vec<ResourceKey> {
    let spec = &csv.spec;
    match InstallStrategy::decode(&spec.install) {
        Ok(strategy) => observed_keys(
            spec,
            strategy.deployment(),
            &csv.name_any(),
            &csv.namespace().unwrap_or_default(),
        ),
        Err(_) => Vec::new(),
    }
}

/// Objects the successor also manages that still record `predecessor` as owner
pub async fn bridged_keys(
    store: &dyn ClusterStore,
    predecessor: &ClusterServiceVersion,
    successor: &ClusterServiceVersion,
) -> Result<Vec<ResourceKey>, Error> {
    let owner = CsvOwner::from_csv(predecessor)?;
    let ours = managed_keys(predecessor);
    let mut bridged = Vec::new();
    for key in managed_keys(successor) {
        if !ours.contains(&key) {
            continue;
        }
        if let Some(live) = store.get(&key).await? {
            if owner.owns(live.meta()) {
                bridged.push(key);
            }
        }
    }
    Ok(bridged)
}

/// Progress of a CSV in Replacing or Deleting
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    /// The successor disappeared before this CSV was deleted; back to Pending
    Reverted,
    /// The successor exists but is not Succeeded yet
    AwaitingSuccessor(String),
    /// Shared objects still record this CSV as owner
    Bridging(Vec<ResourceKey>),
    /// Moved to Deleting
    Released,
    /// Delete issued
    Deleted,
}

/// One pass for a CSV in Replacing
pub async fn handle_replacing(
    store: &dyn ClusterStore,
    csv: &ClusterServiceVersion,
    siblings: &[ClusterServiceVersion],
    now: DateTime<Utc>,
    max_retries: u32,
) -> Result<Step, Error> {
    let Some(successor) = find_successor(csv, siblings) else {
        let target = Target::new(
            CsvPhase::Pending,
            CsvReason::RequirementsUnknown,
            "successor no longer exists",
        );
        transition(store, csv, &target, now, max_retries).await?;
        return Ok(Step::Reverted);
    };
    let successor_name = successor.name_any();
    if successor.phase() != CsvPhase::Succeeded {
        return Ok(Step::AwaitingSuccessor(successor_name));
    }

    let bridged = bridged_keys(store, csv, successor).await?;
    if !bridged.is_empty() {
        debug!(csv = %csv.name_any(), remaining = bridged.len(), "successor has not adopted shared objects yet");
        return Ok(Step::Bridging(bridged));
    }

    let target = Target::new(
        CsvPhase::Deleting,
        CsvReason::Replaced,
        format!("has been replaced by csv: {successor_name}"),
    );
    transition(store, csv, &target, now, max_retries).await?;
    Ok(Step::Released)
}

/// One pass for a CSV in Deleting: delete it once the successor is still
/// Succeeded. Without a successor the CSV goes back to Pending.
pub async fn handle_deleting(
    store: &dyn ClusterStore,
    csv: &ClusterServiceVersion,
    siblings: &[ClusterServiceVersion],
    now: DateTime<Utc>,
    max_retries: u32,
) -> Result<Step, Error> {
    match find_successor(csv, siblings) {
        Some(successor) if successor.phase() == CsvPhase::Succeeded => {
            let namespace = csv.namespace().unwrap_or_default();
            store.delete_csv(&namespace, &csv.name_any()).await?;
            info!(csv = %csv.name_any(), successor = %successor.name_any(), "deleted replaced CSV");
            Ok(Step::Deleted)
        }
        Some(successor) => Ok(Step::AwaitingSuccessor(successor.name_any())),
        None => {
            warn!(csv = %csv.name_any(), "successor vanished before delete; resuming install");
            let target = Target::new(
                CsvPhase::Pending,
                CsvReason::RequirementsUnknown,
                "successor no longer exists",
            );
            transition(store, csv, &target, now, max_retries).await?;
            Ok(Step::Reverted)
        }
    }
}

/// Delete the objects `owner` owns only by label: cluster-scoped ones and
/// ones outside its namespace. Everything else goes with the CSV through
/// its owner references.
pub async fn release_label_owned(store: &dyn ClusterStore, owner: &CsvOwner) -> Result<usize, Error> {
    let selector = owner.label_selector();
    let mut deleted = 0;
    for kind in ResourceKind::ALL {
        for object in store.list_labeled(kind, &selector).await? {
            let key = object.key();
            if owner.uses_owner_reference(&key) || !owner.is_labeled_owner_of(object.meta()) {
                continue;
            }
            store.delete(&key).await?;
            debug!(resource = %key, "deleted label-owned object");
            deleted += 1;
        }
    }
    Ok(deleted)
}
