//! Install executor
//!
//! Applies planned [`Write`]s in dependency order: identities and grants
//! before the workloads that use them, the APIService registration last.
//! "Already exists" and "conflict" are not failures; the live copy is
//! re-read and the write retried a bounded number of times.

use tracing::{debug, info};

use lifecycle_common::Error;

use crate::plan::Write;
use crate::resource::{in_sync, merge_for_update};
use crate::store::ClusterStore;

/// Apply `writes`, returning how many objects were created or updated.
///
/// The first failing object aborts the run with an [`Error::Install`] naming it.
pub async fn apply(
    store: &dyn ClusterStore,
    mut writes: Vec<Write>,
    max_conflict_retries: u32,
) -> Result<usize, Error> {
    writes.sort_by_key(|w| w.desired.kind());
    let mut applied = 0;
    for write in writes {
        let key = write.key();
        match apply_one(store, write, max_conflict_retries).await {
            Ok(true) => applied += 1,
            Ok(false) => {}
            Err(e) => return Err(Error::install(key.to_string(), e.to_string())),
        }
    }
    Ok(applied)
}

/// Returns false when a re-read showed the object already matched
async fn apply_one(
    store: &dyn ClusterStore,
    write: Write,
    max_conflict_retries: u32,
) -> Result<bool, Error> {
    let key = write.key();
    let desired = write.desired;
    let mut observed = write.observed;
    let mut attempt = 0;
    loop {
        let result = match &observed {
            None => store.create(&desired).await,
            Some(live) => store.replace(&merge_for_update(&desired, live)).await,
        };
        let recheck = match result {
            Ok(_) => {
                let verb = if observed.is_some() { "updated" } else { "created" };
                info!(resource = %key, "{verb}");
                return Ok(true);
            }
            Err(e) if e.is_already_exists() || e.is_conflict() => e,
            Err(e) if e.is_not_found() && observed.is_some() => e,
            Err(e) => return Err(e),
        };

        if attempt >= max_conflict_retries {
            return Err(recheck);
        }
        attempt += 1;
        debug!(resource = %key, attempt, error = %recheck, "re-reading after write race");
        observed = store.get(&key).await?;
        if observed.as_ref().is_some_and(|live| in_sync(&desired, live)) {
            return Ok(false);
        }
    }
}
