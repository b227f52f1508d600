//! ClusterServiceVersion controller
//!
//! One reconcile pass: observe the CSV and everything it names, decide the
//! next phase, perform at most one step of work toward it, and record the
//! result. Every pass re-derives the desired state from the spec.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use lifecycle_common::config::OperatorConfig;
use lifecycle_common::crd::{ClusterServiceVersion, CsvPhase, CsvReason};
use lifecycle_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use lifecycle_common::{Error, CSV_FINALIZER};

use crate::install;
use crate::phase::{transition, Target, Transition};
use crate::plan::{self, ClusterState};
use crate::replacement::{self, Step};
use crate::requirements;
use crate::resource::CsvOwner;
use crate::store::{ClusterStore, KubeStore};
use crate::strategy::InstallStrategy;

/// Name the controller reports Events as
pub const CONTROLLER_NAME: &str = "csv-controller";

/// Shared state for reconcile passes
///
/// ```text
/// let ctx = Context::builder(client).config(config).build();
/// ```
pub struct Context {
    /// Cluster access (trait object so tests can substitute a fake)
    pub store: Arc<dyn ClusterStore>,
    /// Event sink for phase transitions
    pub events: Arc<dyn EventPublisher>,
    pub config: OperatorConfig,
}

impl Context {
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Context with default configuration
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Context over an arbitrary store with events discarded
    #[cfg(test)]
    pub fn for_testing(store: Arc<dyn ClusterStore>) -> Self {
        Self {
            store,
            events: Arc::new(lifecycle_common::events::NoopEventPublisher),
            config: OperatorConfig::default(),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    store: Option<Arc<dyn ClusterStore>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: OperatorConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            store: None,
            events: None,
            config: OperatorConfig::default(),
        }
    }

    pub fn config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the cluster store
    pub fn store(mut self, store: Arc<dyn ClusterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Context {
        let store = self.store.unwrap_or_else(|| {
            Arc::new(KubeStore::new(self.client.clone(), self.config.field_manager.clone()))
        });
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME)));
        Context {
            store,
            events,
            config: self.config,
        }
    }
}

/// Reconcile a ClusterServiceVersion, bounded by the configured timeout
#[instrument(skip(csv, ctx), fields(csv = %csv.name_any(), namespace = ?csv.namespace()))]
pub async fn reconcile(csv: Arc<ClusterServiceVersion>, ctx: Arc<Context>) -> Result<Action, Error> {
    let limit = ctx.config.reconcile_timeout;
    match tokio::time::timeout(limit, reconcile_at(&csv, &ctx, Utc::now())).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(
            format!("reconcile of {}", csv.name_any()),
            limit.as_secs(),
        )),
    }
}

/// Requeue policy after a failed pass
pub fn error_policy(csv: Arc<ClusterServiceVersion>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(?error, csv = %csv.name_any(), "reconciliation failed");
    if error.is_retryable() {
        Action::requeue(ctx.config.requeue_installing)
    } else {
        Action::requeue(ctx.config.requeue_failed)
    }
}

/// One pass at a fixed clock reading
pub async fn reconcile_at(
    csv: &ClusterServiceVersion,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    let owner = CsvOwner::from_csv(csv)?;
    if csv.is_deleting() {
        return finalize(csv, &owner, ctx).await;
    }
    let csv = ensure_finalizer(csv, ctx).await?;
    let siblings = ctx.store.list_csvs(&owner.namespace).await?;
    let cfg = &ctx.config;

    match csv.phase() {
        CsvPhase::Replacing => {
            let step = replacement::handle_replacing(
                ctx.store.as_ref(),
                &csv,
                &siblings,
                now,
                cfg.max_conflict_retries,
            )
            .await?;
            Ok(after_step(&csv, step, ctx).await)
        }
        CsvPhase::Deleting => {
            let step = replacement::handle_deleting(
                ctx.store.as_ref(),
                &csv,
                &siblings,
                now,
                cfg.max_conflict_retries,
            )
            .await?;
            Ok(after_step(&csv, step, ctx).await)
        }
        _ => drive(&csv, &owner, &siblings, ctx, now).await,
    }
}

async fn after_step(csv: &ClusterServiceVersion, step: Step, ctx: &Context) -> Action {
    let cfg = &ctx.config;
    match step {
        Step::Reverted => Action::requeue(cfg.requeue_pending),
        Step::AwaitingSuccessor(successor) => {
            debug!(csv = %csv.name_any(), %successor, "waiting for successor to succeed");
            Action::requeue(cfg.requeue_replacing)
        }
        Step::Bridging(_) => Action::requeue(cfg.requeue_replacing),
        Step::Released => {
            publish(ctx, csv, CsvReason::Replaced, None).await;
            Action::requeue(cfg.requeue_replacing)
        }
        Step::Deleted => Action::await_change(),
    }
}

async fn ensure_finalizer(
    csv: &ClusterServiceVersion,
    ctx: &Context,
) -> Result<ClusterServiceVersion, Error> {
    if csv.finalizers().iter().any(|f| f == CSV_FINALIZER) {
        return Ok(csv.clone());
    }
    let mut finalizers = csv.finalizers().to_vec();
    finalizers.push(CSV_FINALIZER.to_string());
    ctx.store.set_csv_finalizers(csv, finalizers).await
}

async fn finalize(csv: &ClusterServiceVersion, owner: &CsvOwner, ctx: &Context) -> Result<Action, Error> {
    if !csv.finalizers().iter().any(|f| f == CSV_FINALIZER) {
        return Ok(Action::await_change());
    }
    let released = replacement::release_label_owned(ctx.store.as_ref(), owner).await?;
    info!(csv = %owner.name, released, "released label-owned objects");
    let remaining = csv
        .finalizers()
        .iter()
        .filter(|f| *f != CSV_FINALIZER)
        .cloned()
        .collect();
    ctx.store.set_csv_finalizers(csv, remaining).await?;
    Ok(Action::await_change())
}

async fn drive(
    csv: &ClusterServiceVersion,
    owner: &CsvOwner,
    siblings: &[ClusterServiceVersion],
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    let cfg = &ctx.config;
    let phase = csv.phase();

    if phase == CsvPhase::Succeeded {
        let installing_successor = replacement::find_successor(csv, siblings)
            .filter(|successor| replacement::has_started_install(successor));
        if let Some(successor) = installing_successor {
            debug!(successor = %successor.name_any(), "successor is installing, install frozen");
            return Ok(Action::requeue(cfg.requeue_replacing));
        }
    }

    let strategy = match InstallStrategy::decode_and_validate(
        &csv.spec.install,
        &csv.spec.api_service_definitions,
    ) {
        Ok(strategy) => strategy,
        Err(e) => {
            warn!(csv = %owner.name, error = %e, "invalid install strategy");
            let target = Target::new(CsvPhase::Failed, CsvReason::InvalidStrategy, e.to_string());
            record(csv, &target, ctx, now).await?;
            return Ok(Action::await_change());
        }
    };
    let strategy = strategy.deployment();

    let keys = plan::observed_keys(&csv.spec, strategy, &owner.name, &owner.namespace);
    let state = match ClusterState::observe(ctx.store.as_ref(), &csv.spec, &owner.namespace, &keys).await {
        Ok(state) => state,
        Err(e) => {
            let target = Target::new(CsvPhase::Unknown, CsvReason::EvaluationError, e.to_string());
            if let Err(write_err) = record(csv, &target, ctx, now).await {
                warn!(csv = %owner.name, error = %write_err, "could not record evaluation error");
            }
            return Err(Error::evaluation(&owner.name, e.to_string()));
        }
    };

    let evaluation = requirements::evaluate(&csv.spec, &owner.namespace, strategy, &state);
    if !evaluation.all_met() {
        let lost_after_install = phase == CsvPhase::Succeeded
            || (phase == CsvPhase::Failed
                && csv.status.as_ref().and_then(|s| s.reason) == Some(CsvReason::RequirementsNotMet));
        let next = if lost_after_install {
            CsvPhase::Failed
        } else {
            CsvPhase::Pending
        };
        let target = Target::new(next, CsvReason::RequirementsNotMet, evaluation.message())
            .with_requirements(evaluation.statuses);
        record(csv, &target, ctx, now).await?;
        return Ok(Action::requeue(cfg.requeue_pending));
    }

    if matches!(phase, CsvPhase::Pending | CsvPhase::Unknown) {
        let target = Target::new(
            CsvPhase::InstallReady,
            CsvReason::AllRequirementsMet,
            evaluation.message(),
        )
        .with_requirements(evaluation.statuses);
        record(csv, &target, ctx, now).await?;
        return Ok(Action::requeue(cfg.requeue_installing));
    }

    let statuses = evaluation.statuses;
    let writes = plan::desired_resources(owner, &csv.spec, strategy, &state, now)
        .map(|desired| plan::plan_writes(desired, &state));
    let applied = match writes {
        Ok(writes) if writes.is_empty() => Ok(0),
        Ok(writes) => install::apply(ctx.store.as_ref(), writes, cfg.max_conflict_retries).await,
        Err(e) => Err(e),
    };

    let target = match applied {
        Err(e) => {
            warn!(csv = %owner.name, error = %e, "install failed");
            let target = Target::new(CsvPhase::Failed, CsvReason::InstallComponentFailed, e.to_string())
                .with_requirements(statuses);
            record(csv, &target, ctx, now).await?;
            return Ok(Action::requeue(cfg.requeue_failed));
        }
        Ok(applied) if applied > 0 => Target::new(
            CsvPhase::Installing,
            CsvReason::InstallWaiting,
            format!("applied {applied} change(s), waiting for install components"),
        ),
        Ok(_) => {
            let waiting = plan::waiting_components(&csv.spec, strategy, &owner.namespace, &state);
            if waiting.is_empty() {
                Target::new(
                    CsvPhase::Succeeded,
                    CsvReason::InstallSucceeded,
                    "install strategy completed with no errors",
                )
            } else {
                Target::new(
                    CsvPhase::Installing,
                    CsvReason::InstallWaiting,
                    format!("waiting for {}", waiting.join(", ")),
                )
            }
        }
    }
    .with_requirements(statuses);

    let recorded = record(csv, &target, ctx, now).await?;
    if target.phase != CsvPhase::Succeeded {
        return Ok(Action::requeue(cfg.requeue_installing));
    }

    if let Some(predecessor) = replacement::retire_predecessor(
        ctx.store.as_ref(),
        recorded.csv(),
        now,
        cfg.max_conflict_retries,
    )
    .await?
    {
        info!(csv = %owner.name, predecessor = %predecessor.name_any(), "predecessor is being replaced");
        publish(ctx, &predecessor, CsvReason::BeingReplaced, None).await;
    }
    Ok(Action::requeue(cfg.requeue_succeeded))
}

/// Write `target`; publish an Event when the phase changed
async fn record(
    csv: &ClusterServiceVersion,
    target: &Target,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Transition, Error> {
    let recorded = transition(ctx.store.as_ref(), csv, target, now, ctx.config.max_conflict_retries).await?;
    if recorded.changed_phase() {
        publish(ctx, recorded.csv(), target.reason, Some(target.message.clone())).await;
    }
    Ok(recorded)
}

fn event_for(reason: CsvReason) -> Option<(EventType, &'static str, &'static str)> {
    let event = match reason {
        CsvReason::RequirementsNotMet => (EventType::Warning, reasons::REQUIREMENTS_NOT_MET, actions::RECONCILE),
        CsvReason::AllRequirementsMet => (EventType::Normal, reasons::ALL_REQUIREMENTS_MET, actions::RECONCILE),
        CsvReason::InstallWaiting => (EventType::Normal, reasons::INSTALL_APPLIED, actions::INSTALL),
        CsvReason::InstallSucceeded => (EventType::Normal, reasons::INSTALL_SUCCEEDED, actions::INSTALL),
        CsvReason::InstallComponentFailed => {
            (EventType::Warning, reasons::INSTALL_COMPONENT_FAILED, actions::INSTALL)
        }
        CsvReason::InvalidStrategy => (EventType::Warning, reasons::INVALID_STRATEGY, actions::INSTALL),
        CsvReason::BeingReplaced => (EventType::Normal, reasons::BEING_REPLACED, actions::REPLACE),
        CsvReason::Replaced => (EventType::Normal, reasons::REPLACED, actions::DELETE),
        CsvReason::RequirementsUnknown | CsvReason::EvaluationError => return None,
    };
    Some(event)
}

async fn publish(ctx: &Context, csv: &ClusterServiceVersion, reason: CsvReason, note: Option<String>) {
    if let Some((type_, reason, action)) = event_for(reason) {
        ctx.events
            .publish(&csv.object_ref(&()), type_, reason, action, note)
            .await;
    }
}
