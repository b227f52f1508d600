//! Controller runner - wires the CSV reconciler into a kube-runtime Controller

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};

use lifecycle_common::crd::ClusterServiceVersion;
use lifecycle_csv::{error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client gives up on them.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// The CSV a changed CSV replaces, so the predecessor sees its successor
fn predecessor_of(csv: ClusterServiceVersion) -> Option<ObjectRef<ClusterServiceVersion>> {
    let replaces = csv.spec.replaces.as_deref()?;
    let namespace = csv.namespace()?;
    Some(ObjectRef::new(replaces).within(&namespace))
}

fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Build the ClusterServiceVersion controller future
///
/// Watches CSVs in the configured namespace (or all), the Deployments they
/// own, and maps every CSV to the one it replaces.
pub fn build_csv_controller(client: Client, ctx: Arc<Context>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let namespace = ctx.config.watch_namespace.clone();
    let csvs: Api<ClusterServiceVersion> = api(client.clone(), namespace.as_deref());
    let deployments: Api<Deployment> = api(client, namespace.as_deref());
    let watcher = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);

    match &namespace {
        Some(ns) => tracing::info!(namespace = %ns, "- ClusterServiceVersion controller"),
        None => tracing::info!("- ClusterServiceVersion controller (all namespaces)"),
    }

    Box::pin(
        Controller::new(csvs.clone(), watcher())
            .owns(deployments, watcher())
            .watches(csvs, watcher(), predecessor_of)
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("ClusterServiceVersion")),
    )
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
