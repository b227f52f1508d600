//! Shared Kubernetes utilities using kube-rs

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::trace;

use crate::crd::{ClusterServiceVersion, CsvPhase};
use crate::Error;

/// Condition status string for a satisfied condition
pub const STATUS_TRUE: &str = "True";
/// Condition status string for an unsatisfied condition
pub const STATUS_FALSE: &str = "False";

/// Types that carry standard Kubernetes condition fields
pub trait HasConditionFields {
    /// The condition type (e.g. "Available")
    fn type_field(&self) -> &str;
    /// The condition status ("True", "False", "Unknown")
    fn status_field(&self) -> &str;
}

impl HasConditionFields
    for k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIServiceCondition
{
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields
    for k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinitionCondition
{
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Status of the condition of the given type, if present
pub fn condition_status<'a, T>(conditions: Option<&'a [T]>, condition_type: &str) -> Option<&'a str>
where
    T: HasConditionFields,
{
    conditions?
        .iter()
        .find(|c| c.type_field() == condition_type)
        .map(|c| c.status_field())
}

/// Check if a condition of the given type has status "True"
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    condition_status(conditions, condition_type) == Some(STATUS_TRUE)
}

/// Poll until `check_fn` returns `Ok(true)` or `timeout` elapses.
///
/// Errors from `check_fn` are treated as "not yet" and polling continues.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = std::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        if start.elapsed() > timeout {
            return Err(Error::timeout(timeout_msg, timeout.as_secs()));
        }

        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("Polling condition not yet met, retrying..."),
            Err(e) => trace!("Polling check returned error (retrying): {}", e),
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from an optional kubeconfig path with custom timeouts
///
/// Without a path the config is inferred (in-cluster service account, then
/// `$KUBECONFIG`, then `~/.kube/config`).
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Wait until the named CRD reports `Established=True`
pub async fn wait_for_crd(client: &Client, crd_name: &str, timeout: Duration) -> Result<(), Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    poll_until(
        timeout,
        Duration::from_secs(1),
        format!("CRD {crd_name} to be established"),
        || {
            let crds = crds.clone();
            let crd_name = crd_name.to_string();
            async move {
                let crd = crds.get_opt(&crd_name).await?;
                Ok(crd
                    .and_then(|c| c.status)
                    .map(|s| has_condition(s.conditions.as_deref(), "Established"))
                    .unwrap_or(false))
            }
        },
    )
    .await
}

/// Wait until a ClusterServiceVersion reports the given phase
///
/// Returns the CSV as last observed.
pub async fn wait_for_csv_phase(
    client: &Client,
    namespace: &str,
    name: &str,
    phase: CsvPhase,
    timeout: Duration,
) -> Result<ClusterServiceVersion, Error> {
    let api: Api<ClusterServiceVersion> = Api::namespaced(client.clone(), namespace);
    poll_until(
        timeout,
        Duration::from_secs(1),
        format!("CSV {namespace}/{name} to reach {phase}"),
        || {
            let api = api.clone();
            let name = name.to_string();
            async move { Ok(api.get_opt(&name).await?.map(|csv| csv.phase()) == Some(phase)) }
        },
    )
    .await?;
    Ok(api.get(name).await?)
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 so persisted values (annotations) stay stable across
/// toolchain versions.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
