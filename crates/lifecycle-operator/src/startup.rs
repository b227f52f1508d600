//! CRD installation on startup
//!
//! The operator installs its own CRD with server-side apply so the schema
//! always matches the binary.

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use lifecycle_common::crd::ClusterServiceVersion;
use lifecycle_common::kube_utils::wait_for_crd;
use lifecycle_common::retry::{retry_with_backoff, RetryConfig};

/// Name of the ClusterServiceVersion CRD
pub const CSV_CRD_NAME: &str = "clusterserviceversions.operators.coreos.com";

/// How long to wait for the apiserver to establish the CRD
const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(60);

/// The CRD manifest as YAML
pub fn crd_yaml() -> anyhow::Result<String> {
    serde_yaml::to_string(&ClusterServiceVersion::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))
}

/// Apply the ClusterServiceVersion CRD and wait until it is established
pub async fn ensure_crd_installed(client: &Client, field_manager: &str) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(field_manager).force();
    let crd = ClusterServiceVersion::crd();

    tracing::info!(crd = CSV_CRD_NAME, "Installing CRD...");
    retry_with_backoff(&RetryConfig::with_max_attempts(10), "install CSV CRD", || {
        let crds = crds.clone();
        let params = params.clone();
        let crd = crd.clone();
        async move { crds.patch(CSV_CRD_NAME, &params, &Patch::Apply(&crd)).await }
    })
    .await
    .map_err(|e| anyhow::anyhow!("failed to install {CSV_CRD_NAME} CRD: {e}"))?;

    wait_for_crd(client, CSV_CRD_NAME, CRD_ESTABLISH_TIMEOUT).await?;
    tracing::info!(crd = CSV_CRD_NAME, "CRD installed/updated");
    Ok(())
}
