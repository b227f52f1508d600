//! Test helpers for integration tests
//!
//! Provides utilities for managing the kind cluster, test namespaces, and an
//! in-process controller.

use std::process::Command;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Config};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use lifecycle_common::config::OperatorConfig;
use lifecycle_common::crd::{ClusterServiceVersion, ClusterServiceVersionSpec, NamedInstallStrategy};
use lifecycle_csv::Context;
use lifecycle_operator::{controller_runner, startup};

/// Name of the kind cluster used for integration tests
pub const TEST_CLUSTER_NAME: &str = "lifecycle-integration-test";

/// Upper bound for any single wait in these tests
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(180);

/// Global lock to ensure cluster is created only once
static CLUSTER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Track if CRD has been installed (async-safe)
static CRD_INSTALLED: OnceCell<Result<(), String>> = OnceCell::const_new();

/// Check if a kind cluster with the given name exists
pub fn kind_cluster_exists(name: &str) -> bool {
    Command::new("kind")
        .args(["get", "clusters"])
        .output()
        .map(|output| {
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .any(|line| line.trim() == name)
        })
        .unwrap_or(false)
}

/// Create a kind cluster for testing
pub fn create_kind_cluster(name: &str) -> Result<(), String> {
    if kind_cluster_exists(name) {
        println!("Kind cluster '{name}' already exists, reusing it");
        return Ok(());
    }

    println!("Creating kind cluster '{name}'...");
    let output = Command::new("kind")
        .args(["create", "cluster", "--name", name, "--wait", "60s"])
        .output()
        .map_err(|e| format!("failed to run kind: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "failed to create kind cluster: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(())
}

/// Create a Kubernetes client connected to the test cluster
pub async fn create_test_client() -> Result<Client, String> {
    let config = Config::from_kubeconfig(&kube::config::KubeConfigOptions {
        context: Some(format!("kind-{TEST_CLUSTER_NAME}")),
        ..Default::default()
    })
    .await
    .map_err(|e| format!("failed to load kubeconfig: {e}"))?;

    Client::try_from(config).map_err(|e| format!("failed to create client: {e}"))
}

/// Ensure the test cluster is ready and the CSV CRD is installed
///
/// Returns a fresh Client for each call.
pub async fn ensure_test_cluster() -> Result<Client, String> {
    CLUSTER_INIT
        .get_or_init(|| create_kind_cluster(TEST_CLUSTER_NAME))
        .clone()?;

    let client = create_test_client().await?;

    CRD_INSTALLED
        .get_or_init(|| async {
            let client = create_test_client().await?;
            startup::ensure_crd_installed(&client, "lifecycle-integration-test")
                .await
                .map_err(|e| format!("failed to install CRD: {e}"))
        })
        .await
        .clone()?;

    Ok(client)
}

/// Create a uniquely named namespace for one story
pub async fn create_namespace(client: &Client, prefix: &str) -> String {
    let name = format!("{prefix}-{}", std::process::id());
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            ..Default::default()
        },
        ..Default::default()
    };
    match namespaces.create(&PostParams::default(), &ns).await {
        Ok(_) => {}
        Err(kube::Error::Api(e)) if e.code == 409 => {}
        Err(e) => panic!("failed to create namespace {name}: {e}"),
    }
    name
}

pub async fn delete_namespace(client: &Client, name: &str) {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let _ = namespaces.delete(name, &DeleteParams::background()).await;
}

/// Run the CSV controller scoped to `namespace` until the handle is aborted
pub fn start_controller(client: Client, namespace: &str) -> JoinHandle<()> {
    let config = OperatorConfig {
        watch_namespace: Some(namespace.to_string()),
        requeue_pending: Duration::from_secs(2),
        requeue_succeeded: Duration::from_secs(10),
        requeue_failed: Duration::from_secs(5),
        ..Default::default()
    };
    let ctx = Arc::new(Context::builder(client.clone()).config(config).build());
    tokio::spawn(controller_runner::build_csv_controller(client, ctx))
}

/// A CSV running one nginx deployment
pub fn nginx_csv(namespace: &str, name: &str, deployment: &str, replaces: Option<&str>) -> ClusterServiceVersion {
    let strategy = serde_json::json!({
        "deployments": [{
            "name": deployment,
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": deployment } },
                "template": {
                    "metadata": { "labels": { "app": deployment } },
                    "spec": {
                        "containers": [{
                            "name": "nginx",
                            "image": "nginx:1.27",
                            "ports": [{ "containerPort": 80 }]
                        }]
                    }
                }
            }
        }]
    });
    let mut csv = ClusterServiceVersion::new(
        name,
        ClusterServiceVersionSpec {
            display_name: Some("nginx".to_string()),
            version: None,
            install: NamedInstallStrategy {
                strategy: "deployment".to_string(),
                spec: strategy,
            },
            custom_resource_definitions: Default::default(),
            api_service_definitions: Default::default(),
            replaces: replaces.map(str::to_string),
        },
    );
    csv.metadata.namespace = Some(namespace.to_string());
    csv
}
