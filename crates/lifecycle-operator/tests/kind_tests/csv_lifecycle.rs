//! Integration tests for the CSV lifecycle
//!
//! Each story creates its own namespace, runs a controller scoped to it, and
//! removes the namespace afterwards.

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, PostParams};
use kube::ResourceExt;

use lifecycle_common::crd::{ClusterServiceVersion, CrdDescription, CsvPhase, CsvReason};
use lifecycle_common::kube_utils::{poll_until, wait_for_csv_phase};

use super::helpers::{
    create_namespace, delete_namespace, ensure_test_cluster, nginx_csv, start_controller,
    WAIT_TIMEOUT,
};

/// Story: an administrator creates a CSV with one deployment. The operator
/// installs it, and the deployment is owned by the CSV so deleting the CSV
/// would collect it.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_csv_installs_its_deployment() {
    let client = ensure_test_cluster().await.unwrap();
    let ns = create_namespace(&client, "csv-install").await;
    let controller = start_controller(client.clone(), &ns);

    let csvs: Api<ClusterServiceVersion> = Api::namespaced(client.clone(), &ns);
    csvs.create(&PostParams::default(), &nginx_csv(&ns, "nginx.v1", "nginx", None))
        .await
        .unwrap();

    let csv = wait_for_csv_phase(&client, &ns, "nginx.v1", CsvPhase::Succeeded, WAIT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(csv.status.unwrap().reason, Some(CsvReason::InstallSucceeded));

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &ns);
    let deployment = deployments.get("nginx").await.unwrap();
    assert!(deployment
        .owner_references()
        .iter()
        .any(|r| r.kind == "ClusterServiceVersion" && r.name == "nginx.v1"));

    controller.abort();
    delete_namespace(&client, &ns).await;
}

/// Story: a CSV requires a CRD that is not installed. It stays Pending and
/// no deployment is created.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_missing_crd_keeps_csv_pending() {
    let client = ensure_test_cluster().await.unwrap();
    let ns = create_namespace(&client, "csv-pending").await;
    let controller = start_controller(client.clone(), &ns);

    let mut csv = nginx_csv(&ns, "gadget.v1", "gadget", None);
    csv.spec.custom_resource_definitions.required = vec![CrdDescription {
        name: "gadgets.example.com".to_string(),
        version: "v1".to_string(),
        kind: "Gadget".to_string(),
        ..Default::default()
    }];
    let csvs: Api<ClusterServiceVersion> = Api::namespaced(client.clone(), &ns);
    csvs.create(&PostParams::default(), &csv).await.unwrap();

    let csv = wait_for_csv_phase(&client, &ns, "gadget.v1", CsvPhase::Pending, WAIT_TIMEOUT)
        .await
        .unwrap();
    let status = csv.status.unwrap();
    assert_eq!(status.reason, Some(CsvReason::RequirementsNotMet));
    assert!(status.message.unwrap_or_default().contains("gadgets.example.com"));

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &ns);
    assert!(deployments.get_opt("gadget").await.unwrap().is_none());

    controller.abort();
    delete_namespace(&client, &ns).await;
}

/// Story: v2 replaces v1 with a renamed deployment. v2 succeeds, then v1 and
/// its deployment disappear.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_upgrade_retires_predecessor() {
    let client = ensure_test_cluster().await.unwrap();
    let ns = create_namespace(&client, "csv-upgrade").await;
    let controller = start_controller(client.clone(), &ns);

    let csvs: Api<ClusterServiceVersion> = Api::namespaced(client.clone(), &ns);
    csvs.create(&PostParams::default(), &nginx_csv(&ns, "web.v1", "web-a", None))
        .await
        .unwrap();
    wait_for_csv_phase(&client, &ns, "web.v1", CsvPhase::Succeeded, WAIT_TIMEOUT)
        .await
        .unwrap();

    csvs.create(
        &PostParams::default(),
        &nginx_csv(&ns, "web.v2", "web-b", Some("web.v1")),
    )
    .await
    .unwrap();
    wait_for_csv_phase(&client, &ns, "web.v2", CsvPhase::Succeeded, WAIT_TIMEOUT)
        .await
        .unwrap();

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &ns);
    poll_until(
        WAIT_TIMEOUT,
        std::time::Duration::from_secs(2),
        "predecessor and its deployment to be removed",
        || {
            let csvs = csvs.clone();
            let deployments = deployments.clone();
            async move {
                let csv_gone = csvs.get_opt("web.v1").await?.is_none();
                let deployment_gone = deployments.get_opt("web-a").await?.is_none();
                Ok(csv_gone && deployment_gone)
            }
        },
    )
    .await
    .unwrap();
    assert!(deployments.get_opt("web-b").await.unwrap().is_some());

    controller.abort();
    delete_namespace(&client, &ns).await;
}
