//! Test support: fixtures and an in-memory [`ClusterStore`]
//!
//! [`FakeStore`] behaves like the API server where the controller depends on
//! it: resourceVersion preconditions, AlreadyExists on create, finalizers,
//! and owner-reference garbage collection. Deployments report available
//! replicas as soon as they are written unless told otherwise, and owned
//! APIServices report Available.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec, ServiceAccount};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionCondition, CustomResourceDefinitionNames,
    CustomResourceDefinitionSpec, CustomResourceDefinitionStatus, CustomResourceDefinitionVersion,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, Time};
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::{
    APIService, APIServiceCondition, APIServiceSpec, APIServiceStatus,
};
use kube::ResourceExt;
use serde_json::json;

use lifecycle_common::crd::{
    ApiServiceDescription, ClusterServiceVersion, ClusterServiceVersionSpec,
    ClusterServiceVersionStatus, CsvPhase, CustomResourceDefinitions, NamedInstallStrategy,
    DEPLOYMENT_STRATEGY,
};
use lifecycle_common::kube_utils::STATUS_TRUE;
use lifecycle_common::Error;

use crate::controller::{reconcile_at, Context};
use crate::rbac::RbacSnapshot;
use crate::resource::{CsvOwner, ManagedResource, ResourceKey, ResourceKind};
use crate::store::ClusterStore;
use crate::strategy::{DeploymentStrategy, InstallStrategy, RBAC_API_GROUP};

/// Namespace every fixture lives in
pub const NAMESPACE: &str = "ns";

pub fn nginx_deployment_spec(name: &str) -> DeploymentSpec {
    let labels = BTreeMap::from([("app".to_string(), name.to_string())]);
    DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: format!("{name}-nginx"),
                    image: Some("nginx:1.27".to_string()),
                    ports: Some(vec![ContainerPort {
                        container_port: 80,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        ..Default::default()
    }
}

fn permissions(perms: &[(&str, PolicyRule)]) -> serde_json::Value {
    perms
        .iter()
        .map(|(sa, rule)| json!({ "serviceAccountName": sa, "rules": [rule] }))
        .collect()
}

/// Payload of a deployment strategy with one nginx deployment
pub fn strategy_json(
    deployment: &str,
    perms: &[(&str, PolicyRule)],
    cluster_perms: &[(&str, PolicyRule)],
) -> serde_json::Value {
    json!({
        "deployments": [{ "name": deployment, "spec": nginx_deployment_spec(deployment) }],
        "permissions": permissions(perms),
        "clusterPermissions": permissions(cluster_perms),
    })
}

pub fn csv_spec(
    deployment: &str,
    perms: &[(&str, PolicyRule)],
    cluster_perms: &[(&str, PolicyRule)],
) -> ClusterServiceVersionSpec {
    ClusterServiceVersionSpec {
        display_name: None,
        version: None,
        install: NamedInstallStrategy {
            strategy: DEPLOYMENT_STRATEGY.to_string(),
            spec: strategy_json(deployment, perms, cluster_perms),
        },
        custom_resource_definitions: CustomResourceDefinitions::default(),
        api_service_definitions: Default::default(),
        replaces: None,
    }
}

pub fn decoded_strategy(spec: &ClusterServiceVersionSpec) -> DeploymentStrategy {
    InstallStrategy::decode(&spec.install)
        .unwrap()
        .deployment()
        .clone()
}

pub fn pod_rule(verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(vec!["pods".to_string()]),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// The package-server API, served by `deployment` on 5443
pub fn packages_api(deployment: &str) -> ApiServiceDescription {
    ApiServiceDescription {
        group: "packages.apps.redhat.com".to_string(),
        version: "v1alpha1".to_string(),
        kind: "PackageManifest".to_string(),
        deployment_name: Some(deployment.to_string()),
        container_port: Some(5443),
        ..Default::default()
    }
}

pub fn crd(name: &str, version: &str, established: bool) -> CustomResourceDefinition {
    let (plural, group) = name.split_once('.').unwrap_or((name, ""));
    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: group.to_string(),
            names: CustomResourceDefinitionNames {
                kind: "Widget".to_string(),
                plural: plural.to_string(),
                ..Default::default()
            },
            scope: "Namespaced".to_string(),
            versions: vec![CustomResourceDefinitionVersion {
                name: version.to_string(),
                served: true,
                storage: true,
                ..Default::default()
            }],
            ..Default::default()
        },
        status: Some(CustomResourceDefinitionStatus {
            conditions: Some(vec![CustomResourceDefinitionCondition {
                type_: "Established".to_string(),
                status: if established { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// An APIService registration with an optional Available condition
pub fn api_service(name: &str, available: Option<&str>) -> ManagedResource {
    let (version, group) = name.split_once('.').unwrap_or((name, ""));
    ManagedResource::ApiService(APIService {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(APIServiceSpec {
            group: Some(group.to_string()),
            version: Some(version.to_string()),
            group_priority_minimum: 2000,
            version_priority: 15,
            ..Default::default()
        }),
        status: available.map(|status| APIServiceStatus {
            conditions: Some(vec![APIServiceCondition {
                type_: "Available".to_string(),
                status: status.to_string(),
                ..Default::default()
            }]),
        }),
    })
}

pub fn service_account(namespace: &str, name: &str) -> ManagedResource {
    ManagedResource::ServiceAccount(ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    })
}

pub fn available_deployment(namespace: &str, name: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: Some(nginx_deployment_spec(name)),
        status: Some(DeploymentStatus {
            available_replicas: Some(1),
            observed_generation: Some(1),
            ..Default::default()
        }),
    }
}

pub fn owner(name: &str, uid: &str) -> CsvOwner {
    CsvOwner {
        name: name.to_string(),
        namespace: NAMESPACE.to_string(),
        uid: uid.to_string(),
    }
}

/// A CSV in [`NAMESPACE`] installing one nginx deployment
pub fn csv(name: &str, deployment: &str, replaces: Option<&str>) -> ClusterServiceVersion {
    let mut spec = csv_spec(deployment, &[], &[]);
    spec.replaces = replaces.map(str::to_string);
    csv_from_spec(name, spec)
}

pub fn csv_from_spec(name: &str, spec: ClusterServiceVersionSpec) -> ClusterServiceVersion {
    let mut csv = ClusterServiceVersion::new(name, spec);
    csv.metadata.namespace = Some(NAMESPACE.to_string());
    csv.metadata.uid = Some(format!("uid-{name}"));
    csv.metadata.generation = Some(1);
    csv.metadata.resource_version = Some("1".to_string());
    csv
}

pub fn with_phase(mut csv: ClusterServiceVersion, phase: CsvPhase) -> ClusterServiceVersion {
    csv.status = Some(ClusterServiceVersionStatus {
        phase,
        ..Default::default()
    });
    csv
}

pub fn csv_with_status(name: &str, phase: CsvPhase, resource_version: &str) -> ClusterServiceVersion {
    let mut csv = with_phase(csv(name, "app", None), phase);
    csv.metadata.resource_version = Some(resource_version.to_string());
    csv
}

pub fn conflict_error() -> Error {
    Error::conflict("ClusterServiceVersion", "the object has been modified")
}

/// Role + RoleBinding in [`NAMESPACE`] granting `rules` to a service account
pub fn namespaced_grant(name: &str, service_account: &str, rules: Vec<PolicyRule>) -> (Role, RoleBinding) {
    let meta = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        ..Default::default()
    };
    let role = Role {
        metadata: meta.clone(),
        rules: Some(rules),
    };
    let binding = RoleBinding {
        metadata: meta,
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name: name.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.to_string(),
            namespace: Some(NAMESPACE.to_string()),
            api_group: None,
        }]),
    };
    (role, binding)
}

#[derive(Default)]
struct Inner {
    csvs: BTreeMap<(String, String), ClusterServiceVersion>,
    crds: BTreeMap<String, CustomResourceDefinition>,
    objects: BTreeMap<ResourceKey, ManagedResource>,
    /// Grants made outside the controller
    rbac: RbacSnapshot,
    version: u64,
    writes: usize,
    hold_deployments: bool,
    rejected: Option<ResourceKind>,
    stall_listing: bool,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn live_uids(&self) -> BTreeSet<String> {
        self.csvs.values().filter_map(|c| c.uid()).collect()
    }

    /// Remove objects whose every ownerReference points at a deleted owner
    fn collect_garbage(&mut self) {
        let live = self.live_uids();
        self.objects.retain(|_, object| {
            let refs = object.owner_references();
            refs.is_empty() || refs.iter().any(|r| live.contains(&r.uid))
        });
    }

    fn settle_workload(&self, object: &mut ManagedResource) {
        match object {
            ManagedResource::Deployment(dep) if !self.hold_deployments => {
                let replicas = dep.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                dep.status = Some(DeploymentStatus {
                    available_replicas: Some(replicas),
                    observed_generation: dep.metadata.generation,
                    ..Default::default()
                });
            }
            ManagedResource::ApiService(api) => {
                api.status = Some(APIServiceStatus {
                    conditions: Some(vec![APIServiceCondition {
                        type_: "Available".to_string(),
                        status: STATUS_TRUE.to_string(),
                        ..Default::default()
                    }]),
                });
            }
            _ => {}
        }
    }
}

/// In-memory API server for multi-pass controller tests
#[derive(Default)]
pub struct FakeStore {
    inner: Mutex<Inner>,
}

fn csv_key(csv: &ClusterServiceVersion) -> (String, String) {
    (csv.namespace().unwrap_or_default(), csv.name_any())
}

/// The apiserver refuses label values longer than 63 characters
fn validate_labels(resource: &ManagedResource) -> Result<(), Error> {
    let labels = resource.meta().labels.clone().unwrap_or_default();
    match labels.iter().find(|(_, v)| v.len() > 63) {
        Some((k, v)) => Err(Error::validation(format!(
            "{}: label {k}={v} must be no more than 63 characters",
            resource.key()
        ))),
        None => Ok(()),
    }
}

fn labels_match(meta: &ObjectMeta, selector: &str) -> bool {
    let labels = meta.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter_map(|term| term.split_once('='))
        .all(|(k, v)| labels.get(k).map(String::as_str) == Some(v))
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Submit a CSV as a user would: fresh uid, generation 1
    pub fn add_csv(&self, mut csv: ClusterServiceVersion) {
        let mut inner = self.lock();
        csv.metadata.uid = Some(format!("uid-{}", csv.name_any()));
        csv.metadata.generation = Some(1);
        csv.metadata.resource_version = Some(inner.next_version());
        inner.csvs.insert(csv_key(&csv), csv);
    }

    /// Edit a CSV's spec as a user would, bumping its generation
    pub fn edit_csv(&self, name: &str, edit: impl FnOnce(&mut ClusterServiceVersionSpec)) {
        let mut inner = self.lock();
        let version = inner.next_version();
        let csv = inner
            .csvs
            .get_mut(&(NAMESPACE.to_string(), name.to_string()))
            .unwrap();
        edit(&mut csv.spec);
        csv.metadata.generation = csv.metadata.generation.map(|g| g + 1);
        csv.metadata.resource_version = Some(version);
    }

    pub fn add_crd(&self, crd: CustomResourceDefinition) {
        self.lock().crds.insert(crd.name_any(), crd);
    }

    /// Delete an object behind the controller's back
    pub fn remove_object(&self, key: &ResourceKey) -> Option<ManagedResource> {
        self.lock().objects.remove(key)
    }

    pub fn grant(&self, role: Role, binding: RoleBinding) {
        let mut inner = self.lock();
        inner.rbac.roles.push(role);
        inner.rbac.role_bindings.push(binding);
    }

    pub fn grant_cluster(&self, role: ClusterRole, binding: ClusterRoleBinding) {
        let mut inner = self.lock();
        inner.rbac.cluster_roles.push(role);
        inner.rbac.cluster_role_bindings.push(binding);
    }

    /// While held, written deployments report no available replicas;
    /// releasing makes every deployment available.
    pub fn hold_deployments(&self, hold: bool) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.hold_deployments = hold;
        if !hold {
            let mut objects = std::mem::take(&mut inner.objects);
            for object in objects.values_mut() {
                inner.settle_workload(object);
            }
            inner.objects = objects;
        }
    }

    /// Make every write of `kind` fail as an admission webhook would
    pub fn reject(&self, kind: Option<ResourceKind>) {
        self.lock().rejected = kind;
    }

    /// While set, listing CSVs never completes, like an apiserver that
    /// stopped answering
    pub fn stall_listing(&self, stall: bool) {
        self.lock().stall_listing = stall;
    }

    pub fn remove_crd(&self, name: &str) {
        self.lock().crds.remove(name);
    }

    pub fn csv(&self, name: &str) -> Option<ClusterServiceVersion> {
        self.lock()
            .csvs
            .get(&(NAMESPACE.to_string(), name.to_string()))
            .cloned()
    }

    pub fn phase(&self, name: &str) -> Option<CsvPhase> {
        self.csv(name).map(|c| c.phase())
    }

    pub fn object(&self, key: &ResourceKey) -> Option<ManagedResource> {
        self.lock().objects.get(key).cloned()
    }

    /// Names of the live deployments in [`NAMESPACE`]
    pub fn deployments(&self) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|k| k.kind == ResourceKind::Deployment)
            .map(|k| k.name.clone())
            .collect()
    }

    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        match self.object(&ResourceKey::namespaced(ResourceKind::Deployment, NAMESPACE, name)) {
            Some(ManagedResource::Deployment(d)) => Some(d),
            _ => None,
        }
    }

    /// Every write accepted so far, objects and CSVs alike
    pub fn writes(&self) -> usize {
        self.lock().writes
    }
}

#[async_trait]
impl ClusterStore for FakeStore {
    async fn get_csv(&self, namespace: &str, name: &str) -> Result<Option<ClusterServiceVersion>, Error> {
        Ok(self
            .lock()
            .csvs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_csvs(&self, namespace: &str) -> Result<Vec<ClusterServiceVersion>, Error> {
        let stalled = self.lock().stall_listing;
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(self
            .lock()
            .csvs
            .values()
            .filter(|c| c.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn update_csv_status(&self, csv: &ClusterServiceVersion) -> Result<ClusterServiceVersion, Error> {
        let mut inner = self.lock();
        let version = inner.next_version();
        let key = csv_key(csv);
        let stored = inner
            .csvs
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(format!("ClusterServiceVersion {}", key.1)))?;
        if stored.metadata.resource_version != csv.metadata.resource_version {
            return Err(Error::conflict(key.1, "the object has been modified"));
        }
        stored.status = csv.status.clone();
        stored.metadata.resource_version = Some(version);
        let written = stored.clone();
        inner.writes += 1;
        Ok(written)
    }

    async fn set_csv_finalizers(
        &self,
        csv: &ClusterServiceVersion,
        finalizers: Vec<String>,
    ) -> Result<ClusterServiceVersion, Error> {
        let mut inner = self.lock();
        let version = inner.next_version();
        let key = csv_key(csv);
        let stored = inner
            .csvs
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(format!("ClusterServiceVersion {}", key.1)))?;
        if stored.metadata.resource_version != csv.metadata.resource_version {
            return Err(Error::conflict(key.1, "the object has been modified"));
        }
        stored.metadata.finalizers = (!finalizers.is_empty()).then_some(finalizers);
        stored.metadata.resource_version = Some(version);
        let written = stored.clone();
        inner.writes += 1;
        if written.is_deleting() && written.finalizers().is_empty() {
            inner.csvs.remove(&key);
            inner.collect_garbage();
        }
        Ok(written)
    }

    async fn delete_csv(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let version = inner.next_version();
        let key = (namespace.to_string(), name.to_string());
        let Some(stored) = inner.csvs.get_mut(&key) else {
            return Ok(());
        };
        if stored.finalizers().is_empty() {
            inner.csvs.remove(&key);
            inner.collect_garbage();
        } else {
            stored.metadata.deletion_timestamp = Some(Time(Utc::now()));
            stored.metadata.resource_version = Some(version);
        }
        inner.writes += 1;
        Ok(())
    }

    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>, Error> {
        Ok(self.lock().crds.get(name).cloned())
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedResource>, Error> {
        Ok(self.lock().objects.get(key).cloned())
    }

    async fn create(&self, resource: &ManagedResource) -> Result<ManagedResource, Error> {
        let mut inner = self.lock();
        let key = resource.key();
        if inner.rejected == Some(key.kind) {
            return Err(Error::internal("admission webhook denied the request"));
        }
        validate_labels(resource)?;
        if inner.objects.contains_key(&key) {
            return Err(Error::already_exists(key.to_string()));
        }
        let mut created = resource.clone();
        let version = inner.next_version();
        let meta = created.meta_mut();
        meta.resource_version = Some(version);
        meta.uid = Some(format!("uid-{key}"));
        meta.generation = Some(1);
        inner.settle_workload(&mut created);
        inner.objects.insert(key, created.clone());
        inner.writes += 1;
        Ok(created)
    }

    async fn replace(&self, resource: &ManagedResource) -> Result<ManagedResource, Error> {
        let mut inner = self.lock();
        let key = resource.key();
        if inner.rejected == Some(key.kind) {
            return Err(Error::internal("admission webhook denied the request"));
        }
        validate_labels(resource)?;
        let Some(stored) = inner.objects.get(&key) else {
            return Err(Error::not_found(key.to_string()));
        };
        if stored.meta().resource_version != resource.meta().resource_version {
            return Err(Error::conflict(key.to_string(), "the object has been modified"));
        }
        let generation = stored.meta().generation.unwrap_or(1) + 1;
        let uid = stored.meta().uid.clone();
        let mut replaced = resource.clone();
        let version = inner.next_version();
        let meta = replaced.meta_mut();
        meta.resource_version = Some(version);
        meta.generation = Some(generation);
        meta.uid = uid;
        inner.settle_workload(&mut replaced);
        inner.objects.insert(key, replaced.clone());
        inner.writes += 1;
        Ok(replaced)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.objects.remove(key).is_some() {
            inner.writes += 1;
        }
        Ok(())
    }

    async fn list_labeled(&self, kind: ResourceKind, selector: &str) -> Result<Vec<ManagedResource>, Error> {
        Ok(self
            .lock()
            .objects
            .values()
            .filter(|o| o.kind() == kind && labels_match(o.meta(), selector))
            .cloned()
            .collect())
    }

    async fn rbac_snapshot(&self, namespace: &str) -> Result<RbacSnapshot, Error> {
        let inner = self.lock();
        let mut snapshot = inner.rbac.clone();
        for object in inner.objects.values() {
            match object {
                ManagedResource::Role(r) if r.namespace().as_deref() == Some(namespace) => {
                    snapshot.roles.push(r.clone())
                }
                ManagedResource::RoleBinding(b) if b.namespace().as_deref() == Some(namespace) => {
                    snapshot.role_bindings.push(b.clone())
                }
                ManagedResource::ClusterRole(r) => snapshot.cluster_roles.push(r.clone()),
                ManagedResource::ClusterRoleBinding(b) => snapshot.cluster_role_bindings.push(b.clone()),
                _ => {}
            }
        }
        Ok(snapshot)
    }
}

/// Run `passes` reconcile rounds over every CSV in [`NAMESPACE`], in name order
pub async fn settle(store: &FakeStore, ctx: &Context, passes: usize) -> Result<(), Error> {
    for _ in 0..passes {
        for csv in store.list_csvs(NAMESPACE).await? {
            // a CSV deleted earlier in this round is skipped
            let Some(fresh) = store.get_csv(NAMESPACE, &csv.name_any()).await? else {
                continue;
            };
            reconcile_at(&fresh, ctx, Utc::now()).await?;
        }
    }
    Ok(())
}
