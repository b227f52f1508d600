//! Observe the cluster, then decide what to write
//!
//! A reconcile pass reads everything it needs into a [`ClusterState`] once,
//! evaluates requirements against it, and diffs the desired objects against
//! it. Planning is pure; the executor performs the writes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use lifecycle_common::crd::ClusterServiceVersionSpec;
use lifecycle_common::Error;

use crate::apiservice::{self, ApiServiceNames};
use crate::rbac::RbacSnapshot;
use crate::requirements::RequirementLookup;
use crate::resource::{in_sync, stamp, CsvOwner, ManagedResource, ResourceKey, ResourceKind};
use crate::store::ClusterStore;
use crate::strategy::DeploymentStrategy;

/// Everything one pass knows about the cluster
#[derive(Clone, Debug, Default)]
pub struct ClusterState {
    /// CRDs named by the CSV, by name
    pub crds: BTreeMap<String, CustomResourceDefinition>,
    /// Live copies of the objects the CSV reads or writes
    pub objects: BTreeMap<ResourceKey, ManagedResource>,
    pub rbac: RbacSnapshot,
}

impl ClusterState {
    /// Read the CRDs, objects at `keys`, and the RBAC graph for `namespace`
    pub async fn observe(
        store: &dyn ClusterStore,
        spec: &ClusterServiceVersionSpec,
        namespace: &str,
        keys: &[ResourceKey],
    ) -> Result<Self, Error> {
        let mut state = ClusterState {
            rbac: store.rbac_snapshot(namespace).await?,
            ..Default::default()
        };
        let crds = &spec.custom_resource_definitions;
        for desc in crds.owned.iter().chain(&crds.required) {
            if let Some(crd) = store.get_crd(&desc.name).await? {
                state.crds.insert(desc.name.clone(), crd);
            }
        }
        let objects = try_join_all(keys.iter().map(|key| store.get(key))).await?;
        for object in objects.into_iter().flatten() {
            state.insert(object);
        }
        Ok(state)
    }

    pub fn insert(&mut self, object: ManagedResource) {
        self.objects.insert(object.key(), object);
    }

    pub fn object(&self, key: &ResourceKey) -> Option<&ManagedResource> {
        self.objects.get(key)
    }

    fn deployment(&self, namespace: &str, name: &str) -> Option<&Deployment> {
        match self.object(&ResourceKey::namespaced(ResourceKind::Deployment, namespace, name)) {
            Some(ManagedResource::Deployment(d)) => Some(d),
            _ => None,
        }
    }
}

impl RequirementLookup for ClusterState {
    fn crd(&self, name: &str) -> Option<&CustomResourceDefinition> {
        self.crds.get(name)
    }

    fn api_service(&self, name: &str) -> Option<&APIService> {
        match self.object(&ResourceKey::cluster(ResourceKind::ApiService, name)) {
            Some(ManagedResource::ApiService(api)) => Some(api),
            _ => None,
        }
    }

    fn service_account_exists(&self, namespace: &str, name: &str) -> bool {
        self.objects.contains_key(&ResourceKey::namespaced(
            ResourceKind::ServiceAccount,
            namespace,
            name,
        ))
    }

    fn rbac(&self) -> &RbacSnapshot {
        &self.rbac
    }
}

/// Keys of every object a pass reads: what the strategy and owned APIs
/// materialize, plus the required APIService registrations.
pub fn observed_keys(
    spec: &ClusterServiceVersionSpec,
    strategy: &DeploymentStrategy,
    csv_name: &str,
    namespace: &str,
) -> Vec<ResourceKey> {
    let apis = &spec.api_service_definitions;
    let keys: BTreeSet<ResourceKey> = strategy
        .resource_keys(csv_name, namespace)
        .into_iter()
        .chain(
            apis.owned
                .iter()
                .flat_map(|desc| ApiServiceNames::new(desc).keys(namespace)),
        )
        .chain(
            apis.required
                .iter()
                .map(|desc| ResourceKey::cluster(ResourceKind::ApiService, desc.api_service_name())),
        )
        .collect();
    keys.into_iter().collect()
}

/// Every object the CSV should own, stamped for `owner`
pub fn desired_resources(
    owner: &CsvOwner,
    spec: &ClusterServiceVersionSpec,
    strategy: &DeploymentStrategy,
    state: &ClusterState,
    now: DateTime<Utc>,
) -> Result<Vec<ManagedResource>, Error> {
    let namespace = owner.namespace.as_str();
    let mut strategy = strategy.clone();
    let mut serving = Vec::new();
    for desc in &spec.api_service_definitions.owned {
        let names = ApiServiceNames::new(desc);
        let secret_key = ResourceKey::namespaced(ResourceKind::Secret, namespace, &names.secret);
        let existing = match state.object(&secret_key) {
            Some(ManagedResource::Secret(secret)) => Some(secret),
            _ => None,
        };
        serving.extend(apiservice::provision(desc, namespace, &mut strategy, existing, now)?);
    }

    strategy
        .desired_resources(&owner.name, namespace)
        .into_iter()
        .chain(serving)
        .map(|r| stamp(r, owner))
        .collect()
}

/// One object to create (no live copy) or update
#[derive(Clone, Debug, PartialEq)]
pub struct Write {
    pub desired: ManagedResource,
    pub observed: Option<ManagedResource>,
}

impl Write {
    pub fn key(&self) -> ResourceKey {
        self.desired.key()
    }
}

/// Writes needed to bring `state` to `desired`; empty when everything is in sync
pub fn plan_writes(desired: Vec<ManagedResource>, state: &ClusterState) -> Vec<Write> {
    desired
        .into_iter()
        .filter_map(|desired| {
            let observed = state.object(&desired.key()).cloned();
            match &observed {
                Some(live) if in_sync(&desired, live) => None,
                _ => Some(Write { desired, observed }),
            }
        })
        .collect()
}

/// True once the rollout of the deployment's current generation is available
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let wanted = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return wanted == 0;
    };
    let generation_seen = match (deployment.metadata.generation, status.observed_generation) {
        (Some(generation), Some(observed)) => observed >= generation,
        _ => true,
    };
    generation_seen && status.available_replicas.unwrap_or(0) >= wanted
}

/// Components that are installed but not yet ready, as `<kind> <name>`
pub fn waiting_components(
    spec: &ClusterServiceVersionSpec,
    strategy: &DeploymentStrategy,
    namespace: &str,
    state: &ClusterState,
) -> Vec<String> {
    let deployments = strategy.deployments.iter().filter_map(|dep| {
        let ready = state
            .deployment(namespace, &dep.name)
            .is_some_and(deployment_ready);
        (!ready).then(|| format!("deployment {}", dep.name))
    });
    let apis = spec.api_service_definitions.owned.iter().filter_map(|desc| {
        let name = desc.api_service_name();
        let ready = state.api_service(&name).is_some_and(apiservice::is_available);
        (!ready).then(|| format!("apiservice {name}"))
    });
    deployments.chain(apis).collect()
}
