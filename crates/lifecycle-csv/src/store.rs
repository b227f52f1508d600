//! Cluster access for the reconciler
//!
//! [`ClusterStore`] is the only way the reconciler reads or writes the
//! cluster. Production code uses [`KubeStore`]; tests substitute a fake or a
//! mock.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use lifecycle_common::crd::ClusterServiceVersion;
use lifecycle_common::Error;

use crate::rbac::RbacSnapshot;
use crate::resource::{ManagedResource, ResourceKey, ResourceKind};

/// Read and write access to everything the reconciler touches
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch a CSV, `None` if it does not exist
    async fn get_csv(&self, namespace: &str, name: &str)
        -> Result<Option<ClusterServiceVersion>, Error>;

    /// Every CSV in a namespace
    async fn list_csvs(&self, namespace: &str) -> Result<Vec<ClusterServiceVersion>, Error>;

    /// Write `csv.status`, conditional on `csv.metadata.resourceVersion`
    async fn update_csv_status(
        &self,
        csv: &ClusterServiceVersion,
    ) -> Result<ClusterServiceVersion, Error>;

    /// Replace the CSV's finalizer list, conditional on its resourceVersion
    async fn set_csv_finalizers(
        &self,
        csv: &ClusterServiceVersion,
        finalizers: Vec<String>,
    ) -> Result<ClusterServiceVersion, Error>;

    /// Delete a CSV; absent is success
    async fn delete_csv(&self, namespace: &str, name: &str) -> Result<(), Error>;

    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>, Error>;

    /// Fetch the live copy of a managed object
    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedResource>, Error>;

    /// Create an object; fails with AlreadyExists if the name is taken
    async fn create(&self, resource: &ManagedResource) -> Result<ManagedResource, Error>;

    /// Replace an object, conditional on the resourceVersion it carries
    async fn replace(&self, resource: &ManagedResource) -> Result<ManagedResource, Error>;

    /// Delete an object; absent is success
    async fn delete(&self, key: &ResourceKey) -> Result<(), Error>;

    /// Objects of `kind` in any namespace matching a label selector
    async fn list_labeled(
        &self,
        kind: ResourceKind,
        selector: &str,
    ) -> Result<Vec<ManagedResource>, Error>;

    /// Roles and bindings in `namespace` plus every cluster role and binding
    async fn rbac_snapshot(&self, namespace: &str) -> Result<RbacSnapshot, Error>;
}

/// [`ClusterStore`] backed by the API server
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn cluster<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = ()>,
    {
        Api::all(self.client.clone())
    }
}

async fn create_with<K>(api: Api<K>, pp: &PostParams, obj: &K) -> Result<K, Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    Ok(api.create(pp, obj).await?)
}

async fn replace_with<K>(api: Api<K>, pp: &PostParams, obj: &K) -> Result<K, Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    Ok(api.replace(&obj.name_any(), pp, obj).await?)
}

async fn delete_with<K>(api: Api<K>, name: &str) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!(name, "object already deleted");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn list_with<K>(api: Api<K>, selector: &str) -> Result<Vec<K>, Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    Ok(api.list(&ListParams::default().labels(selector)).await?.items)
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_csv(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterServiceVersion>, Error> {
        Ok(self.namespaced::<ClusterServiceVersion>(namespace).get_opt(name).await?)
    }

    async fn list_csvs(&self, namespace: &str) -> Result<Vec<ClusterServiceVersion>, Error> {
        let api = self.namespaced::<ClusterServiceVersion>(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update_csv_status(
        &self,
        csv: &ClusterServiceVersion,
    ) -> Result<ClusterServiceVersion, Error> {
        let namespace = csv.namespace().unwrap_or_default();
        let api = self.namespaced::<ClusterServiceVersion>(&namespace);
        // a resourceVersion in a merge patch makes the write conditional
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": csv.resource_version() },
            "status": csv.status,
        });
        Ok(api
            .patch_status(&csv.name_any(), &self.patch_params(), &Patch::Merge(&patch))
            .await?)
    }

    async fn set_csv_finalizers(
        &self,
        csv: &ClusterServiceVersion,
        finalizers: Vec<String>,
    ) -> Result<ClusterServiceVersion, Error> {
        let namespace = csv.namespace().unwrap_or_default();
        let api = self.namespaced::<ClusterServiceVersion>(&namespace);
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": csv.resource_version(),
                "finalizers": finalizers,
            }
        });
        Ok(api
            .patch(&csv.name_any(), &self.patch_params(), &Patch::Merge(&patch))
            .await?)
    }

    async fn delete_csv(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete_with(self.namespaced::<ClusterServiceVersion>(namespace), name).await
    }

    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>, Error> {
        Ok(self.cluster::<CustomResourceDefinition>().get_opt(name).await?)
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedResource>, Error> {
        let ns = key.namespace.as_deref().unwrap_or_default();
        let name = key.name.as_str();
        let found = match key.kind {
            ResourceKind::ServiceAccount => self
                .namespaced::<ServiceAccount>(ns)
                .get_opt(name)
                .await?
                .map(ManagedResource::ServiceAccount),
            ResourceKind::Role => self
                .namespaced::<Role>(ns)
                .get_opt(name)
                .await?
                .map(ManagedResource::Role),
            ResourceKind::RoleBinding => self
                .namespaced::<RoleBinding>(ns)
                .get_opt(name)
                .await?
                .map(ManagedResource::RoleBinding),
            ResourceKind::ClusterRole => self
                .cluster::<ClusterRole>()
                .get_opt(name)
                .await?
                .map(ManagedResource::ClusterRole),
            ResourceKind::ClusterRoleBinding => self
                .cluster::<ClusterRoleBinding>()
                .get_opt(name)
                .await?
                .map(ManagedResource::ClusterRoleBinding),
            ResourceKind::Secret => self
                .namespaced::<Secret>(ns)
                .get_opt(name)
                .await?
                .map(ManagedResource::Secret),
            ResourceKind::Service => self
                .namespaced::<Service>(ns)
                .get_opt(name)
                .await?
                .map(ManagedResource::Service),
            ResourceKind::Deployment => self
                .namespaced::<Deployment>(ns)
                .get_opt(name)
                .await?
                .map(ManagedResource::Deployment),
            ResourceKind::ApiService => self
                .cluster::<APIService>()
                .get_opt(name)
                .await?
                .map(ManagedResource::ApiService),
        };
        Ok(found)
    }

    async fn create(&self, resource: &ManagedResource) -> Result<ManagedResource, Error> {
        let pp = self.post_params();
        let ns = resource.meta().namespace.clone().unwrap_or_default();
        let created = match resource {
            ManagedResource::ServiceAccount(r) => {
                ManagedResource::ServiceAccount(create_with(self.namespaced(&ns), &pp, r).await?)
            }
            ManagedResource::Role(r) => {
                ManagedResource::Role(create_with(self.namespaced(&ns), &pp, r).await?)
            }
            ManagedResource::RoleBinding(r) => {
                ManagedResource::RoleBinding(create_with(self.namespaced(&ns), &pp, r).await?)
            }
            ManagedResource::ClusterRole(r) => {
                ManagedResource::ClusterRole(create_with(self.cluster(), &pp, r).await?)
            }
            ManagedResource::ClusterRoleBinding(r) => {
                ManagedResource::ClusterRoleBinding(create_with(self.cluster(), &pp, r).await?)
            }
            ManagedResource::Secret(r) => {
                ManagedResource::Secret(create_with(self.namespaced(&ns), &pp, r).await?)
            }
            ManagedResource::Service(r) => {
                ManagedResource::Service(create_with(self.namespaced(&ns), &pp, r).await?)
            }
            ManagedResource::Deployment(r) => {
                ManagedResource::Deployment(create_with(self.namespaced(&ns), &pp, r).await?)
            }
            ManagedResource::ApiService(r) => {
                ManagedResource::ApiService(create_with(self.cluster(), &pp, r).await?)
            }
        };
        Ok(created)
    }

    async fn replace(&self, resource: &ManagedResource) -> Result<ManagedResource, Error> {
        let pp = self.post_params();
        let ns = resource.meta().namespace.clone().unwrap_or_default();
        let replaced = match resource {
            ManagedResource::ServiceAccount(r) => {
                ManagedResource::ServiceAccount(replace_with(self.namespaced(&ns), &pp, r).await?)
            }
            ManagedResource::Role(r) => {
                ManagedResource::Role(replace_with(self.namespaced(&ns), &pp, r).await?)
            }
            ManagedResource::RoleBinding(r) => {
                ManagedResource::RoleBinding(replace_with(self.namespaced(&ns), &pp, r).await?)
            }
            ManagedResource::ClusterRole(r) => {
                ManagedResource::ClusterRole(replace_with(self.cluster(), &pp, r).await?)
            }
            ManagedResource::ClusterRoleBinding(r) => {
                ManagedResource::ClusterRoleBinding(replace_with(self.cluster(), &pp, r).await?)
            }
            ManagedResource::Secret(r) => {
                ManagedResource::Secret(replace_with(self.namespaced(&ns), &pp, r).await?)
            }
            ManagedResource::Service(r) => {
                ManagedResource::Service(replace_with(self.namespaced(&ns), &pp, r).await?)
            }
            ManagedResource::Deployment(r) => {
                ManagedResource::Deployment(replace_with(self.namespaced(&ns), &pp, r).await?)
            }
            ManagedResource::ApiService(r) => {
                ManagedResource::ApiService(replace_with(self.cluster(), &pp, r).await?)
            }
        };
        Ok(replaced)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), Error> {
        let ns = key.namespace.as_deref().unwrap_or_default();
        let name = key.name.as_str();
        match key.kind {
            ResourceKind::ServiceAccount => delete_with(self.namespaced::<ServiceAccount>(ns), name).await,
            ResourceKind::Role => delete_with(self.namespaced::<Role>(ns), name).await,
            ResourceKind::RoleBinding => delete_with(self.namespaced::<RoleBinding>(ns), name).await,
            ResourceKind::ClusterRole => delete_with(self.cluster::<ClusterRole>(), name).await,
            ResourceKind::ClusterRoleBinding => {
                delete_with(self.cluster::<ClusterRoleBinding>(), name).await
            }
            ResourceKind::Secret => delete_with(self.namespaced::<Secret>(ns), name).await,
            ResourceKind::Service => delete_with(self.namespaced::<Service>(ns), name).await,
            ResourceKind::Deployment => delete_with(self.namespaced::<Deployment>(ns), name).await,
            ResourceKind::ApiService => delete_with(self.cluster::<APIService>(), name).await,
        }
    }

    async fn list_labeled(
        &self,
        kind: ResourceKind,
        selector: &str,
    ) -> Result<Vec<ManagedResource>, Error> {
        let found = match kind {
            ResourceKind::ServiceAccount => list_with(self.cluster::<ServiceAccount>(), selector)
                .await?
                .into_iter()
                .map(ManagedResource::ServiceAccount)
                .collect(),
            ResourceKind::Role => list_with(self.cluster::<Role>(), selector)
                .await?
                .into_iter()
                .map(ManagedResource::Role)
                .collect(),
            ResourceKind::RoleBinding => list_with(self.cluster::<RoleBinding>(), selector)
                .await?
                .into_iter()
                .map(ManagedResource::RoleBinding)
                .collect(),
            ResourceKind::ClusterRole => list_with(self.cluster::<ClusterRole>(), selector)
                .await?
                .into_iter()
                .map(ManagedResource::ClusterRole)
                .collect(),
            ResourceKind::ClusterRoleBinding => {
                list_with(self.cluster::<ClusterRoleBinding>(), selector)
                    .await?
                    .into_iter()
                    .map(ManagedResource::ClusterRoleBinding)
                    .collect()
            }
            ResourceKind::Secret => list_with(self.cluster::<Secret>(), selector)
                .await?
                .into_iter()
                .map(ManagedResource::Secret)
                .collect(),
            ResourceKind::Service => list_with(self.cluster::<Service>(), selector)
                .await?
                .into_iter()
                .map(ManagedResource::Service)
                .collect(),
            ResourceKind::Deployment => list_with(self.cluster::<Deployment>(), selector)
                .await?
                .into_iter()
                .map(ManagedResource::Deployment)
                .collect(),
            ResourceKind::ApiService => list_with(self.cluster::<APIService>(), selector)
                .await?
                .into_iter()
                .map(ManagedResource::ApiService)
                .collect(),
        };
        Ok(found)
    }

    async fn rbac_snapshot(&self, namespace: &str) -> Result<RbacSnapshot, Error> {
        let lp = ListParams::default();
        Ok(RbacSnapshot {
            roles: self.namespaced::<Role>(namespace).list(&lp).await?.items,
            role_bindings: self.namespaced::<RoleBinding>(namespace).list(&lp).await?.items,
            cluster_roles: self.cluster::<ClusterRole>().list(&lp).await?.items,
            cluster_role_bindings: self.cluster::<ClusterRoleBinding>().list(&lp).await?.items,
        })
    }
}
