//! Objects written by the install executor
//!
//! Every write goes through [`ManagedResource`], which knows the object's
//! identity ([`ResourceKey`]), how it is owned, and whether the live copy
//! still matches what we want.
//!
//! Ownership:
//! - namespaced objects in the CSV's namespace carry an ownerReference to the
//!   CSV, so the garbage collector removes them with it
//! - every object also carries owner labels; for cluster-scoped and
//!   cross-namespace objects those labels are the only record, and the
//!   controller deletes them itself when the CSV goes away
//!
//! Drift: the hash of the desired content is stored in an annotation. A live
//! object is in sync when its hash and its CSV owners match the desired ones.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::{Resource, ResourceExt};
use lifecycle_common::crd::ClusterServiceVersion;
use lifecycle_common::kube_utils::deterministic_hash;
use lifecycle_common::{
    Error, OWNER_KIND_LABEL, OWNER_NAMESPACE_LABEL, OWNER_NAME_ANNOTATION, OWNER_NAME_LABEL,
    SPEC_HASH_ANNOTATION,
};

/// Longest value the apiserver accepts for a label
const MAX_LABEL_VALUE_LEN: usize = 63;

/// Kinds the install executor manages, in the order they are written
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    ServiceAccount,
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
    Secret,
    Service,
    Deployment,
    ApiService,
}

impl ResourceKind {
    /// Every managed kind
    pub const ALL: [ResourceKind; 9] = [
        ResourceKind::ServiceAccount,
        ResourceKind::Role,
        ResourceKind::RoleBinding,
        ResourceKind::ClusterRole,
        ResourceKind::ClusterRoleBinding,
        ResourceKind::Secret,
        ResourceKind::Service,
        ResourceKind::Deployment,
        ResourceKind::ApiService,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::Role => "Role",
            ResourceKind::RoleBinding => "RoleBinding",
            ResourceKind::ClusterRole => "ClusterRole",
            ResourceKind::ClusterRoleBinding => "ClusterRoleBinding",
            ResourceKind::Secret => "Secret",
            ResourceKind::Service => "Service",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::ApiService => "APIService",
        }
    }

    pub fn is_cluster_scoped(self) -> bool {
        matches!(
            self,
            ResourceKind::ClusterRole | ResourceKind::ClusterRoleBinding | ResourceKind::ApiService
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a managed object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn namespaced(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// An object the install executor creates, updates, or deletes
#[derive(Clone, Debug, PartialEq)]
pub enum ManagedResource {
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    Secret(Secret),
    Service(Service),
    Deployment(Deployment),
    ApiService(APIService),
}

impl ManagedResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ManagedResource::ServiceAccount(_) => ResourceKind::ServiceAccount,
            ManagedResource::Role(_) => ResourceKind::Role,
            ManagedResource::RoleBinding(_) => ResourceKind::RoleBinding,
            ManagedResource::ClusterRole(_) => ResourceKind::ClusterRole,
            ManagedResource::ClusterRoleBinding(_) => ResourceKind::ClusterRoleBinding,
            ManagedResource::Secret(_) => ResourceKind::Secret,
            ManagedResource::Service(_) => ResourceKind::Service,
            ManagedResource::Deployment(_) => ResourceKind::Deployment,
            ManagedResource::ApiService(_) => ResourceKind::ApiService,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ManagedResource::ServiceAccount(r) => &r.metadata,
            ManagedResource::Role(r) => &r.metadata,
            ManagedResource::RoleBinding(r) => &r.metadata,
            ManagedResource::ClusterRole(r) => &r.metadata,
            ManagedResource::ClusterRoleBinding(r) => &r.metadata,
            ManagedResource::Secret(r) => &r.metadata,
            ManagedResource::Service(r) => &r.metadata,
            ManagedResource::Deployment(r) => &r.metadata,
            ManagedResource::ApiService(r) => &r.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ManagedResource::ServiceAccount(r) => &mut r.metadata,
            ManagedResource::Role(r) => &mut r.metadata,
            ManagedResource::RoleBinding(r) => &mut r.metadata,
            ManagedResource::ClusterRole(r) => &mut r.metadata,
            ManagedResource::ClusterRoleBinding(r) => &mut r.metadata,
            ManagedResource::Secret(r) => &mut r.metadata,
            ManagedResource::Service(r) => &mut r.metadata,
            ManagedResource::Deployment(r) => &mut r.metadata,
            ManagedResource::ApiService(r) => &mut r.metadata,
        }
    }

    pub fn key(&self) -> ResourceKey {
        let kind = self.kind();
        let name = self.meta().name.clone().unwrap_or_default();
        if kind.is_cluster_scoped() {
            ResourceKey::cluster(kind, name)
        } else {
            ResourceKey {
                kind,
                namespace: self.meta().namespace.clone(),
                name,
            }
        }
    }

    pub fn spec_hash(&self) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()?
            .get(SPEC_HASH_ANNOTATION)
            .map(String::as_str)
    }

    pub fn owner_references(&self) -> &[OwnerReference] {
        self.meta().owner_references.as_deref().unwrap_or_default()
    }

    /// Hash of everything we control: the object minus server-managed
    /// metadata and the hash annotation itself.
    fn content_hash(&self) -> Result<String, Error> {
        let mut content = self.clone();
        let meta = content.meta_mut();
        let stripped = ObjectMeta {
            name: meta.name.take(),
            namespace: meta.namespace.take(),
            labels: meta.labels.take(),
            annotations: meta.annotations.take().map(|mut a| {
                a.remove(SPEC_HASH_ANNOTATION);
                a
            }),
            ..Default::default()
        };
        *meta = stripped;
        let json = match &content {
            ManagedResource::ServiceAccount(r) => serde_json::to_string(r),
            ManagedResource::Role(r) => serde_json::to_string(r),
            ManagedResource::RoleBinding(r) => serde_json::to_string(r),
            ManagedResource::ClusterRole(r) => serde_json::to_string(r),
            ManagedResource::ClusterRoleBinding(r) => serde_json::to_string(r),
            ManagedResource::Secret(r) => serde_json::to_string(r),
            ManagedResource::Service(r) => serde_json::to_string(r),
            ManagedResource::Deployment(r) => serde_json::to_string(r),
            ManagedResource::ApiService(r) => serde_json::to_string(r),
        }
        .map_err(|e| Error::serialization_for_kind(self.kind().as_str(), e.to_string()))?;
        Ok(deterministic_hash(&json))
    }
}

/// `name` as a label value: unchanged when it fits, otherwise a prefix of it
/// followed by a hash of the whole name.
pub fn owner_label_value(name: &str) -> String {
    if name.len() <= MAX_LABEL_VALUE_LEN {
        return name.to_string();
    }
    let hash = deterministic_hash(name);
    let keep = MAX_LABEL_VALUE_LEN - hash.len() - 1;
    let prefix: String = name.chars().take(keep).collect();
    format!("{}-{hash}", prefix.trim_end_matches(['-', '.']))
}

/// The CSV on whose behalf objects are written
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsvOwner {
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

impl CsvOwner {
    pub fn from_csv(csv: &ClusterServiceVersion) -> Result<Self, Error> {
        let name = csv.name_any();
        let namespace = csv
            .namespace()
            .ok_or_else(|| Error::validation_for(&name, "ClusterServiceVersion must be namespaced"))?;
        let uid = csv
            .uid()
            .ok_or_else(|| Error::validation_for(&name, "ClusterServiceVersion has no uid"))?;
        Ok(Self {
            name,
            namespace,
            uid,
        })
    }

    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: ClusterServiceVersion::api_version(&()).to_string(),
            kind: ClusterServiceVersion::kind(&()).to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(false),
            block_owner_deletion: Some(false),
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (OWNER_NAME_LABEL.to_string(), owner_label_value(&self.name)),
            (OWNER_NAMESPACE_LABEL.to_string(), self.namespace.clone()),
            (
                OWNER_KIND_LABEL.to_string(),
                ClusterServiceVersion::kind(&()).to_string(),
            ),
        ])
    }

    /// Label selector matching objects labeled as ours
    pub fn label_selector(&self) -> String {
        self.labels()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn is_referenced_by(&self, meta: &ObjectMeta) -> bool {
        meta.owner_references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|r| r.uid == self.uid)
    }

    pub fn is_labeled_owner_of(&self, meta: &ObjectMeta) -> bool {
        let Some(labels) = meta.labels.as_ref() else {
            return false;
        };
        self.labels()
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }

    /// True when the object records this CSV as an owner by either mechanism
    pub fn owns(&self, meta: &ObjectMeta) -> bool {
        self.is_referenced_by(meta) || self.is_labeled_owner_of(meta)
    }

    /// Whether objects at `key` are owned through an ownerReference
    pub fn uses_owner_reference(&self, key: &ResourceKey) -> bool {
        !key.kind.is_cluster_scoped() && key.namespace.as_deref() == Some(self.namespace.as_str())
    }
}

fn is_csv_reference(r: &OwnerReference) -> bool {
    r.kind == ClusterServiceVersion::kind(&()) && r.api_version == ClusterServiceVersion::api_version(&())
}

/// Attach owner labels, the content hash, and (where applicable) the owner
/// reference to a freshly built desired object.
pub fn stamp(mut desired: ManagedResource, owner: &CsvOwner) -> Result<ManagedResource, Error> {
    desired
        .meta_mut()
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(owner.labels());
    let hash = desired.content_hash()?;
    let use_ref = owner.uses_owner_reference(&desired.key());

    let meta = desired.meta_mut();
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(OWNER_NAME_ANNOTATION.to_string(), owner.name.clone());
    annotations.insert(SPEC_HASH_ANNOTATION.to_string(), hash);
    meta.owner_references = use_ref.then(|| vec![owner.owner_reference()]);
    Ok(desired)
}

/// Owner references a live object should end up with: non-CSV owners are
/// kept, CSV owners are replaced by `desired`.
pub fn merged_owner_references(
    desired: &[OwnerReference],
    observed: &[OwnerReference],
) -> Vec<OwnerReference> {
    let mut merged: Vec<OwnerReference> = observed
        .iter()
        .filter(|r| !is_csv_reference(r))
        .cloned()
        .collect();
    for r in desired {
        if !merged.iter().any(|m| m.uid == r.uid) {
            merged.push(r.clone());
        }
    }
    merged
}

fn owner_uids(refs: &[OwnerReference]) -> BTreeSet<&str> {
    refs.iter().map(|r| r.uid.as_str()).collect()
}

/// True when `observed` needs no write to match the stamped `desired` object
pub fn in_sync(desired: &ManagedResource, observed: &ManagedResource) -> bool {
    if desired.spec_hash().is_none() || desired.spec_hash() != observed.spec_hash() {
        return false;
    }
    let merged = merged_owner_references(desired.owner_references(), observed.owner_references());
    owner_uids(&merged) == owner_uids(observed.owner_references())
}

fn merge_maps(
    observed: Option<&BTreeMap<String, String>>,
    desired: Option<&BTreeMap<String, String>>,
    drop_from_observed: &[&str],
) -> Option<BTreeMap<String, String>> {
    let mut merged: BTreeMap<String, String> = observed
        .into_iter()
        .flatten()
        .filter(|(k, _)| !drop_from_observed.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    merged.extend(desired.into_iter().flatten().map(|(k, v)| (k.clone(), v.clone())));
    (!merged.is_empty()).then_some(merged)
}

/// Build the body of a conditional replace of `observed` with `desired`.
///
/// Carries over the observed resourceVersion, foreign labels, annotations
/// and non-CSV owners, and fields the server assigns.
pub fn merge_for_update(desired: &ManagedResource, observed: &ManagedResource) -> ManagedResource {
    let mut merged = desired.clone();
    let have = observed.meta();
    {
        let meta = merged.meta_mut();
        meta.resource_version = have.resource_version.clone();
        let refs = merged_owner_references(
            meta.owner_references.as_deref().unwrap_or_default(),
            have.owner_references.as_deref().unwrap_or_default(),
        );
        meta.owner_references = (!refs.is_empty()).then_some(refs);
        meta.labels = merge_maps(
            have.labels.as_ref(),
            meta.labels.as_ref(),
            &[OWNER_NAME_LABEL, OWNER_NAMESPACE_LABEL, OWNER_KIND_LABEL],
        );
        meta.annotations = merge_maps(have.annotations.as_ref(), meta.annotations.as_ref(), &[]);
    }
    preserve_server_fields(&mut merged, observed);
    merged
}

fn preserve_server_fields(merged: &mut ManagedResource, observed: &ManagedResource) {
    match (merged, observed) {
        (ManagedResource::Service(want), ManagedResource::Service(have)) => {
            if let (Some(spec), Some(have_spec)) = (want.spec.as_mut(), have.spec.as_ref()) {
                if spec.cluster_ip.is_none() {
                    spec.cluster_ip = have_spec.cluster_ip.clone();
                }
                if spec.cluster_ips.is_none() {
                    spec.cluster_ips = have_spec.cluster_ips.clone();
                }
            }
        }
        (ManagedResource::ServiceAccount(want), ManagedResource::ServiceAccount(have)) => {
            if want.secrets.is_none() {
                want.secrets = have.secrets.clone();
            }
            if want.image_pull_secrets.is_none() {
                want.image_pull_secrets = have.image_pull_secrets.clone();
            }
        }
        _ => {}
    }
}
