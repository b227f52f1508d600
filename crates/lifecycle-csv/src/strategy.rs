//! Install strategies
//!
//! `spec.install` names a strategy and carries an opaque payload. Decoding
//! turns it into a typed [`InstallStrategy`]; an unknown name or a payload
//! that does not parse makes the CSV fail with `InvalidStrategy`.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use lifecycle_common::crd::{ApiServiceDefinitions, NamedInstallStrategy, DEPLOYMENT_STRATEGY};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource::{ManagedResource, ResourceKey};

pub(crate) const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Why a strategy cannot be executed
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StrategyError {
    #[error("unsupported install strategy \"{0}\"")]
    Unsupported(String),

    #[error("malformed {strategy} strategy: {message}")]
    Malformed { strategy: String, message: String },

    #[error("invalid install strategy: {0}")]
    Invalid(String),
}

/// Payload of the `deployment` strategy
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStrategy {
    #[serde(default)]
    pub deployments: Vec<StrategyDeployment>,
    /// Namespaced grants
    #[serde(default)]
    pub permissions: Vec<StrategyPermission>,
    /// Cluster-wide grants
    #[serde(default)]
    pub cluster_permissions: Vec<StrategyPermission>,
}

/// A named workload
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct StrategyDeployment {
    pub name: String,
    pub spec: DeploymentSpec,
    /// Extra labels for the Deployment object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<BTreeMap<String, String>>,
}

/// Rules a service account needs
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyPermission {
    pub service_account_name: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// A decoded install strategy
#[derive(Clone, Debug, PartialEq)]
pub enum InstallStrategy {
    Deployment(DeploymentStrategy),
}

impl InstallStrategy {
    pub fn decode(named: &NamedInstallStrategy) -> Result<Self, StrategyError> {
        match named.strategy.as_str() {
            DEPLOYMENT_STRATEGY => serde_json::from_value(named.spec.clone())
                .map(InstallStrategy::Deployment)
                .map_err(|e| StrategyError::Malformed {
                    strategy: named.strategy.clone(),
                    message: e.to_string(),
                }),
            other => Err(StrategyError::Unsupported(other.to_string())),
        }
    }

    /// Decode and check internal consistency against the owned APIs
    pub fn decode_and_validate(
        named: &NamedInstallStrategy,
        apis: &ApiServiceDefinitions,
    ) -> Result<Self, StrategyError> {
        let strategy = Self::decode(named)?;
        strategy.validate(apis)?;
        Ok(strategy)
    }

    pub fn deployment(&self) -> &DeploymentStrategy {
        match self {
            InstallStrategy::Deployment(d) => d,
        }
    }

    pub fn deployment_mut(&mut self) -> &mut DeploymentStrategy {
        match self {
            InstallStrategy::Deployment(d) => d,
        }
    }

    fn validate(&self, apis: &ApiServiceDefinitions) -> Result<(), StrategyError> {
        let strategy = self.deployment();
        let mut names = BTreeSet::new();
        for dep in &strategy.deployments {
            if dep.name.is_empty() {
                return Err(StrategyError::Invalid("deployment with empty name".to_string()));
            }
            if !names.insert(dep.name.as_str()) {
                return Err(StrategyError::Invalid(format!(
                    "deployment {} declared more than once",
                    dep.name
                )));
            }
            let has_containers = dep
                .spec
                .template
                .spec
                .as_ref()
                .is_some_and(|p| !p.containers.is_empty());
            if !has_containers {
                return Err(StrategyError::Invalid(format!(
                    "deployment {} has no containers",
                    dep.name
                )));
            }
        }

        for perm in strategy.permissions.iter().chain(&strategy.cluster_permissions) {
            if perm.service_account_name.is_empty() {
                return Err(StrategyError::Invalid(
                    "permission with empty serviceAccountName".to_string(),
                ));
            }
        }

        let mut served = BTreeSet::new();
        for api in &apis.owned {
            let Some(dep_name) = api.deployment_name.as_deref() else {
                return Err(StrategyError::Invalid(format!(
                    "owned APIService {} names no deployment",
                    api.api_service_name()
                )));
            };
            let Some(dep) = strategy.find_deployment(dep_name) else {
                return Err(StrategyError::Invalid(format!(
                    "owned APIService {} refers to unknown deployment {}",
                    api.api_service_name(),
                    dep_name
                )));
            };
            if !served.insert(dep_name) {
                return Err(StrategyError::Invalid(format!(
                    "deployment {} serves more than one owned APIService",
                    dep_name
                )));
            }
            if !dep.spec.selector.match_labels.as_ref().is_some_and(|l| !l.is_empty()) {
                return Err(StrategyError::Invalid(format!(
                    "deployment {} serving {} needs selector.matchLabels",
                    dep_name,
                    api.api_service_name()
                )));
            }
        }
        Ok(())
    }
}

/// Name of the Role and RoleBinding granting `service_account` its namespaced rules
pub fn role_name(csv_name: &str, service_account: &str) -> String {
    format!("{csv_name}-{service_account}")
}

/// Name of the ClusterRole and ClusterRoleBinding granting cluster-wide rules
pub fn cluster_role_name(namespace: &str, csv_name: &str, service_account: &str) -> String {
    format!("{namespace}-{csv_name}-{service_account}")
}

fn named(name: impl Into<String>, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

fn service_account_subject(namespace: &str, service_account: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: service_account.to_string(),
        namespace: Some(namespace.to_string()),
        api_group: None,
    }
}

fn group_rules(perms: &[StrategyPermission]) -> BTreeMap<&str, Vec<PolicyRule>> {
    let mut grouped: BTreeMap<&str, Vec<PolicyRule>> = BTreeMap::new();
    for perm in perms {
        grouped
            .entry(perm.service_account_name.as_str())
            .or_default()
            .extend(perm.rules.iter().cloned());
    }
    grouped
}

impl DeploymentStrategy {
    pub fn find_deployment(&self, name: &str) -> Option<&StrategyDeployment> {
        self.deployments.iter().find(|d| d.name == name)
    }

    pub fn find_deployment_mut(&mut self, name: &str) -> Option<&mut StrategyDeployment> {
        self.deployments.iter_mut().find(|d| d.name == name)
    }

    /// Namespaced rules requested per service account
    pub fn namespaced_rules(&self) -> BTreeMap<&str, Vec<PolicyRule>> {
        group_rules(&self.permissions)
    }

    /// Cluster-wide rules requested per service account
    pub fn cluster_rules(&self) -> BTreeMap<&str, Vec<PolicyRule>> {
        group_rules(&self.cluster_permissions)
    }

    /// Objects the strategy materializes, unstamped: identities, grants, workloads
    pub fn desired_resources(&self, csv_name: &str, namespace: &str) -> Vec<ManagedResource> {
        let mut out = Vec::new();

        let accounts: BTreeSet<&str> = self
            .permissions
            .iter()
            .chain(&self.cluster_permissions)
            .map(|p| p.service_account_name.as_str())
            .collect();
        for sa in accounts {
            out.push(ManagedResource::ServiceAccount(ServiceAccount {
                metadata: named(sa, Some(namespace)),
                ..Default::default()
            }));
        }

        for (sa, rules) in self.namespaced_rules() {
            let name = role_name(csv_name, sa);
            out.push(ManagedResource::Role(Role {
                metadata: named(&name, Some(namespace)),
                rules: Some(rules),
            }));
            out.push(ManagedResource::RoleBinding(RoleBinding {
                metadata: named(&name, Some(namespace)),
                role_ref: RoleRef {
                    api_group: RBAC_API_GROUP.to_string(),
                    kind: "Role".to_string(),
                    name,
                },
                subjects: Some(vec![service_account_subject(namespace, sa)]),
            }));
        }

        for (sa, rules) in self.cluster_rules() {
            let name = cluster_role_name(namespace, csv_name, sa);
            out.push(ManagedResource::ClusterRole(ClusterRole {
                metadata: named(&name, None),
                rules: Some(rules),
                aggregation_rule: None,
            }));
            out.push(ManagedResource::ClusterRoleBinding(ClusterRoleBinding {
                metadata: named(&name, None),
                role_ref: RoleRef {
                    api_group: RBAC_API_GROUP.to_string(),
                    kind: "ClusterRole".to_string(),
                    name,
                },
                subjects: Some(vec![service_account_subject(namespace, sa)]),
            }));
        }

        for dep in &self.deployments {
            let mut metadata = named(&dep.name, Some(namespace));
            metadata.labels = dep.label.clone();
            out.push(ManagedResource::Deployment(Deployment {
                metadata,
                spec: Some(dep.spec.clone()),
                status: None,
            }));
        }
        out
    }

    pub fn resource_keys(&self, csv_name: &str, namespace: &str) -> Vec<ResourceKey> {
        self.desired_resources(csv_name, namespace)
            .iter()
            .map(ManagedResource::key)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;
    use crate::testing::{nginx_deployment_spec, strategy_json};
    use lifecycle_common::crd::ApiServiceDescription;
    use serde_json::json;

    fn named_strategy(spec: serde_json::Value) -> NamedInstallStrategy {
        NamedInstallStrategy {
            strategy: DEPLOYMENT_STRATEGY.to_string(),
            spec,
        }
    }

    fn owned_api(deployment: &str) -> ApiServiceDefinitions {
        ApiServiceDefinitions {
            owned: vec![ApiServiceDescription {
                group: "packages.apps.redhat.com".to_string(),
                version: "v1alpha1".to_string(),
                kind: "PackageManifest".to_string(),
                deployment_name: Some(deployment.to_string()),
                container_port: Some(5443),
                ..Default::default()
            }],
            required: vec![],
        }
    }

    #[test]
    fn unknown_strategy_names_are_rejected() {
        let named = NamedInstallStrategy {
            strategy: "helm".to_string(),
            spec: json!({}),
        };
        assert_eq!(
            InstallStrategy::decode(&named),
            Err(StrategyError::Unsupported("helm".to_string()))
        );
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let named = named_strategy(json!({"deployments": [{"name": "x"}]}));
        assert!(matches!(
            InstallStrategy::decode(&named),
            Err(StrategyError::Malformed { .. })
        ));
    }

    #[test]
    fn duplicate_deployment_names_are_invalid() {
        let spec = serde_json::to_value(nginx_deployment_spec("web")).unwrap();
        let named = named_strategy(json!({
            "deployments": [{"name": "web", "spec": spec}, {"name": "web", "spec": spec}]
        }));
        let err = InstallStrategy::decode_and_validate(&named, &Default::default()).unwrap_err();
        assert!(err.to_string().contains("declared more than once"));
    }

    #[test]
    fn owned_apis_must_name_a_declared_deployment() {
        let named = named_strategy(strategy_json("web", &[], &[]));
        let err = InstallStrategy::decode_and_validate(&named, &owned_api("missing")).unwrap_err();
        assert!(err.to_string().contains("unknown deployment missing"));
        assert!(InstallStrategy::decode_and_validate(&named, &owned_api("web")).is_ok());
    }

    #[test]
    fn desired_resources_cover_identities_grants_and_workloads() {
        let rule = PolicyRule {
            verbs: vec!["get".to_string()],
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["pods".to_string()]),
            ..Default::default()
        };
        let named = named_strategy(strategy_json(
            "web",
            &[("web-sa", rule.clone()), ("web-sa", rule.clone())],
            &[("web-sa", rule)],
        ));
        let strategy = InstallStrategy::decode(&named).unwrap();
        let keys = strategy.deployment().resource_keys("web.v1", "apps");
        let kinds: Vec<ResourceKind> = keys.iter().map(|k| k.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::ServiceAccount,
                ResourceKind::Role,
                ResourceKind::RoleBinding,
                ResourceKind::ClusterRole,
                ResourceKind::ClusterRoleBinding,
                ResourceKind::Deployment,
            ]
        );
        assert!(keys.contains(&ResourceKey::namespaced(ResourceKind::Role, "apps", "web.v1-web-sa")));
        assert!(keys.contains(&ResourceKey::cluster(
            ResourceKind::ClusterRole,
            "apps-web.v1-web-sa"
        )));

        let roles = strategy.deployment().namespaced_rules();
        assert_eq!(roles["web-sa"].len(), 2);
    }
}
