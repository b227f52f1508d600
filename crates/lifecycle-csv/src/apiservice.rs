//! Owned APIService provisioning
//!
//! For each owned API the CSV gets a serving chain:
//! - Service `<version>-<group-with-dashes>` routing 443 to the serving
//!   deployment's container port
//! - Secret `<apiservice>-cert` with a leaf certificate, its key, and the CA
//! - Role and RoleBinding `<apiservice>-cert` letting the deployment's
//!   service account read that Secret
//! - RoleBinding `<apiservice>-auth-reader` in kube-system for the
//!   authentication config map
//! - ClusterRoleBinding `<apiservice>-system:auth-delegator`
//! - the APIService itself, with the CA as its caBundle
//!
//! The serving deployment mounts the Secret and carries the certificate hash
//! on its pod template, so a rotated certificate rolls the pods.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    KeyToPath, Secret, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::{
    APIService, APIServiceSpec, ServiceReference,
};
use k8s_openapi::ByteString;
use lifecycle_common::crd::ApiServiceDescription;
use lifecycle_common::kube_utils::{condition_status, deterministic_hash, STATUS_TRUE};
use lifecycle_common::{Error, CERT_HASH_ANNOTATION};

use crate::pki::{self, ServingCertificate};
use crate::resource::{ManagedResource, ResourceKey, ResourceKind};
use crate::strategy::{DeploymentStrategy, RBAC_API_GROUP};

/// Where the serving certificate is mounted in every container of the deployment
pub const CERT_MOUNT_PATH: &str = "/apiserver.local.config/certificates";
/// Volume name for the mounted Secret
pub const CERT_VOLUME: &str = "apiservice-cert";
/// Container port used when the description gives none
pub const DEFAULT_CONTAINER_PORT: i32 = 443;

const SERVICE_PORT: i32 = 443;
const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";
const CA_CERT_KEY: &str = "ca.crt";
const KUBE_SYSTEM: &str = "kube-system";
const AUTH_READER_ROLE: &str = "extension-apiserver-authentication-reader";
const AUTH_DELEGATOR_ROLE: &str = "system:auth-delegator";
const GROUP_PRIORITY_MINIMUM: i32 = 2000;
const VERSION_PRIORITY: i32 = 15;

/// Names of everything provisioned for one owned API
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiServiceNames {
    pub api_service: String,
    pub service: String,
    pub secret: String,
    pub auth_reader: String,
    pub auth_delegator: String,
}

impl ApiServiceNames {
    pub fn new(desc: &ApiServiceDescription) -> Self {
        let api_service = desc.api_service_name();
        Self {
            service: api_service.replace('.', "-"),
            secret: format!("{api_service}-cert"),
            auth_reader: format!("{api_service}-auth-reader"),
            auth_delegator: format!("{api_service}-system:auth-delegator"),
            api_service,
        }
    }

    /// Role and RoleBinding guarding the Secret share its name
    pub fn cert_role(&self) -> &str {
        &self.secret
    }

    pub fn hosts(&self, namespace: &str) -> Vec<String> {
        vec![
            format!("{}.{}.svc", self.service, namespace),
            format!("{}.{}.svc.cluster.local", self.service, namespace),
        ]
    }

    pub fn keys(&self, namespace: &str) -> Vec<ResourceKey> {
        vec![
            ResourceKey::namespaced(ResourceKind::Role, namespace, self.cert_role()),
            ResourceKey::namespaced(ResourceKind::RoleBinding, namespace, self.cert_role()),
            ResourceKey::namespaced(ResourceKind::RoleBinding, KUBE_SYSTEM, &self.auth_reader),
            ResourceKey::cluster(ResourceKind::ClusterRoleBinding, &self.auth_delegator),
            ResourceKey::namespaced(ResourceKind::Secret, namespace, &self.secret),
            ResourceKey::namespaced(ResourceKind::Service, namespace, &self.service),
            ResourceKey::cluster(ResourceKind::ApiService, &self.api_service),
        ]
    }
}

fn named(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

fn secret_string(secret: &Secret, key: &str) -> Option<String> {
    let bytes = secret.data.as_ref()?.get(key)?;
    String::from_utf8(bytes.0.clone()).ok()
}

fn stored_certificate(secret: &Secret) -> Option<ServingCertificate> {
    Some(ServingCertificate {
        ca_pem: secret_string(secret, CA_CERT_KEY)?,
        cert_pem: secret_string(secret, TLS_CERT_KEY)?,
        key_pem: secret_string(secret, TLS_KEY_KEY)?,
    })
}

/// Keep the stored serving material if it is still good, otherwise issue new
pub fn serving_certificate(
    names: &ApiServiceNames,
    namespace: &str,
    existing: Option<&Secret>,
    now: DateTime<Utc>,
) -> Result<ServingCertificate, Error> {
    let hosts = names.hosts(namespace);
    if let Some(stored) = existing.and_then(stored_certificate) {
        if pki::is_reusable(&stored, &hosts, now) {
            return Ok(stored);
        }
    }
    ServingCertificate::issue(&names.api_service, &hosts)
        .map_err(|e| Error::internal_with_context("pki", e.to_string()))
}

/// True when the aggregator reports the APIService as Available
pub fn is_available(api_service: &APIService) -> bool {
    availability(api_service) == Some(STATUS_TRUE)
}

/// Status of the Available condition, if reported
pub fn availability(api_service: &APIService) -> Option<&str> {
    let conditions = api_service.status.as_ref()?.conditions.as_deref();
    condition_status(conditions, "Available")
}

/// Build the serving chain for `desc` and wire the certificate into the
/// serving deployment in `strategy`.
///
/// `existing_secret` is the live `<apiservice>-cert` Secret, if any.
pub fn provision(
    desc: &ApiServiceDescription,
    namespace: &str,
    strategy: &mut DeploymentStrategy,
    existing_secret: Option<&Secret>,
    now: DateTime<Utc>,
) -> Result<Vec<ManagedResource>, Error> {
    let names = ApiServiceNames::new(desc);
    let deployment_name = desc.deployment_name.as_deref().unwrap_or_default();
    let deployment = strategy.find_deployment_mut(deployment_name).ok_or_else(|| {
        Error::validation_for_field(
            &names.api_service,
            "spec.apiservicedefinitions.owned.deploymentName",
            format!("unknown deployment {deployment_name}"),
        )
    })?;

    let service_account = deployment
        .spec
        .template
        .spec
        .as_ref()
        .and_then(|p| p.service_account_name.clone())
        .unwrap_or_else(|| "default".to_string());
    let selector = deployment.spec.selector.match_labels.clone();

    let cert = serving_certificate(&names, namespace, existing_secret, now)?;
    mount_certificate(deployment, &names, &cert);

    let subject = Subject {
        kind: "ServiceAccount".to_string(),
        name: service_account,
        namespace: Some(namespace.to_string()),
        api_group: None,
    };

    let secret = Secret {
        metadata: named(&names.secret, Some(namespace)),
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(BTreeMap::from([
            (TLS_CERT_KEY.to_string(), ByteString(cert.cert_pem.clone().into_bytes())),
            (TLS_KEY_KEY.to_string(), ByteString(cert.key_pem.clone().into_bytes())),
            (CA_CERT_KEY.to_string(), ByteString(cert.ca_pem.clone().into_bytes())),
        ])),
        ..Default::default()
    };

    let cert_role = Role {
        metadata: named(names.cert_role(), Some(namespace)),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["secrets".to_string()]),
            resource_names: Some(vec![names.secret.clone()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        }]),
    };

    let cert_binding = RoleBinding {
        metadata: named(names.cert_role(), Some(namespace)),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name: names.cert_role().to_string(),
        },
        subjects: Some(vec![subject.clone()]),
    };

    let auth_reader = RoleBinding {
        metadata: named(&names.auth_reader, Some(KUBE_SYSTEM)),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name: AUTH_READER_ROLE.to_string(),
        },
        subjects: Some(vec![subject.clone()]),
    };

    let auth_delegator = ClusterRoleBinding {
        metadata: named(&names.auth_delegator, None),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: AUTH_DELEGATOR_ROLE.to_string(),
        },
        subjects: Some(vec![subject]),
    };

    let service = Service {
        metadata: named(&names.service, Some(namespace)),
        spec: Some(ServiceSpec {
            selector,
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(
                    desc.container_port.unwrap_or(DEFAULT_CONTAINER_PORT),
                )),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let api_service = APIService {
        metadata: named(&names.api_service, None),
        spec: Some(APIServiceSpec {
            group: Some(desc.group.clone()),
            version: Some(desc.version.clone()),
            group_priority_minimum: GROUP_PRIORITY_MINIMUM,
            version_priority: VERSION_PRIORITY,
            ca_bundle: Some(ByteString(cert.ca_pem.into_bytes())),
            service: Some(ServiceReference {
                name: Some(names.service.clone()),
                namespace: Some(namespace.to_string()),
                port: Some(SERVICE_PORT),
            }),
            insecure_skip_tls_verify: None,
        }),
        status: None,
    };

    Ok(vec![
        ManagedResource::Role(cert_role),
        ManagedResource::RoleBinding(cert_binding),
        ManagedResource::RoleBinding(auth_reader),
        ManagedResource::ClusterRoleBinding(auth_delegator),
        ManagedResource::Secret(secret),
        ManagedResource::Service(service),
        ManagedResource::ApiService(api_service),
    ])
}

fn mount_certificate(
    deployment: &mut crate::strategy::StrategyDeployment,
    names: &ApiServiceNames,
    cert: &ServingCertificate,
) {
    let template = &mut deployment.spec.template;
    template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(
            CERT_HASH_ANNOTATION.to_string(),
            deterministic_hash(&cert.cert_pem),
        );

    let Some(pod) = template.spec.as_mut() else {
        return;
    };
    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    volumes.retain(|v| v.name != CERT_VOLUME);
    volumes.push(Volume {
        name: CERT_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(names.secret.clone()),
            items: Some(vec![
                KeyToPath {
                    key: TLS_CERT_KEY.to_string(),
                    path: "apiserver.crt".to_string(),
                    mode: None,
                },
                KeyToPath {
                    key: TLS_KEY_KEY.to_string(),
                    path: "apiserver.key".to_string(),
                    mode: None,
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    });

    for container in &mut pod.containers {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        mounts.retain(|m| m.name != CERT_VOLUME && m.mount_path != CERT_MOUNT_PATH);
        mounts.push(VolumeMount {
            name: CERT_VOLUME.to_string(),
            mount_path: CERT_MOUNT_PATH.to_string(),
            ..Default::default()
        });
    }
}
