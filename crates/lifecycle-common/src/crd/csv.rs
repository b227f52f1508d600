//! ClusterServiceVersion: the declarative description of one version of an
//! installable operator.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::{ClusterServiceVersionStatus, CsvPhase};

/// The only install strategy this controller executes
pub const DEPLOYMENT_STRATEGY: &str = "deployment";

/// One version of an installable operator: what it needs, what it provides,
/// and how to run it.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operators.coreos.com",
    version = "v1alpha1",
    kind = "ClusterServiceVersion",
    plural = "clusterserviceversions",
    shortname = "csv",
    namespaced,
    derive = "PartialEq",
    status = "ClusterServiceVersionStatus",
    printcolumn = r#"{"name":"Display","type":"string","jsonPath":".spec.displayName"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Replaces","type":"string","jsonPath":".spec.replaces"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceVersionSpec {
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Semantic version of the packaged operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// How to run the operator
    pub install: NamedInstallStrategy,

    /// Custom resource kinds this version owns and requires
    #[serde(default, rename = "customresourcedefinitions")]
    pub custom_resource_definitions: CustomResourceDefinitions,

    /// Aggregated API services this version owns and requires
    #[serde(default, rename = "apiservicedefinitions")]
    pub api_service_definitions: ApiServiceDefinitions,

    /// Name of the CSV (same namespace) this one supersedes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
}

/// A named install strategy with an opaque, strategy-specific payload.
///
/// The payload is decoded by the install executor once the strategy name is
/// known, so the CRD schema does not constrain it.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct NamedInstallStrategy {
    /// Strategy name (`deployment`)
    pub strategy: String,

    /// Strategy payload
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub spec: serde_json::Value,
}

fn preserve_unknown_fields(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    schemars::schema::Schema::Object(schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Object.into()),
        extensions: [(
            "x-kubernetes-preserve-unknown-fields".to_string(),
            serde_json::Value::Bool(true),
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    })
}

/// Owned and required custom resource kinds
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CustomResourceDefinitions {
    /// Kinds this version provides
    #[serde(default)]
    pub owned: Vec<CrdDescription>,
    /// Kinds that must already be served before install
    #[serde(default)]
    pub required: Vec<CrdDescription>,
}

/// Reference to a custom resource kind by its CRD name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrdDescription {
    /// CRD name, `<plural>.<group>`
    pub name: String,
    /// Served version that must be present
    pub version: String,
    /// Kind of the custom resource
    pub kind: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Description shown in UIs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CrdDescription {
    /// API group, derived from the CRD name (`<plural>.<group>`)
    pub fn group(&self) -> &str {
        self.name
            .split_once('.')
            .map(|(_, group)| group)
            .unwrap_or_default()
    }
}

/// Owned and required aggregated API services
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ApiServiceDefinitions {
    /// APIs this version serves from one of its deployments
    #[serde(default)]
    pub owned: Vec<ApiServiceDescription>,
    /// APIs that must already be registered before install
    #[serde(default)]
    pub required: Vec<ApiServiceDescription>,
}

/// Reference to an aggregated API (group/version/kind) and, for owned APIs,
/// the deployment that serves it
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiServiceDescription {
    /// API group
    pub group: String,
    /// API version
    pub version: String,
    /// Kind served under the group/version
    pub kind: String,
    /// Deployment in the install strategy that serves the API (owned only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    /// Port the serving container listens on (owned only, default 443)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<i32>,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Description shown in UIs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ApiServiceDescription {
    /// Name of the APIService object, `<version>.<group>`
    pub fn api_service_name(&self) -> String {
        format!("{}.{}", self.version, self.group)
    }
}

impl ClusterServiceVersion {
    /// Current phase, `Pending` when no status has been written
    pub fn phase(&self) -> CsvPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// True once the object has been marked for deletion
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
