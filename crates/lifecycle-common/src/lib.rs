//! Common types for the lifecycle operator: the ClusterServiceVersion CRD, errors, and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager recorded on every write the operator makes
pub const FIELD_MANAGER: &str = "lifecycle-operator";

/// Finalizer that lets the operator release label-owned objects before a CSV disappears
pub const CSV_FINALIZER: &str = "lifecycle.dev/cleanup";

/// Label naming the ClusterServiceVersion that owns an object, shortened with a
/// hash suffix when the name does not fit in a label value
pub const OWNER_NAME_LABEL: &str = "lifecycle.dev/owner";

/// Annotation holding the full name of the owning ClusterServiceVersion, which
/// may be longer than a label value allows
pub const OWNER_NAME_ANNOTATION: &str = "lifecycle.dev/owner-name";

/// Label naming the namespace of the owning ClusterServiceVersion
pub const OWNER_NAMESPACE_LABEL: &str = "lifecycle.dev/owner-namespace";

/// Label naming the kind of the owner (always `ClusterServiceVersion` for our writes)
pub const OWNER_KIND_LABEL: &str = "lifecycle.dev/owner-kind";

/// Annotation holding the hash of the desired content last written to an object
pub const SPEC_HASH_ANNOTATION: &str = "lifecycle.dev/spec-hash";

/// Pod template annotation holding the hash of the mounted APIService serving certificate
pub const CERT_HASH_ANNOTATION: &str = "lifecycle.dev/apiservice-cert-hash";
