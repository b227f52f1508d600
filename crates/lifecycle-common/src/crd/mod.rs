//! Custom Resource Definitions for the lifecycle operator

mod csv;
mod status;

pub use csv::{
    ApiServiceDefinitions, ApiServiceDescription, ClusterServiceVersion,
    ClusterServiceVersionSpec, CrdDescription, CustomResourceDefinitions, NamedInstallStrategy,
    DEPLOYMENT_STRATEGY,
};
pub use status::{
    ClusterServiceVersionStatus, CsvCondition, CsvPhase, CsvReason, DependentState,
    DependentStatus, RequirementState, RequirementStatus, MAX_CONDITIONS,
};
