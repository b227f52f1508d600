//! Observed state of a ClusterServiceVersion

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Maximum number of phase transitions kept in `status.conditions`
pub const MAX_CONDITIONS: usize = 20;

/// Lifecycle phase of a ClusterServiceVersion
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash,
)]
pub enum CsvPhase {
    /// Requirements have not been evaluated or are unmet
    #[default]
    Pending,
    /// All requirements met; install may start
    InstallReady,
    /// The install executor is converging resources
    Installing,
    /// Installed and verified
    Succeeded,
    /// Install failed or a requirement was lost after install
    Failed,
    /// A successor has taken over; resources are being handed off
    Replacing,
    /// Handed off; this CSV is being removed
    Deleting,
    /// Requirements could not be evaluated
    Unknown,
}

impl std::fmt::Display for CsvPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "Pending",
            Self::InstallReady => "InstallReady",
            Self::Installing => "Installing",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Replacing => "Replacing",
            Self::Deleting => "Deleting",
            Self::Unknown => "Unknown",
        })
    }
}

/// Machine-readable reason for the current phase
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum CsvReason {
    /// Requirements have not been evaluated yet
    RequirementsUnknown,
    /// One or more requirements are missing
    RequirementsNotMet,
    /// All requirements are present and satisfied
    AllRequirementsMet,
    /// Install verified
    InstallSucceeded,
    /// Resources written, waiting for workloads and APIs to become available
    InstallWaiting,
    /// A resource write was rejected
    InstallComponentFailed,
    /// The install strategy cannot be executed
    InvalidStrategy,
    /// A successor CSV has taken over
    BeingReplaced,
    /// The successor owns everything; this CSV is being deleted
    Replaced,
    /// Requirements could not be evaluated
    EvaluationError,
}

impl std::fmt::Display for CsvReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::RequirementsUnknown => "RequirementsUnknown",
            Self::RequirementsNotMet => "RequirementsNotMet",
            Self::AllRequirementsMet => "AllRequirementsMet",
            Self::InstallSucceeded => "InstallSucceeded",
            Self::InstallWaiting => "InstallWaiting",
            Self::InstallComponentFailed => "InstallComponentFailed",
            Self::InvalidStrategy => "InvalidStrategy",
            Self::BeingReplaced => "BeingReplaced",
            Self::Replaced => "Replaced",
            Self::EvaluationError => "EvaluationError",
        })
    }
}

/// Outcome of evaluating one requirement
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum RequirementState {
    /// Found and satisfied
    Present,
    /// Not found
    NotPresent,
    /// Found but not satisfied (e.g. a CRD that does not serve the version)
    PresentNotSatisfied,
}

/// Outcome of evaluating one sub-item of a requirement (e.g. one permission rule)
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum DependentState {
    /// Granted by the existing access graph
    Satisfied,
    /// Not granted
    NotSatisfied,
}

/// Result of evaluating a sub-item of a requirement
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DependentStatus {
    /// API group of the dependent
    pub group: String,
    /// API version of the dependent
    pub version: String,
    /// Kind of the dependent
    pub kind: String,
    /// Evaluation outcome
    pub status: DependentState,
    /// What was checked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result of evaluating one requirement
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequirementStatus {
    /// API group of the required object
    pub group: String,
    /// API version of the required object
    pub version: String,
    /// Kind of the required object
    pub kind: String,
    /// Name of the required object
    pub name: String,
    /// Evaluation outcome
    pub status: RequirementState,
    /// Why the requirement has this status
    pub message: String,
    /// Per-rule outcomes for permission requirements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<DependentStatus>,
}

impl RequirementStatus {
    /// True when this requirement does not block install
    pub fn is_met(&self) -> bool {
        self.status == RequirementState::Present
    }
}

/// One recorded phase transition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CsvCondition {
    /// Phase entered
    pub phase: CsvPhase,
    /// Reason for entering it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CsvReason>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the condition was last written
    pub last_update_time: DateTime<Utc>,
    /// When the phase was entered
    pub last_transition_time: DateTime<Utc>,
}

/// Status of a ClusterServiceVersion
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceVersionStatus {
    /// Current phase
    #[serde(default)]
    pub phase: CsvPhase,

    /// Reason for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CsvReason>,

    /// Human-readable detail; lists every unmet requirement when Pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the status was last written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,

    /// When the current phase was entered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// `metadata.generation` this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Per-requirement evaluation results, sorted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirement_status: Vec<RequirementStatus>,

    /// Phase transition history, newest last, at most [`MAX_CONDITIONS`]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CsvCondition>,
}
