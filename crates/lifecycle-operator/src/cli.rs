//! Command line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

use lifecycle_common::config::OperatorConfig;
use lifecycle_common::Error;

/// Lifecycle operator - installs and upgrades operators described by ClusterServiceVersions
#[derive(Parser, Debug)]
#[command(name = "lifecycle-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the ClusterServiceVersion CRD manifest and exit
    #[arg(long)]
    pub crd: bool,

    /// Path to a kubeconfig (defaults to in-cluster config, then $KUBECONFIG)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "LIFECYCLE_TEXT_LOGS")]
    pub text_logs: bool,

    #[command(flatten)]
    pub config: ConfigArgs,
}

/// Controller tunables; unset values keep [`OperatorConfig::default`]
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Only reconcile CSVs in this namespace (empty = all namespaces)
    #[arg(long, env = "LIFECYCLE_WATCH_NAMESPACE", default_value = "")]
    pub watch_namespace: String,

    /// Field manager recorded on every write
    #[arg(long, env = "LIFECYCLE_FIELD_MANAGER")]
    pub field_manager: Option<String>,

    /// Upper bound on a single reconcile pass
    #[arg(long, env = "LIFECYCLE_RECONCILE_TIMEOUT_SECS")]
    pub reconcile_timeout_secs: Option<u64>,

    /// Requeue interval while requirements are unmet
    #[arg(long, env = "LIFECYCLE_REQUEUE_PENDING_SECS")]
    pub requeue_pending_secs: Option<u64>,

    /// Drift-check interval for installed CSVs
    #[arg(long, env = "LIFECYCLE_REQUEUE_SUCCEEDED_SECS")]
    pub requeue_succeeded_secs: Option<u64>,

    /// Retry interval for failed CSVs
    #[arg(long, env = "LIFECYCLE_REQUEUE_FAILED_SECS")]
    pub requeue_failed_secs: Option<u64>,

    /// Re-read-and-retry attempts after a write conflict
    #[arg(long, env = "LIFECYCLE_MAX_CONFLICT_RETRIES")]
    pub max_conflict_retries: Option<u32>,
}

impl ConfigArgs {
    /// Overlay the flags on the defaults and validate the result
    pub fn into_config(self) -> Result<OperatorConfig, Error> {
        let defaults = OperatorConfig::default();
        let secs = |value: Option<u64>, default: Duration| value.map(Duration::from_secs).unwrap_or(default);
        let namespace = self.watch_namespace.trim().to_string();
        let config = OperatorConfig {
            watch_namespace: (!namespace.is_empty()).then_some(namespace),
            field_manager: self.field_manager.unwrap_or(defaults.field_manager),
            reconcile_timeout: secs(self.reconcile_timeout_secs, defaults.reconcile_timeout),
            requeue_pending: secs(self.requeue_pending_secs, defaults.requeue_pending),
            requeue_succeeded: secs(self.requeue_succeeded_secs, defaults.requeue_succeeded),
            requeue_failed: secs(self.requeue_failed_secs, defaults.requeue_failed),
            max_conflict_retries: self.max_conflict_retries.unwrap_or(defaults.max_conflict_retries),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }
}
