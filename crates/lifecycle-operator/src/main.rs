//! Lifecycle Operator - installs and upgrades operators from ClusterServiceVersions

use std::sync::Arc;

use clap::Parser;

use lifecycle_common::kube_utils::create_client;
use lifecycle_common::telemetry::{init_telemetry, TelemetryConfig};
use lifecycle_csv::Context;
use lifecycle_operator::cli::Cli;
use lifecycle_operator::{controller_runner, startup};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", startup::crd_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        json: !cli.text_logs,
        ..Default::default()
    })?;

    let config = cli.config.into_config()?;
    let client = create_client(cli.kubeconfig.as_deref()).await?;
    startup::ensure_crd_installed(&client, &config.field_manager).await?;

    let ctx = Arc::new(Context::builder(client.clone()).config(config).build());
    tracing::info!("Starting controllers:");
    controller_runner::build_csv_controller(client, ctx).await;

    tracing::info!("Controller stopped, shutting down");
    Ok(())
}
