//! Tidemark Operator - member reconciliation for DbCluster and MigrationCluster

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tidemark_common::crd::{DbCluster, MigrationCluster};
use tidemark_common::kube_utils::FIELD_MANAGER;
use tidemark_member::{error_policy, reconcile_db, reconcile_migration, Context, MemberConfig};

/// Tidemark - operator for distributed database and migration clusters
#[derive(Parser, Debug)]
#[command(name = "tidemark", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "TIDEMARK_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches DbCluster and MigrationCluster resources and converges their
    /// StatefulSets, services, claims and volumes.
    Controller(ControllerArgs),
}

#[derive(clap::Args, Debug)]
struct ControllerArgs {
    /// Replace unhealthy members automatically
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "TIDEMARK_AUTO_FAILOVER")]
    auto_failover: bool,

    /// Seconds between passes over a converged cluster
    #[arg(long, default_value_t = 30, env = "TIDEMARK_RESYNC_INTERVAL_SECS")]
    resync_interval_secs: u64,

    /// Resync intervals a pod may stay not-ready before scale-in ignores it
    #[arg(long, default_value_t = 5, env = "TIDEMARK_UNJOINED_GRACE_PERIODS")]
    unjoined_grace_periods: u32,

    /// Seconds a member must stay unhealthy before it is marked failed
    #[arg(long, default_value_t = 300, env = "TIDEMARK_FAILOVER_PERIOD_SECS")]
    failover_period_secs: u64,

    /// Default cap on failure members per component
    #[arg(long, default_value_t = 3, env = "TIDEMARK_MAX_FAILOVER_COUNT")]
    max_failover_count: i32,

    /// Whether the operator may read and patch PersistentVolumes
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "TIDEMARK_PV_ACCESS")]
    pv_access: bool,

    /// Request timeout for membership API calls, in seconds
    #[arg(long, default_value_t = 5, env = "TIDEMARK_MEMBERSHIP_TIMEOUT_SECS")]
    membership_timeout_secs: u64,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        let config = MemberConfig::default();
        Self {
            auto_failover: config.auto_failover,
            resync_interval_secs: config.resync_interval.as_secs(),
            unjoined_grace_periods: config.unjoined_grace_periods,
            failover_period_secs: config.failover_period.as_secs(),
            max_failover_count: config.max_failover_count,
            pv_access: config.pv_access,
            membership_timeout_secs: config.membership_timeout.as_secs(),
        }
    }
}

impl ControllerArgs {
    fn member_config(&self) -> MemberConfig {
        MemberConfig {
            auto_failover: self.auto_failover,
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            unjoined_grace_periods: self.unjoined_grace_periods,
            failover_period: Duration::from_secs(self.failover_period_secs),
            max_failover_count: self.max_failover_count,
            pv_access: self.pv_access,
            membership_timeout: Duration::from_secs(self.membership_timeout_secs),
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Membership clients and the kube client both need a process-wide provider.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if cli.crd {
        for crd in [DbCluster::crd(), MigrationCluster::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::default()).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

/// Ensure the tidemark CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply so
/// the schema always matches the running binary.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing DbCluster CRD...");
    crds.patch("dbclusters.tidemark.io", &params, &Patch::Apply(&DbCluster::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install DbCluster CRD: {}", e))?;

    tracing::info!("Installing MigrationCluster CRD...");
    crds.patch(
        "migrationclusters.tidemark.io",
        &params,
        &Patch::Apply(&MigrationCluster::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install MigrationCluster CRD: {}", e))?;

    tracing::info!("All tidemark CRDs installed/updated");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let config = args.member_config();
    tracing::info!(?config, "starting controllers");
    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(config)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build controller context: {}", e))?,
    );

    let db_controller = Controller::new(Api::<DbCluster>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<StatefulSet>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Service>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<ConfigMap>::all(client.clone()), WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile_db, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "DbCluster reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "DbCluster reconciliation error"),
            }
        });

    let migration_controller = Controller::new(
        Api::<MigrationCluster>::all(client.clone()),
        WatcherConfig::default(),
    )
    .owns(Api::<StatefulSet>::all(client.clone()), WatcherConfig::default())
    .owns(Api::<Service>::all(client.clone()), WatcherConfig::default())
    .owns(Api::<ConfigMap>::all(client), WatcherConfig::default())
    .shutdown_on_signal()
    .run(reconcile_migration, error_policy, ctx)
    .for_each(|result| async move {
        match result {
            Ok(action) => tracing::debug!(?action, "MigrationCluster reconciliation completed"),
            Err(e) => tracing::error!(error = ?e, "MigrationCluster reconciliation error"),
        }
    });

    tokio::join!(db_controller, migration_controller);
    tracing::info!("controllers stopped");
    Ok(())
}
