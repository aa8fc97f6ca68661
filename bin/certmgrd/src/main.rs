//! ---
//! certmgr_section: "01-core-functionality"
//! certmgr_subsection: "binary"
//! certmgr_type: "source"
//! certmgr_scope: "code"
//! certmgr_description: "Binary entrypoint for the certmgr daemon."
//! certmgr_version: "v0.1.0"
//! certmgr_owner: "platform"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use certmgr_api::{spawn_api_server, ApiServer, ApiState};
use certmgr_common::{init_tracing, AppConfig};
use certmgr_core::{
    CertInstaller, CertRequester, InMemoryResourceManager, KubeResourceManager, ResourceManager,
};
use certmgr_metrics::{new_registry, spawn_http_server, MetricsServer, RequesterMetrics};
use certmgr_msg::{InMemoryBus, MessageBus};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info, warn};
use uuid::Uuid;

const CONFIG_CANDIDATES: [&str; 2] = ["configs/certmgr.toml", "/etc/certmgr/certmgr.toml"];

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Cluster TLS certificate provisioning controller",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        env = "CERTMGR_CLUSTER_ID",
        value_name = "UUID",
        help = "Identity of the cluster certificates are requested for"
    )]
    cluster_id: Option<Uuid>,

    #[arg(long, value_name = "NS", help = "Namespace holding the secret and serving service")]
    namespace: Option<String>,

    #[arg(
        long,
        value_enum,
        default_value_t = Backend::Kubernetes,
        help = "Where certificates are installed"
    )]
    resources: Backend,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Kubernetes,
    InMemory,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the certificate requester")]
    Run,
    #[command(about = "Validate the configuration and print the effective settings")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, source) = resolve_config(&cli)?;

    match cli.command.as_ref().unwrap_or(&Commands::Run) {
        Commands::Run => {
            init_tracing("certmgrd", &config.logging)?;
            match &source {
                Some(path) => info!(config_path = %path.display(), "configuration loaded"),
                None => warn!("no configuration file found; using defaults"),
            }
            run_daemon(config, cli.resources).await?
        }
        Commands::CheckConfig => {
            config.require_cluster_id()?;
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            if let Some(path) = &source {
                println!("# loaded from {}", path.display());
            }
            println!("{rendered}");
        }
    }

    Ok(())
}

/// Load the configuration file (if any) and apply command line overrides.
///
/// `--config` must point at a readable file; otherwise `CERTMGR_CONFIG` and the
/// default locations are tried, falling back to built-in defaults.
fn resolve_config(cli: &Cli) -> Result<(AppConfig, Option<PathBuf>)> {
    let (mut config, source) = if let Some(path) = &cli.config {
        (AppConfig::from_path(path)?, Some(path.clone()))
    } else {
        let candidates: Vec<PathBuf> = CONFIG_CANDIDATES.iter().map(PathBuf::from).collect();
        let from_env = std::env::var_os(AppConfig::ENV_CONFIG_PATH).is_some();
        if from_env || candidates.iter().any(|path| path.exists()) {
            let loaded = AppConfig::load_with_source(&candidates)?;
            (loaded.config, Some(loaded.source))
        } else {
            (AppConfig::default(), None)
        }
    };

    if let Some(cluster_id) = cli.cluster_id {
        config.cluster_id = Some(cluster_id);
    }
    if let Some(namespace) = &cli.namespace {
        config.install.namespace = namespace.clone();
    }
    config.validate()?;
    Ok((config, source))
}

async fn run_daemon(config: AppConfig, backend: Backend) -> Result<()> {
    let cluster_id = config.require_cluster_id()?;

    let registry = new_registry();
    let metrics = RequesterMetrics::new(registry.clone())?;
    let metrics_server: Option<MetricsServer> = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry, config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let resources: Arc<dyn ResourceManager> = match backend {
        Backend::Kubernetes => Arc::new(
            KubeResourceManager::try_default(config.install.namespace.clone())
                .await
                .context("failed to create kubernetes client")?,
        ),
        Backend::InMemory => {
            warn!("using in-memory resources; certificates will not reach the cluster");
            Arc::new(InMemoryResourceManager::new())
        }
    };
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::with_capacity(config.bus.capacity));
    let installer = CertInstaller::new(resources, &config.install);

    let mut requester = CertRequester::new(
        cluster_id,
        bus.clone(),
        installer.clone(),
        &config.bus,
        &config.requester,
    )
    .with_metrics(metrics)
    .spawn();

    let mut api_server: Option<ApiServer> = None;
    if config.api.enabled {
        let state = Arc::new(
            ApiState::new(installer, bus.clone()).with_status(requester.subscribe_status()),
        );
        match spawn_api_server(state, config.api.listen) {
            Ok(server) => {
                info!(address = %server.addr(), "api server listening");
                api_server = Some(server);
            }
            Err(err) => {
                warn!(error = %err, "failed to start api server");
            }
        }
    } else {
        info!("api server disabled by configuration");
    }

    info!(%cluster_id, namespace = %config.install.namespace, "daemon running; waiting for termination signal");
    let outcome = tokio::select! {
        finished = requester.wait() => finished,
        received = shutdown_signal() => {
            received?;
            info!("termination signal received; shutting down");
            requester.stop().await
        }
    };

    if let Some(server) = api_server {
        server.shutdown().await?;
    }
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    if let Err(err) = &outcome {
        error!(error = %err, "certificate requester failed; exiting");
    }
    outcome.map_err(Into::into)
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            received = signal::ctrl_c() => received.context("failed to listen for ctrl-c")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    Ok(())
}
