//! KServe operator - LLMInferenceService and LocalModel controller manager

mod controllers;
mod leader_election;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use kube::Client;

use kserve_common::config::KubeConfigMapReader;
use kserve_common::crd::all_crds_yaml;
use kserve_common::kserve_namespace;
use kserve_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use kserve_llmisvc::config_merge::WellKnownConfigs;
use kserve_llmisvc::webhook::{
    webhook_routes as llm_webhook_routes, LLMInferenceServiceConfigValidator,
    LLMInferenceServiceValidator, LlmWebhookState,
};
use kserve_localmodel::webhook::{
    webhook_routes as local_model_webhook_routes, LocalModelReaderImpl, LocalModelWebhookState,
};

use controllers::{build_llmisvc_controllers, build_localmodelnode_controllers, ReconcileMetrics};
use leader_election::LeaderElector;

/// KServe controller manager
#[derive(Parser, Debug)]
#[command(name = "kserve-operator", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    manager: ManagerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// Run the LLMInferenceService controller and its webhooks
    Llmisvc,
    /// Run the LocalModelNodeGroup controller and the LocalModel cache webhooks
    Localmodelnode,
}

impl Commands {
    fn service_name(self) -> &'static str {
        match self {
            Commands::Llmisvc => "kserve-llmisvc-controller",
            Commands::Localmodelnode => "kserve-localmodelnode-controller",
        }
    }

    fn lease_name(self) -> &'static str {
        match self {
            Commands::Llmisvc => "llminferenceservice-kserve-controller-manager",
            Commands::Localmodelnode => "localmodelnode-kserve-controller-manager",
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormatArg {
    Json,
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct ManagerArgs {
    /// Log line encoding
    #[arg(long, global = true, value_enum, default_value = "json")]
    log_format: LogFormatArg,

    /// Metrics listen address, `0` disables the endpoint
    #[arg(long, global = true, default_value = "0")]
    metrics_addr: String,

    /// Port of the TLS webhook server
    #[arg(long, global = true, default_value_t = 9443)]
    webhook_port: u16,

    /// Only run reconcilers while holding the leader lease
    #[arg(long, global = true)]
    leader_elect: bool,

    /// Health probe listen address
    #[arg(long, global = true, default_value = ":8081")]
    health_probe_addr: String,

    /// Serve metrics over TLS with the webhook certificate
    #[arg(long, global = true)]
    metrics_secure: bool,

    /// Negotiate HTTP/2 on the TLS listeners
    #[arg(long, global = true)]
    enable_http2: bool,

    /// Directory holding tls.crt and tls.key
    #[arg(long, global = true, env = "WEBHOOK_CERT_DIR", default_value = "/tmp/k8s-webhook-server/serving-certs")]
    cert_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", all_crds_yaml().context("failed to render CRDs")?);
        return Ok(());
    }

    let Some(command) = cli.command else {
        anyhow::bail!("a subcommand is required: llmisvc or localmodelnode");
    };

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install the aws-lc-rs crypto provider"))?;

    let telemetry = TelemetryConfig {
        log_format: cli.manager.log_format.into(),
        ..TelemetryConfig::for_service(command.service_name())
    };
    init_telemetry(telemetry)?;

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    run(command, cli.manager, client).await
}

/// `0` turns the metrics listener off
fn metrics_enabled(addr: &str) -> bool {
    addr != "0"
}

async fn run(command: Commands, args: ManagerArgs, client: Client) -> anyhow::Result<()> {
    let namespace = kserve_namespace();
    let metrics = Arc::new(ReconcileMetrics::default());

    let webhooks: Router = match command {
        Commands::Llmisvc => llm_webhook_routes(Arc::new(LlmWebhookState {
            service: LLMInferenceServiceValidator,
            config: LLMInferenceServiceConfigValidator::new(
                Arc::new(KubeConfigMapReader::new(client.clone(), namespace.clone())),
                WellKnownConfigs::default(),
                namespace.clone(),
            ),
        })),
        Commands::Localmodelnode => local_model_webhook_routes(Arc::new(LocalModelWebhookState::new(
            Arc::new(LocalModelReaderImpl::new(client.clone())),
        ))),
    };

    let tls = server::tls_config(&args.cert_dir, args.enable_http2)?;
    let webhook_addr = server::parse_bind_addr(&format!(":{}", args.webhook_port))?;
    let health_addr = server::parse_bind_addr(&args.health_probe_addr)?;

    let webhook_server = tokio::spawn(server::serve_webhooks(webhook_addr, tls.clone(), webhooks));
    let health_server = tokio::spawn(server::serve_health(health_addr));
    let metrics_server = if metrics_enabled(&args.metrics_addr) {
        let metrics_addr = server::parse_bind_addr(&args.metrics_addr)?;
        let metrics_tls = args.metrics_secure.then(|| tls.clone());
        Some(tokio::spawn(server::serve_metrics(metrics_addr, metrics_tls, metrics.clone())))
    } else {
        None
    };

    let mut leadership = if args.leader_elect {
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("kserve-operator-{}", std::process::id()));
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            command.lease_name(),
            &namespace,
            &identity,
        ));
        Some(elector.acquire().await)
    } else {
        None
    };

    tracing::info!(namespace = %namespace, "starting controllers");
    let controllers = match command {
        Commands::Llmisvc => build_llmisvc_controllers(client, &namespace, metrics),
        Commands::Localmodelnode => build_localmodelnode_controllers(client, &namespace, metrics),
    };

    let lost = async {
        match leadership.as_mut() {
            Some(guard) => guard.lost().await,
            None => std::future::pending().await,
        }
    };

    let metrics_exit = async {
        match metrics_server {
            Some(task) => task.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = join_all(controllers) => {
            tracing::info!("controllers stopped");
        }
        _ = lost => {
            anyhow::bail!("leader lease lost");
        }
        result = webhook_server => {
            result.context("webhook server task panicked")??;
        }
        result = health_server => {
            result.context("health probe server task panicked")??;
        }
        result = metrics_exit => {
            result.context("metrics server task panicked")??;
        }
    }

    if let Some(guard) = leadership {
        if let Err(e) = guard.release().await {
            tracing::warn!(error = %e, "failed to release leader lease");
        }
    }

    tracing::info!("kserve operator shutting down");
    Ok(())
}
