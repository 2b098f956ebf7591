//! llmops - control plane for LLM serving endpoints on Kubernetes

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use llmops_common::telemetry::{init_telemetry, TelemetryConfig};
use llmops_common::ServingConfig;
use llmops_serving::{
    CatalogModel, DeployEndpointRequest, EndpointService, Environment, KubeClusterClient,
    RedeployRequest,
};

mod state;

use state::LocalState;

/// llmops - deploy and operate LLM serving endpoints
#[derive(Parser, Debug)]
#[command(name = "llmops", version, about, long_about = None)]
struct Cli {
    /// Serving config (YAML); built-in defaults when omitted
    #[arg(long, global = true, env = "LLMOPS_CONFIG")]
    config: Option<PathBuf>,

    /// Kubeconfig to use instead of in-cluster credentials
    #[arg(long, global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// JSON file holding the model catalog and endpoint records
    #[arg(long, global = true, env = "LLMOPS_STATE", default_value = "llmops-state.json")]
    state: PathBuf,

    /// Human-readable logs instead of JSON lines
    #[arg(long, global = true)]
    text_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an endpoint from a JSON request file and deploy it
    Deploy {
        /// Deploy request (JSON)
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Replace an endpoint's workload, optionally with new settings
    Redeploy(RedeployArgs),
    /// Scale an endpoint's workload to zero
    Rollback {
        /// Endpoint id
        id: Uuid,
    },
    /// Delete an endpoint and everything it created in the cluster
    Delete {
        /// Endpoint id
        id: Uuid,
    },
    /// Print an endpoint, syncing its status when it changed
    Get {
        /// Endpoint id
        id: Uuid,
    },
    /// Re-observe an endpoint's workload and print the record
    Status {
        /// Endpoint id
        id: Uuid,
    },
    /// List endpoints
    List {
        /// Only this environment (dev, stg, prod)
        #[arg(short, long)]
        environment: Option<Environment>,
    },
    /// Synchronize the status of every endpoint once
    Sync,
    /// Register or replace catalog models from a JSON file (one model or an array)
    RegisterModel {
        /// Model definitions (JSON)
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Print the effective serving config as YAML
    Config,
}

#[derive(Args, Debug)]
struct RedeployArgs {
    /// Endpoint id
    id: Uuid,

    /// Redeploy request (JSON); flags below override its fields
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Runtime image
    #[arg(long)]
    image: Option<String>,

    /// Run on GPU (true/false)
    #[arg(long)]
    use_gpu: Option<bool>,

    /// Minimum replicas
    #[arg(long)]
    min_replicas: Option<i32>,

    /// Maximum replicas
    #[arg(long)]
    max_replicas: Option<i32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        json: !cli.text_logs,
        ..TelemetryConfig::default()
    })?;

    let mut config = match &cli.config {
        Some(path) => ServingConfig::from_file(path)?,
        None => ServingConfig::default(),
    };
    if cli.kubeconfig.is_some() {
        config.kube.kubeconfig = cli.kubeconfig.clone();
    }

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
        Commands::RegisterModel { file } => register_models(&cli.state, &file).await,
        command => run_command(command, config, &cli.state).await,
    }
}

/// Run a command that needs the cluster, saving state whether or not it succeeds
async fn run_command(
    command: Commands,
    config: ServingConfig,
    state_path: &Path,
) -> anyhow::Result<()> {
    let state = LocalState::load(state_path).await?;
    let config = Arc::new(config);
    let cluster = KubeClusterClient::connect(&config).await?;
    let service = EndpointService::new(
        config,
        Arc::new(cluster),
        state.catalog(),
        state.repository(),
    );

    let result = dispatch(&service, command).await;
    state.save().await?;
    result
}

async fn dispatch(service: &EndpointService, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Deploy { file } => {
            let request: DeployEndpointRequest = read_json(&file).await?;
            print_json(&service.deploy_endpoint(request).await?)
        }
        Commands::Redeploy(args) => {
            let id = args.id;
            let request = redeploy_request(args).await?;
            print_json(&service.redeploy_endpoint(id, request).await?)
        }
        Commands::Rollback { id } => print_json(&service.rollback_endpoint(id).await?),
        Commands::Delete { id } => {
            service.delete_endpoint(id).await?;
            println!("deleted {id}");
            Ok(())
        }
        Commands::Get { id } => print_json(&service.get_endpoint(id).await?),
        Commands::Status { id } => print_json(&service.refresh_endpoint_status(id).await?),
        Commands::List { environment } => print_json(&service.list_endpoints(environment).await?),
        Commands::Sync => print_json(&service.sync_all().await?),
        Commands::Config | Commands::RegisterModel { .. } => {
            Err(anyhow::anyhow!("command does not use the cluster"))
        }
    }
}

async fn redeploy_request(args: RedeployArgs) -> anyhow::Result<RedeployRequest> {
    let mut request = match &args.file {
        Some(path) => read_json(path).await?,
        None => RedeployRequest::default(),
    };
    if args.image.is_some() {
        request.runtime_image = args.image;
    }
    if args.use_gpu.is_some() {
        request.use_gpu = args.use_gpu;
    }
    if args.min_replicas.is_some() {
        request.min_replicas = args.min_replicas;
    }
    if args.max_replicas.is_some() {
        request.max_replicas = args.max_replicas;
    }
    Ok(request)
}

async fn register_models(state_path: &Path, file: &Path) -> anyhow::Result<()> {
    let value: serde_json::Value = read_json(file).await?;
    let models: Vec<CatalogModel> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        single => vec![serde_json::from_value(single)?],
    };

    let mut state = LocalState::load(state_path).await?;
    for model in models {
        tracing::info!(model = %model.id, status = ?model.status, "registering model");
        state.register_model(model);
    }
    state.save().await?;
    println!("{} models in catalog", state.models().len());
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", path, e))?;
    serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("Failed to parse {:?}: {}", path, e))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
