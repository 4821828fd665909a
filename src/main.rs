use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use kube::api::Api;
use storage_client_operator::config::{
    DEFAULT_CONSOLE_DEPLOYMENT, DEFAULT_CONSOLE_PORT, DEFAULT_CSI_DRIVER_IMAGE,
    DEFAULT_OPERATOR_DEPLOYMENT,
};
use storage_client_operator::controller::{self, resolve_deploy_flag, OperatorConfig};
use storage_client_operator::crd::{ClusterVersion, CLUSTER_VERSION_NAME};
use storage_client_operator::leader::{self, LeaseLock};
use storage_client_operator::store::KubeStore;
use storage_client_operator::{telemetry, Error, OperatorSettings};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show the resolved CSI deployment decision and platform version
    Info(InfoArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Operator namespace
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    namespace: String,

    /// Name of the operator's own Deployment
    #[arg(long, env = "OPERATOR_DEPLOYMENT_NAME", default_value = DEFAULT_OPERATOR_DEPLOYMENT)]
    operator_deployment: String,

    /// Name of the console Deployment serving the plugin
    #[arg(long, env = "CONSOLE_DEPLOYMENT_NAME", default_value = DEFAULT_CONSOLE_DEPLOYMENT)]
    console_deployment: String,

    /// Port the console plugin is served on
    #[arg(long, env = "CONSOLE_PORT", default_value_t = DEFAULT_CONSOLE_PORT)]
    console_port: u16,

    /// Ceph CSI driver image
    #[arg(long, env = "CSI_DRIVER_IMAGE", default_value = DEFAULT_CSI_DRIVER_IMAGE)]
    csi_driver_image: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// OTLP collector endpoint; trace export is disabled when unset
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

impl RunArgs {
    fn settings(&self) -> OperatorSettings {
        OperatorSettings {
            namespace: self.namespace.clone(),
            operator_deployment: self.operator_deployment.clone(),
            console_deployment: self.console_deployment.clone(),
            console_port: self.console_port,
            csi_driver_image: self.csi_driver_image.clone(),
        }
    }
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Operator namespace
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("storage-client-operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    let store = KubeStore::new(client.clone());

    let config = OperatorConfig::load(&store, &args.namespace).await?;
    let deploy_csi = resolve_deploy_flag(&config, &store).await?;

    let versions: Api<ClusterVersion> = Api::all(client);
    let version = versions
        .get_opt(CLUSTER_VERSION_NAME)
        .await
        .map_err(Error::KubeError)?;
    let desired = version
        .as_ref()
        .and_then(|cv| cv.desired_version())
        .unwrap_or("unknown");

    println!("Platform version: {}", desired);
    println!("Deploy CSI: {}", deploy_csi);
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let json = matches!(args.log_format, LogFormat::Json);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| fmt::layer().json().with_target(true)))
        .with((!json).then(|| fmt::layer().with_target(true)));

    // Only enable OTEL if an endpoint is provided
    match args.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let otel_layer = telemetry::init_telemetry(&registry, endpoint)?;
            registry.with(otel_layer).init();
            info!("OpenTelemetry tracing initialized, exporting to {}", endpoint);
        }
        None => {
            registry.init();
            info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
        }
    }

    info!(
        "Starting storage-client-operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let settings = args.settings();

    // Leader election configuration
    let holder_identity = leader::holder_identity()?;
    info!("Leader election using holder ID: {}", holder_identity);

    let is_leader = Arc::new(AtomicBool::new(false));
    let lock = LeaseLock::new(client.clone(), &settings.namespace, &holder_identity);
    tokio::spawn(lock.run(Arc::clone(&is_leader)));

    let state = Arc::new(controller::ControllerState {
        client,
        settings,
        is_leader,
    });

    // Run the main controller loop
    let result = controller::run_controller(state).await;

    // Flush any remaining traces
    telemetry::shutdown_telemetry();

    result
}
