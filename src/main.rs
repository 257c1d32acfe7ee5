use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sitegrab::config::{BackendConfig, ServiceConfig};
use sitegrab::scheduler::SystemResolver;
use sitegrab::server::Server;
use sitegrab::shutdown::install_shutdown_handler;
use sitegrab::worker::backend::verify_images;
use sitegrab::worker::Backends;

#[derive(Parser, Debug)]
#[command(name = "sitegrab")]
#[command(version)]
#[command(about = "Queue URL captures and package them into downloadable archives")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the capture service
    Serve(ServeArgs),

    /// Verify that the capture images are available and exit
    Check(BackendArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to listen on for HTTP
    #[arg(long, default_value = "127.0.0.1:12810")]
    listen_addr: SocketAddr,

    /// Maximum number of waiting jobs
    #[arg(long, default_value = "10")]
    max_queue: usize,

    /// Seconds a failed job stays visible after it finished
    #[arg(long, default_value = "5")]
    failed_retention_secs: u64,

    /// Seconds a finished job stays downloadable
    #[arg(long, default_value = "60")]
    finished_retention_secs: u64,

    /// Directory for artifacts and working directories (default: <tmp>/sitegrab)
    #[arg(long)]
    work_root: Option<PathBuf>,

    /// Skip the docker image check on startup
    #[arg(long)]
    skip_image_check: bool,

    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Parser, Debug)]
struct BackendArgs {
    /// Docker CLI binary
    #[arg(long, default_value = "docker")]
    docker_bin: String,

    /// Image performing the browser save
    #[arg(long, default_value = "gts-browser")]
    browser_image: String,

    /// Image rendering screenshots
    #[arg(long, default_value = "gts-pageres")]
    screenshot_image: String,

    /// Screenshot resolution
    #[arg(long, default_value = "1920x1080")]
    resolution: String,

    /// Abort a single capture after this many seconds (default: no limit)
    #[arg(long)]
    action_timeout_secs: Option<u64>,
}

impl From<BackendArgs> for BackendConfig {
    fn from(args: BackendArgs) -> Self {
        Self {
            docker_bin: args.docker_bin,
            browser_image: args.browser_image,
            screenshot_image: args.screenshot_image,
            resolution: args.resolution,
            timeout: args.action_timeout_secs.map(Duration::from_secs),
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let backend = BackendConfig::from(args.backend);
    if args.skip_image_check {
        tracing::warn!("Skipping capture image check");
    } else {
        verify_images(&backend).await?;
    }

    let mut config = ServiceConfig {
        listen_addr: args.listen_addr,
        max_queue: args.max_queue,
        ..ServiceConfig::default()
    }
    .with_retention(args.failed_retention_secs, args.finished_retention_secs)
    .with_backend(backend);
    if let Some(work_root) = args.work_root {
        config.work_root = work_root;
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        max_queue = config.max_queue,
        failed_retention_secs = config.failed_retention_secs,
        finished_retention_secs = config.finished_retention_secs,
        work_root = %config.work_root.display(),
        action_timeout = ?config.backend.timeout,
        "Starting sitegrab"
    );

    let backends = Backends::docker(&config.backend);
    let shutdown = install_shutdown_handler()?;
    let server = Server::new(config, backends, Arc::new(SystemResolver));
    server.run(shutdown).await?;

    Ok(())
}

async fn run_check(args: BackendArgs) -> Result<(), Box<dyn std::error::Error>> {
    let backend = BackendConfig::from(args);
    verify_images(&backend).await?;
    println!("Capture images available");
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_server(serve_args).await?,
        Commands::Check(backend_args) => run_check(backend_args).await?,
    }

    Ok(())
}
