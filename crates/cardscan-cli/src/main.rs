use anyhow::{bail, Context, Result};
use cardscan_runtime::{
    FullFrameDetector, HealthMonitor, HttpHealthProbe, HttpIdentifier, JsonlScanStore,
    OfflineQueue, ResilienceOrchestrator, RuntimeConfig, ScanPipeline, ScanRequest,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "cardscan", version, about = "Scan trading card images through the resilience layer")]
struct Cli {
    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan one image and print the result as JSON
    Scan(ScanArgs),

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Inspect the offline queue
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
}

#[derive(Debug, clap::Args)]
struct ScanArgs {
    /// Image file to scan
    image: PathBuf,

    /// Identification endpoint
    #[arg(long, env = "CARDSCAN_ENDPOINT", value_name = "URL")]
    endpoint: String,

    /// Health endpoint probed before scanning
    #[arg(long, env = "CARDSCAN_HEALTH_URL", value_name = "URL")]
    health_url: Option<String>,

    /// Configuration file (YAML or JSON)
    #[arg(long, short, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Content type; guessed from the file extension when omitted
    #[arg(long, value_name = "TYPE")]
    content_type: Option<String>,

    /// Scan analytics output
    #[arg(long, value_name = "PATH", default_value = "scans.jsonl")]
    store: PathBuf,

    /// How many times this scan was already retried
    #[arg(long, default_value_t = 0)]
    retry_count: u32,

    /// Print the resilience status after the scan
    #[arg(long)]
    status: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the default configuration as YAML
    Print,

    /// Validate a configuration file
    Check { path: PathBuf },
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    /// List actions stored in a queue snapshot
    Show {
        /// Snapshot file; defaults to the path in --config
        path: Option<PathBuf>,

        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Scan(args) => scan(args).await,
        Command::Config { command } => match command {
            ConfigCommand::Print => {
                let yaml = RuntimeConfig::default()
                    .to_yaml()
                    .context("Failed to render default configuration")?;
                print!("{}", yaml);
                Ok(())
            }
            ConfigCommand::Check { path } => {
                let config = load_config(Some(&path))?;
                println!(
                    "{}: ok ({} dependency override(s), offline queue {})",
                    path.display(),
                    config.resilience.dependencies.len(),
                    config
                        .resilience
                        .offline_queue
                        .path
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "in memory".to_string())
                );
                Ok(())
            }
        },
        Command::Queue { command } => match command {
            QueueCommand::Show { path, config } => {
                let path = match path {
                    Some(path) => path,
                    None => load_config(config.as_deref())?
                        .resilience
                        .offline_queue
                        .path
                        .context("No queue path given and none configured")?,
                };
                let actions = OfflineQueue::load(&path)
                    .await
                    .with_context(|| format!("Failed to read queue snapshot {}", path.display()))?;
                println!("{}", serde_json::to_string_pretty(&actions)?);
                Ok(())
            }
        },
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

async fn scan(args: ScanArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;

    let image = tokio::fs::read(&args.image)
        .await
        .with_context(|| format!("Failed to read {}", args.image.display()))?;
    let content_type = match args.content_type {
        Some(content_type) => content_type,
        None => guess_content_type(&args.image)?.to_string(),
    };

    let orchestrator = Arc::new(
        ResilienceOrchestrator::open(config.resilience.clone())
            .await
            .context("Failed to open offline queue")?,
    );

    let identifier = HttpIdentifier::new(&args.endpoint, identify_timeout(&config))
        .context("Failed to build identification client")?;
    let store = Arc::new(JsonlScanStore::new(&args.store));

    let pipeline = ScanPipeline::new(
        Arc::clone(&orchestrator),
        Arc::new(FullFrameDetector),
        Arc::new(identifier),
        store,
        &config,
    );

    if let Some(url) = &args.health_url {
        let probe = HttpHealthProbe::new(url, config.resilience.health.probe_timeout)
            .context("Failed to build health probe client")?;
        let monitor = HealthMonitor::new(
            Arc::clone(&orchestrator),
            Arc::new(probe),
            Arc::new(pipeline.replayer()),
            config.resilience.health.clone(),
        );
        let report = monitor.tick().await;
        tracing::info!(status = %report.status, "Probed connectivity");
    }

    let request = ScanRequest::new(&image, &content_type)
        .with_content_length(image.len() as u64)
        .with_retry_count(args.retry_count);
    let result = match pipeline.run_request(request).await {
        Ok(result) => result,
        Err(e) => bail!("Upload rejected ({} {}): {}", e.status_code(), e.code(), e),
    };
    pipeline.flush().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if args.status {
        println!("{}", serde_json::to_string_pretty(&pipeline.status())?);
    }
    Ok(())
}

/// Client-side timeout for identification: the configured attempt timeout.
fn identify_timeout(config: &RuntimeConfig) -> std::time::Duration {
    config
        .resilience
        .retry_for(cardscan_runtime::ML_IDENTIFICATION)
        .attempt_timeout
        .unwrap_or(std::time::Duration::from_secs(30))
}

fn guess_content_type(path: &Path) -> Result<&'static str> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => Ok("image/jpeg"),
        Some("png") => Ok("image/png"),
        Some("webp") => Ok("image/webp"),
        Some("gif") => Ok("image/gif"),
        _ => bail!(
            "Cannot guess the content type of {}; pass --content-type",
            path.display()
        ),
    }
}
