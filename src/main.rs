// ============================================================================
// DBINTEL - COMMAND LINE INTERFACE
// ============================================================================
// Runs the pipeline over NDJSON telemetry (a file or stdin) and writes the
// verified records as NDJSON to stdout. Logs go to stderr.
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info, warn};

use dbintel_engine::logging::init_logging;
use dbintel_engine::{
    Engine, EngineConfig, Exporter, JsonLinesExporter, NullExporter, PipelineError, PipelineHandle,
    TelemetryRecord, ENGINE_FULL_NAME, ENGINE_NAME, ENGINE_VERSION,
};

// ----------------------------------------------------------------------------
// CLI Argument Parser
// ----------------------------------------------------------------------------

/// DbIntel CLI
#[derive(Parser, Debug)]
#[command(
    name = "dbintel",
    author = "Database Intelligence Team",
    version,
    about = "Admission-control and correlation pipeline for database telemetry",
    long_about = "Correlates session, query-statistics and kernel samples into one record per \
                  database event, extracts plan attributes, bounds ingest cost and adapts \
                  sampling to backend feedback before export."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "dbintel.toml", env = "DBINTEL_CONFIG", global = true)]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "DBINTEL_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "DBINTEL_DEBUG", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline over NDJSON telemetry records
    Run {
        /// Input file, `-` for stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Process everything but discard the output
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = match EngineConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("❌ Configuration validation failed!");
            return Err(e).with_context(|| format!("invalid configuration in {}", config_path.display()));
        }
    };
    println!("✅ Configuration is valid!");

    if verbose {
        println!("\n📋 Parsed configuration:");
        println!("{}", "=".repeat(60));
        println!("{}", toml::to_string_pretty(&config).context("failed to serialize configuration")?);
    }

    println!("\n📊 Configuration Summary:");
    println!("  • Queue capacity: {}", config.pipeline.queue_capacity);
    println!("  • Export workers: {}", config.pipeline.export_workers);
    println!(
        "  • Correlation bucket: {} (grace {})",
        humantime::format_duration(config.correlator.bucket_width),
        humantime::format_duration(config.correlator.grace_period)
    );
    println!("  • Cost dimensions:");
    for dim in &config.cost.dimensions {
        println!("    - {} (capacity {})", dim.name, dim.capacity);
    }
    println!("  • Breaker open policy: {:?}", config.breaker.open_policy);
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = EngineConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, &config_str).with_context(|| format!("failed to write {}", path.display()))?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Crate: {}", ENGINE_NAME);
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Stages:");
    println!("  • Cross-source correlation");
    println!("  • Plan attribute extraction");
    println!("  • Cost control gate");
    println!("  • Adaptive sampling");
    println!("  • Verification and quarantine");
    println!("  • Per-target circuit breaking");
}

/// Feed NDJSON lines into the pipeline until EOF or shutdown.
async fn feed<R: AsyncRead + Unpin>(handle: &PipelineHandle, reader: R) -> AnyhowResult<(u64, u64)> {
    let mut lines = BufReader::new(reader).lines();
    let mut accepted = 0u64;
    let mut refused = 0u64;
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await.context("failed to read input")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: TelemetryRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed input line");
                refused += 1;
                continue;
            }
        };
        match handle.admit(record).await {
            Ok(()) => accepted += 1,
            Err(PipelineError::ShuttingDown) => break,
            Err(e) => {
                debug!(line = line_no, category = e.category(), error = %e, "Record refused");
                refused += 1;
            }
        }
    }
    Ok((accepted, refused))
}

async fn run(config: EngineConfig, input: &str, dry_run: bool) -> AnyhowResult<()> {
    let exporter: Arc<dyn Exporter> = if dry_run {
        Arc::new(NullExporter::new())
    } else {
        Arc::new(JsonLinesExporter::stdout())
    };
    info!(exporter = exporter.name(), input, "Starting pipeline");

    let (handle, task) = Engine::start(config, exporter).context("failed to start pipeline")?;

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_handle.shutdown();
        }
    });

    let fed = if input == "-" {
        feed(&handle, tokio::io::stdin()).await
    } else {
        let file = tokio::fs::File::open(input)
            .await
            .with_context(|| format!("failed to open input {}", input))?;
        feed(&handle, file).await
    };
    handle.shutdown();

    let snapshot = task.join().await.context("pipeline stopped with errors")?;
    let (accepted, refused) = fed?;
    info!(accepted, refused, "Input finished");
    eprintln!(
        "{}",
        serde_json::to_string_pretty(&snapshot.values).context("failed to serialize metrics")?
    );
    Ok(())
}

// ----------------------------------------------------------------------------
// Main Entry Point
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        _ => {}
    }

    let config_missing = !cli.config.exists();
    let config = if config_missing {
        EngineConfig::from_env().context("failed to load config from environment")?
    } else {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("failed to load config from {}", cli.config.display()))?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    if config_missing {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }

    match cli.command {
        Some(Commands::Run { input, dry_run }) => run(config, &input, dry_run).await,
        None => run(config, "-", false).await,
        Some(_) => Ok(()),
    }
}
