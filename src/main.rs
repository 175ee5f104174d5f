use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hark_frontend::provision::{self, ProvisionEvent, ProvisionOutcome};
use hark_frontend::{
    Config, HttpDownloadRegistry, JsonFileStore, KeyValueStore, Locale, ModelProvisioningEngine,
};

/// Hark - spoken-input acquisition and matching engine
#[derive(Parser)]
#[command(name = "hark", version, about)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "HARK_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory override
    #[arg(long, env = "HARK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve the best supported model locale for the given tags
    Resolve {
        /// Requested locale tags, best first (e.g. "en-US" "fr")
        #[arg(required = true)]
        locales: Vec<String>,
    },
    /// Score an input string against a command pattern
    Match {
        /// Command pattern to score against
        pattern: String,
        /// Recognized or typed input
        input: String,
    },
    /// Download and extract the recognition model
    Download,
    /// Show model and download status
    Status,
    /// Delete the model and cancel any persisted download
    Delete,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "info,hark_frontend=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Command::Resolve { locales } => resolve(&config, &locales),
        Command::Match { pattern, input } => {
            score(&pattern, &input);
            Ok(())
        }
        Command::Download => download(&config).await,
        Command::Status => status(&config),
        Command::Delete => delete(&config).await,
    }
}

fn resolve(config: &Config, locales: &[String]) -> anyhow::Result<()> {
    let requested: Vec<Locale> = locales.iter().map(|tag| Locale::parse(tag)).collect();
    let supported: Vec<&str> = config.model.sources.keys().map(String::as_str).collect();

    let result = hark_frontend::resolve_supported_locale(&requested, &supported)?;
    println!("{} -> {}", result.resolved, result.supported_tag);
    Ok(())
}

fn score(pattern: &str, input: &str) {
    println!(
        "distance: {}",
        hark_frontend::matching::edit_distance(pattern, input)
    );
    println!(
        "closeness: {}",
        hark_frontend::matching::closeness_score(pattern, input)
    );
}

async fn download(config: &Config) -> anyhow::Result<()> {
    let registry = Arc::new(HttpDownloadRegistry::new());
    let store = Arc::new(JsonFileStore::open(config.store_path())?);
    let (engine, mut events) = ModelProvisioningEngine::new(registry, store, config);

    if engine.model_ready() {
        println!("model already in place at {}", engine.model_dir().display());
        return Ok(());
    }

    match engine.request_provisioning(true).await? {
        ProvisionOutcome::Ready => {
            println!("model already in place");
            return Ok(());
        }
        ProvisionOutcome::Started => println!("downloading model..."),
        ProvisionOutcome::AlreadyDownloading => println!("download already in flight, waiting..."),
        ProvisionOutcome::DownloadRequired => unreachable!("manual request never defers"),
    }

    match events.recv().await {
        Some(ProvisionEvent::ModelReady) => {
            println!("model ready at {}", engine.model_dir().display());
            Ok(())
        }
        Some(ProvisionEvent::Failed(e)) => Err(e.into()),
        None => anyhow::bail!("provisioning ended without a result"),
    }
}

fn status(config: &Config) -> anyhow::Result<()> {
    let marker = config.model_dir().join(&config.model.readiness_marker);
    if marker.exists() {
        println!("model: ready ({})", config.model_dir().display());
    } else {
        println!("model: not downloaded");
    }

    let store = JsonFileStore::open(config.store_path())?;
    match store.get(provision::HANDLE_KEY)? {
        Some(raw) => println!("download: in flight ({raw})"),
        None => println!("download: none"),
    }
    Ok(())
}

async fn delete(config: &Config) -> anyhow::Result<()> {
    let registry = HttpDownloadRegistry::new();
    let store = JsonFileStore::open(config.store_path())?;
    provision::delete_model(&registry, &store, &config.model_dir()).await?;
    println!("model deleted");
    Ok(())
}
