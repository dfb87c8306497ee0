use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::CommandFactory;
use clap_complete::{generate, Shell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use crate::classifier::Classifier;
use crate::cli::Cli;
use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use crate::pipeline::{JobContext, Orchestrator};
use crate::retry::{retry, RetryPolicy};
use crate::source::{Credentials, RedditClient};
use crate::storage::{RetentionPolicy, Stores};
use crate::throttle::{GatedSource, ThrottleGate};

/// Write a default configuration file
pub async fn init(
    config_file: &Path,
    collection: Option<String>,
    destination: Option<String>,
    force: bool,
) -> Result<()> {
    info!("Initializing configuration at {}", config_file.display());

    if config_file.exists() && !force {
        warn!("Configuration file already exists: {}", config_file.display());
        println!("Configuration already exists at {}", config_file.display());
        println!("Use --force to overwrite it.");
        return Ok(());
    }

    if let Some(parent) = config_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let content = create_default_config(
        collection.as_deref().unwrap_or_default(),
        destination.as_deref().unwrap_or_default(),
    );
    fs::write(config_file, content)?;
    info!("Created default configuration: {}", config_file.display());

    println!("✅ repost-guard initialized");
    println!("   Config file: {}", config_file.display());
    println!();
    println!("Next steps:");
    println!("   1. Set source.collection and source.destination in the config file");
    println!("   2. Put your script-app credentials into password.json");
    println!("      {{ \"appid\": \"...\", \"appsecret\": \"...\", \"username\": \"...\", \"password\": \"...\" }}");
    println!("   3. Start the worker: repost-guard run");

    Ok(())
}

/// Start the worker and keep it running until Ctrl-C
pub async fn run(config_file: &Path, once: bool) -> Result<()> {
    let config = load_config(config_file)?;

    let credentials_file = resolve_relative(config_file, &config.source.credentials_file);
    let credentials = Credentials::load(&credentials_file)?;
    debug!(?credentials, "Loaded credentials");

    let retry_policy = RetryPolicy::from_settings(&config.retry);
    let client = Arc::new(RedditClient::new(credentials, &config.source)?);
    retry(&retry_policy, "login", || client.login()).await?;

    let gate = Arc::new(ThrottleGate::from_settings(&config.throttle));
    let ctx = JobContext {
        source: GatedSource::new(client, gate),
        stores: open_stores(&config)?,
        classifier: Classifier::from_settings(&config.classifier)?,
        retry: retry_policy,
        destination: config.source.destination.clone(),
        approve_delay: config.pipeline.approve_delay(),
    };
    let orchestrator = Orchestrator::new(ctx, config.source.collection.clone(), &config.pipeline);

    if once {
        let report = orchestrator.run_cycle().await?;
        println!("📊 Cycle report");
        println!("   Fetched:      {}", report.fetched);
        println!("   New:          {}", report.processed);
        println!("   Dispatched:   {}", report.dispatched);
        println!("   Forwarded:    {} ({} approved)", report.forwarded, report.approved);
        println!("   Disqualified: {}", report.disqualified);
        println!("   Failed:       {}", report.failed);
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested; finishing current cycle");
            signal_token.cancel();
        }
    });

    orchestrator.run(shutdown).await
}

/// Show configuration and store sizes
pub async fn status(config_file: &Path) -> Result<()> {
    println!("📊 repost-guard status");
    println!("======================");

    if !config_file.exists() {
        println!("❌ Configuration: Not initialized");
        println!("   Run 'repost-guard init' to create one");
        return Ok(());
    }

    let config = load_config(config_file)?;
    println!("✅ Configuration: {}", config_file.display());
    println!("   Watching:    {}", config.source.collection);
    println!("   Forwarding:  {}", config.source.destination);
    println!("   Concurrency: {}", config.pipeline.max_concurrent_jobs);

    let credentials_file = resolve_relative(config_file, &config.source.credentials_file);
    if credentials_file.exists() {
        println!("✅ Credentials: {}", credentials_file.display());
    } else {
        println!("❌ Credentials: {} not found", credentials_file.display());
    }

    let stores = open_stores(&config)?;
    let now = Utc::now();
    let active_disqualifications = stores
        .disqualified
        .keys()
        .iter()
        .filter(|author| stores.is_disqualified(author, now))
        .count();

    println!("✅ Data directory: {}", config.storage.data_dir.display());
    println!("   Processed items:      {}", stores.processed.len());
    println!("   Forwarded items:      {}", stores.forwarded_ids.len());
    println!("   Forwarded urls:       {}", stores.forwarded_urls.len());
    println!(
        "   Disqualified authors: {} ({} active)",
        stores.disqualified.len(),
        active_disqualifications
    );

    Ok(())
}

/// Drop processed markers older than their retention window
pub async fn prune(config_file: &Path) -> Result<()> {
    let config = load_config(config_file)?;
    let stores = open_stores(&config)?;

    let before = stores.processed.len();
    let removed = stores.prune_processed(Utc::now());
    info!(removed, remaining = before - removed, "Pruned processed items");
    println!("🧹 Removed {} of {} processed items", removed, before);

    Ok(())
}

/// Generate shell completions
pub fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

/// Initialize logging. The returned guard must live as long as file logging
/// should keep flushing.
pub fn init_logging(debug: bool, verbose: bool, config_file: &Path) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let logging = read_logging_config(config_file);

    let filter = if debug {
        EnvFilter::new("debug")
    } else if verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let (writer, guard) = if logging.log_to_file {
        let log_file = resolve_relative(config_file, Path::new(&logging.log_file));
        let dir = log_file.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let file_name = log_file
            .file_name()
            .ok_or_else(|| Error::Config(format!("Invalid log file path: {}", log_file.display())))?;
        let appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        (BoxMakeWriter::new(non_blocking), Some(guard))
    } else {
        (BoxMakeWriter::new(io::stderr), None)
    };

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(!logging.log_to_file)
        .with_target(false)
        .with_file(debug)
        .with_line_number(debug);

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if logging.json_format {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };
    installed.map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))?;

    debug!("Logging initialized");
    Ok(guard)
}

/// Get the configuration file path
pub fn get_config_file(config_path: Option<PathBuf>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(path),
        None => Ok(Config::config_dir()?.join("config.toml")),
    }
}

fn load_config(config_file: &Path) -> Result<Config> {
    if !config_file.exists() {
        return Err(Error::NotFound(format!(
            "Configuration file {} not found. Run 'repost-guard init' first.",
            config_file.display()
        )));
    }
    Config::load_with_env(config_file)
}

fn open_stores(config: &Config) -> Result<Stores> {
    let retention = RetentionPolicy::from_settings(&config.storage)?;
    Stores::open(&config.storage.data_dir, retention)
}

/// Logging settings are read leniently so a broken config still gets logs.
fn read_logging_config(config_file: &Path) -> LoggingConfig {
    fs::read_to_string(config_file)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.logging)
        .unwrap_or_default()
}

/// Relative paths in the config are relative to the config file's directory.
fn resolve_relative(config_file: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match config_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

fn toml_string(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}

fn create_default_config(collection: &str, destination: &str) -> String {
    let data_dir = Config::default().storage.data_dir.display().to_string();

    format!(r#"# repost-guard configuration
# Generated on {}

[source]
# Collection polled for new items
collection = {}

# Collection qualifying items are cross-posted into
destination = {}

# Credential file (relative to this file)
credentials_file = "password.json"

api_url = "https://oauth.reddit.com"
auth_url = "https://www.reddit.com"

# Request timeout in seconds
timeout = 30

# Items per listing page (1-100)
page_limit = 100

[pipeline]
# Authors classified at the same time
max_concurrent_jobs = 2

# Seconds between a cross-post and its approval
approve_delay = 5

# Sleep after a cycle with nothing new / nothing forwarded / something forwarded
idle_interval = 90
quiet_interval = 300
active_interval = 30

max_pages_per_cycle = 10

[retry]
initial_interval_ms = 500
multiplier = 1.5
randomization_factor = 0.5
max_interval_ms = 60000

# 0 retries without an attempt limit
max_attempts = 10

# Seconds; 0 disables the time limit
max_elapsed = 900

[throttle]
# Extra wait after the advertised rate-limit reset
safety_margin_ms = 1000

[storage]
data_dir = {}

# Retention in seconds (default: 48 hours)
processed_ttl = 172800
disqualified_ttl = 172800

[classifier]
# Case-insensitive markers of paid-content promotion
markers = ["onlyfans", "fansly"]

[logging]
# Log level: error, warn, info, debug, trace
level = "info"

# Log to file
log_to_file = false

# Log file path (relative to this file)
log_file = "logs/repost-guard.log"

# Emit JSON lines instead of plain text
json_format = false
"#,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        toml_string(collection),
        toml_string(destination),
        toml_string(&data_dir),
    )
}
