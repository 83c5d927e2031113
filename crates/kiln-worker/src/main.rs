//! Kiln build worker.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kiln_config::{WorkerConfig, parse_duration};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "kiln-worker")]
#[command(about = "Builds container images from git commits on Kubernetes", long_about = None)]
struct Cli {
    /// Worker configuration file (KDL)
    #[arg(long, short, env = "KILN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, env = "KILN_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Settings that take precedence over the configuration file.
#[derive(clap::Args)]
struct Overrides {
    /// Stable worker identity (defaults to a generated one)
    #[arg(long, env = "KILN_WORKER_ID", global = true)]
    worker_id: Option<String>,

    /// PostgreSQL queue connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Namespace build jobs are created in
    #[arg(long, env = "KILN_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Registry host (and optional path prefix) images are pushed to
    #[arg(long, env = "KILN_REGISTRY", global = true)]
    registry: Option<String>,

    #[arg(long, env = "KILN_REGISTRY_USER", global = true)]
    registry_user: Option<String>,

    #[arg(long, env = "KILN_REGISTRY_PASSWORD", global = true, hide_env_values = true)]
    registry_password: Option<String>,

    /// Upper bound on concurrent builds
    #[arg(long, env = "MAX_CONCURRENT_BUILDS", global = true)]
    max_concurrent_builds: Option<usize>,

    /// Wall-clock cap per build, e.g. `30m`
    #[arg(long, env = "KILN_BUILD_TIMEOUT", global = true)]
    build_timeout: Option<String>,

    /// Bearer token sent with result callbacks
    #[arg(long, env = "KILN_CALLBACK_TOKEN", global = true, hide_env_values = true)]
    callback_token: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Process build jobs until interrupted (the default)
    Run,
    /// Apply queue migrations and exit
    Migrate,
    /// Submit a build job read from a JSON file
    Enqueue {
        /// Path to the job JSON
        path: PathBuf,
    },
    /// Print the effective configuration with secrets redacted
    CheckConfig,
}

impl Overrides {
    fn apply(self, cfg: &mut WorkerConfig) -> Result<()> {
        if let Some(id) = self.worker_id {
            cfg.worker_id = Some(id);
        }
        if let Some(url) = self.database_url {
            cfg.database_url = Some(url);
        }
        if let Some(ns) = self.namespace {
            cfg.namespace = ns;
        }
        if let Some(url) = self.registry {
            cfg.registry.url = url;
        }
        if let Some(user) = self.registry_user {
            cfg.registry.user = Some(user);
        }
        if let Some(password) = self.registry_password {
            cfg.registry.password = Some(password);
        }
        if let Some(n) = self.max_concurrent_builds {
            cfg.build.max_concurrent = n;
        }
        if let Some(timeout) = self.build_timeout {
            cfg.build.timeout = parse_duration("build-timeout", &timeout)?;
        }
        if let Some(token) = self.callback_token {
            cfg.callback.token = Some(token);
        }
        Ok(())
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(path: Option<&PathBuf>, overrides: Overrides) -> Result<WorkerConfig> {
    let mut cfg = match path {
        Some(path) => WorkerConfig::from_file(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    overrides.apply(&mut cfg)?;
    cfg.validate().context("Invalid worker configuration")?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let cfg = load_config(cli.config.as_ref(), cli.overrides)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => commands::run(cfg).await?,
        Commands::Migrate => commands::migrate(&cfg).await?,
        Commands::Enqueue { path } => commands::enqueue(&cfg, &path).await?,
        Commands::CheckConfig => commands::check_config(&cfg)?,
    }

    Ok(())
}
