use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub database_url: String,
    pub max_connections: u32,
    pub catalog_timeout: Duration,
    pub max_upload_bytes: usize,
    /// Objects modified more recently than this survive a reclaim pass.
    pub reclaim_grace: Duration,
}

/// What the process should do after loading configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    Reclaim,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Content-addressed deduplicating file store")]
pub struct Args {
    /// Host to bind to (overrides DEDUP_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DEDUP_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding objects and staging files (overrides DEDUP_STORE_DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Database URL (overrides DEDUP_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Maximum catalog connections (overrides DEDUP_STORE_MAX_CONNECTIONS)
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Run migrations and exit
    #[arg(long, conflicts_with = "reclaim")]
    pub migrate: bool,

    /// Remove objects no file references, then exit
    #[arg(long)]
    pub reclaim: bool,

    /// Skip unreferenced objects younger than this many seconds
    /// (overrides DEDUP_STORE_RECLAIM_GRACE_SECS)
    #[arg(long)]
    pub reclaim_grace_secs: Option<u64>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        Self::from_args(Args::parse())
    }

    fn from_args(args: Args) -> Result<(Self, RunMode)> {
        // --- Environment fallback ---
        let env_host = env::var("DEDUP_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("DEDUP_STORE_PORT", 8080u16)?;
        let env_data =
            env::var("DEDUP_STORE_DATA_DIR").unwrap_or_else(|_| "./uploads".into());
        let env_db = env::var("DEDUP_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./uploads/meta/dedup_store.db".into());
        let env_max_connections = env_parse("DEDUP_STORE_MAX_CONNECTIONS", 5u32)?;
        let catalog_timeout_secs = env_parse("DEDUP_STORE_CATALOG_TIMEOUT_SECS", 10u64)?;
        let max_upload_bytes = env_parse("DEDUP_STORE_MAX_UPLOAD_BYTES", 1usize << 30)?;
        let env_reclaim_grace = env_parse("DEDUP_STORE_RECLAIM_GRACE_SECS", 3600u64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            data_dir: args.data_dir.unwrap_or_else(|| PathBuf::from(env_data)),
            database_url: args.database_url.unwrap_or(env_db),
            max_connections: args.max_connections.unwrap_or(env_max_connections).max(1),
            catalog_timeout: Duration::from_secs(catalog_timeout_secs),
            max_upload_bytes,
            reclaim_grace: Duration::from_secs(
                args.reclaim_grace_secs.unwrap_or(env_reclaim_grace),
            ),
        };

        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.reclaim {
            RunMode::Reclaim
        } else {
            RunMode::Serve
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse an optional environment variable, falling back to `default`.
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
