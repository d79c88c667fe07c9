use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "STUDIO_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub bucket: String,
    pub region: String,
    pub clients_folder: String,
    pub home_folder: String,
    pub max_cache_workers: usize,
    pub cache_interval: Duration,
    pub cleanup_interval: Duration,
    pub download_expiration_days: i64,
    pub public_base_url: String,
    pub url_signing_secret: String,
    pub email_api_key: String,
    pub from_name: String,
    pub from_email: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Photo studio derived-asset service")]
pub struct Args {
    /// Host to bind to (overrides STUDIO_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides STUDIO_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides STUDIO_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides STUDIO_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bucket holding every photo (overrides STUDIO_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Parallel image regenerations per sweep (overrides STUDIO_MAX_CACHE_WORKERS)
    #[arg(long)]
    pub max_cache_workers: Option<usize>,

    /// Seconds between cache sweeps (overrides STUDIO_CACHE_INTERVAL_SECS)
    #[arg(long)]
    pub cache_interval_secs: Option<u64>,

    /// Seconds between archive cleanups (overrides STUDIO_CLEANUP_INTERVAL_SECS)
    #[arg(long)]
    pub cleanup_interval_secs: Option<u64>,

    /// Days an album archive is kept (overrides STUDIO_DOWNLOAD_EXPIRATION_DAYS)
    #[arg(long)]
    pub download_expiration_days: Option<i64>,

    /// Public URL used in download links (overrides STUDIO_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// CLI value first, then `STUDIO_*` from `lookup`, then the default.
    pub fn from_sources(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = |name: &str, default: &str| -> String {
            lookup(&format!("{ENV_PREFIX}{name}")).unwrap_or_else(|| default.to_string())
        };

        let env_port: u16 = parsed(&lookup, "PORT", 3000)?;
        let env_workers: usize = parsed(&lookup, "MAX_CACHE_WORKERS", 20)?;
        let env_cache_secs: u64 = parsed(&lookup, "CACHE_INTERVAL_SECS", 3600)?;
        let env_cleanup_secs: u64 = parsed(&lookup, "CLEANUP_INTERVAL_SECS", 86_400)?;
        let env_expiration: i64 = parsed(&lookup, "DOWNLOAD_EXPIRATION_DAYS", 7)?;

        let expiration = args.download_expiration_days.unwrap_or(env_expiration);

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or_else(|| text("HOST", "0.0.0.0")),
            port: args.port.unwrap_or(env_port),
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| text("STORAGE_DIR", "./data/objects")),
            database_url: args
                .database_url
                .unwrap_or_else(|| text("DATABASE_URL", "sqlite://./data/meta/studio.db")),
            bucket: args.bucket.unwrap_or_else(|| text("BUCKET", "studio-photos")),
            region: text("REGION", "local"),
            clients_folder: text("CLIENTS_FOLDER", "clients"),
            home_folder: text("HOME_FOLDER", "home-page"),
            max_cache_workers: args.max_cache_workers.unwrap_or(env_workers).max(1),
            cache_interval: Duration::from_secs(
                args.cache_interval_secs.unwrap_or(env_cache_secs).max(1),
            ),
            cleanup_interval: Duration::from_secs(
                args.cleanup_interval_secs.unwrap_or(env_cleanup_secs).max(1),
            ),
            download_expiration_days: if expiration <= 0 { 7 } else { expiration },
            public_base_url: args
                .public_base_url
                .unwrap_or_else(|| text("PUBLIC_BASE_URL", "http://localhost:3000")),
            url_signing_secret: lookup(&format!("{ENV_PREFIX}URL_SIGNING_SECRET"))
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            email_api_key: text("EMAIL_API_KEY", ""),
            from_name: text("FROM_NAME", "Studio"),
            from_email: text("FROM_EMAIL", "noreply@localhost"),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let var = format!("{ENV_PREFIX}{name}");
    match lookup(&var) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {var} value `{value}`")),
        None => Ok(default),
    }
}
