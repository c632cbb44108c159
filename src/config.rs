use crate::services::scheduler::Intervals;
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Wallet that pays for deals. Empty disables backup submission.
    pub wallet_address: String,
    pub meta_server: String,
    pub swan_key: String,
    pub swan_token: String,
    /// Local object server the backups read from and rebuilds write to.
    pub server_endpoint: String,
    pub root_user: String,
    pub root_password: String,
    /// Public base URL embedded in download links.
    pub host_name: String,
    pub rebuild_path: PathBuf,
    pub sync_limit: usize,
    pub backup_interval_secs: u64,
    pub backup_sync_interval_secs: u64,
    pub rebuild_sync_interval_secs: u64,
    pub import_interval_secs: u64,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("wallet_address", &self.wallet_address)
            .field("meta_server", &self.meta_server)
            .field("server_endpoint", &self.server_endpoint)
            .field("root_user", &self.root_user)
            .field("host_name", &self.host_name)
            .field("rebuild_path", &self.rebuild_path)
            .field("sync_limit", &self.sync_limit)
            .field("intervals", &self.intervals())
            .finish_non_exhaustive()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Bucket backup and rebuild service for a deal network")]
pub struct Args {
    /// Host to bind to (overrides DEAL_BACKUP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DEAL_BACKUP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides DEAL_BACKUP_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Local object server endpoint (overrides SERVER_ENDPOINT)
    #[arg(long)]
    pub server_endpoint: Option<String>,

    /// Staging directory for rebuild payloads (overrides REBUILD_PATH)
    #[arg(long)]
    pub rebuild_path: Option<PathBuf>,

    /// Concurrent copies per import job (overrides SYNC_LIMIT)
    #[arg(long)]
    pub sync_limit: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let cfg = Self::from_env()?.merge(&args);
        Ok((cfg, args.migrate))
    }

    /// Environment only, with defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env_or("DEAL_BACKUP_HOST", "0.0.0.0"),
            port: env_parse("DEAL_BACKUP_PORT", 3000)?,
            database_url: env_or(
                "DEAL_BACKUP_DATABASE_URL",
                "sqlite://./data/meta/deal_backup.db",
            ),
            wallet_address: env_or("FS3_WALLET_ADDRESS", ""),
            meta_server: env_or("META_SERVER", ""),
            swan_key: env_or("SWAN_KEY", ""),
            swan_token: env_or("SWAN_TOKEN", ""),
            server_endpoint: env_or("SERVER_ENDPOINT", "127.0.0.1:9000"),
            root_user: env_or("MINIO_ROOT_USER", ""),
            root_password: env_or("MINIO_ROOT_PASSWORD", ""),
            host_name: env_or("HOST_NAME", "http://127.0.0.1:3000"),
            rebuild_path: PathBuf::from(env_or("REBUILD_PATH", "./data/rebuild")),
            sync_limit: env_parse::<usize>("SYNC_LIMIT", 0)?.max(1),
            backup_interval_secs: env_parse("BACKUP_INTERVAL_SECS", 120)?,
            backup_sync_interval_secs: env_parse("BACKUP_SYNC_INTERVAL_SECS", 60)?,
            rebuild_sync_interval_secs: env_parse("REBUILD_SYNC_INTERVAL_SECS", 600)?,
            import_interval_secs: env_parse("IMPORT_INTERVAL_SECS", 600)?,
        })
    }

    /// CLI values win over the environment.
    pub fn merge(mut self, args: &Args) -> Self {
        if let Some(host) = &args.host {
            self.host = host.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(url) = &args.database_url {
            self.database_url = url.clone();
        }
        if let Some(endpoint) = &args.server_endpoint {
            self.server_endpoint = endpoint.clone();
        }
        if let Some(path) = &args.rebuild_path {
            self.rebuild_path = path.clone();
        }
        if let Some(limit) = args.sync_limit {
            self.sync_limit = limit.max(1);
        }
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn intervals(&self) -> Intervals {
        Intervals {
            backup: Duration::from_secs(self.backup_interval_secs.max(1)),
            backup_sync: Duration::from_secs(self.backup_sync_interval_secs.max(1)),
            rebuild_sync: Duration::from_secs(self.rebuild_sync_interval_secs.max(1)),
            import: Duration::from_secs(self.import_interval_secs.max(1)),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("deal-backup").chain(argv.iter().copied()))
    }

    fn base() -> AppConfig {
        AppConfig {
            host: "0.0.0.0".into(),
            port: 3000,
            database_url: "sqlite::memory:".into(),
            wallet_address: String::new(),
            meta_server: String::new(),
            swan_key: String::new(),
            swan_token: "secret-token".into(),
            server_endpoint: "127.0.0.1:9000".into(),
            root_user: "admin".into(),
            root_password: "hunter2".into(),
            host_name: "http://127.0.0.1:3000".into(),
            rebuild_path: PathBuf::from("./data/rebuild"),
            sync_limit: 1,
            backup_interval_secs: 120,
            backup_sync_interval_secs: 60,
            rebuild_sync_interval_secs: 600,
            import_interval_secs: 600,
        }
    }

    #[test]
    fn cli_overrides_environment() {
        let cfg = base().merge(&args(&["--port", "8080", "--sync-limit", "0"]));
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.sync_limit, 1);
        assert_eq!(cfg.addr(), "0.0.0.0:8080");
    }

    #[test]
    fn debug_output_hides_secrets() {
        let rendered = format!("{:?}", base());
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("admin"));
    }

    #[test]
    fn intervals_follow_configured_seconds() {
        let intervals = base().intervals();
        assert_eq!(intervals.backup, Duration::from_secs(120));
        assert_eq!(intervals.import, Duration::from_secs(600));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        // Unique key so parallel tests never see it.
        let key = "DEAL_BACKUP_TEST_MALFORMED_PORT";
        unsafe { env::set_var(key, "not-a-port") };
        let err = env_parse::<u16>(key, 3000).unwrap_err();
        unsafe { env::remove_var(key) };
        assert!(err.to_string().contains(key));
    }
}
