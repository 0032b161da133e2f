//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The factory token is loaded from IDENTITY_FACTORY_TOKEN or `token_file`,
//! never stored in the TOML directly to avoid leaking secrets.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use identity_pool::PoolOptions;
use serde::Deserialize;

/// Environment variable overriding `[factory] token_file`.
pub const FACTORY_TOKEN_ENV: &str = "IDENTITY_FACTORY_TOKEN";

/// Root configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub factory: FactoryConfig,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Shared JSON file store. Without it, pools live in memory only.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// How often a blocked pull re-reads the file for other processes' writes.
    #[serde(default = "default_wait_poll_interval")]
    pub wait_poll_interval_secs: f64,
}

impl StoreConfig {
    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.wait_poll_interval_secs)
    }
}

/// Credentials for the identity factory endpoints
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FactoryConfig {
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(skip)]
    pub token: Option<Secret<String>>,
}

/// One pool served under `/pools/{name}`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    pub name: String,
    /// Endpoint minting new identities. Without it the pool never creates.
    #[serde(default)]
    pub factory_url: Option<String>,
    #[serde(default = "default_create_timeout")]
    pub create_timeout_secs: u64,
    /// Factory statuses to retry on top of 408/429/5xx.
    #[serde(default)]
    pub retry_statuses: Vec<u16>,
    #[serde(default)]
    pub options: PoolOptions,
}

impl PoolConfig {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_wait_poll_interval() -> f64 {
    1.0
}

fn default_create_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file, validate it, then resolve the
    /// factory token (IDENTITY_FACTORY_TOKEN env var over `token_file`).
    pub fn load(path: &Path) -> common::Result<Self> {
        let mut config: Config = common::load_toml(path)?;
        config.validate()?;
        config.factory.token =
            common::read_secret(FACTORY_TOKEN_ENV, config.factory.token_file.as_deref())?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.broker.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if let Some(store) = &self.store {
            let interval = store.wait_poll_interval_secs;
            if !interval.is_finite() || interval <= 0.0 {
                return Err(common::Error::Config(format!(
                    "wait_poll_interval_secs must be a positive number, got: {interval}"
                )));
            }
        }

        if self.pools.is_empty() {
            return Err(common::Error::Config(
                "at least one [[pools]] entry is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for pool in &self.pools {
            if pool.name.is_empty() {
                return Err(common::Error::Config("pool name must not be empty".into()));
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate pool name: {}",
                    pool.name
                )));
            }
            if let Some(url) = &pool.factory_url
                && !url.starts_with("http://")
                && !url.starts_with("https://")
            {
                return Err(common::Error::Config(format!(
                    "pool {}: factory_url must start with http:// or https://, got: {url}",
                    pool.name
                )));
            }
            if pool.create_timeout_secs == 0 {
                return Err(common::Error::Config(format!(
                    "pool {}: create_timeout_secs must be greater than 0",
                    pool.name
                )));
            }
            pool.options.validate().map_err(|e| {
                common::Error::Config(format!("pool {}: {e}", pool.name))
            })?;
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        common::resolve_path(cli_path, "CONFIG_PATH", "identity-broker.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that touch IDENTITY_FACTORY_TOKEN.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
[broker]
listen_addr = "127.0.0.1:8080"

[store]
path = "/var/lib/identity-broker/identities.json"

[[pools]]
name = "scraper"
factory_url = "http://signup.internal/accounts"
retry_statuses = [409]

[pools.options]
max_deprecations_before_removal = 1
min_interval_between_use = 2.5
lock_expire = 60

[[pools]]
name = "search"
"#
    }

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("broker.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(FACTORY_TOKEN_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.broker.max_connections, 1000);
        assert_eq!(config.store.as_ref().unwrap().wait_poll_interval(), Duration::from_secs(1));
        assert!(config.factory.token.is_none());
        assert_eq!(config.pools.len(), 2);

        let scraper = &config.pools[0];
        assert_eq!(scraper.retry_statuses, vec![409]);
        assert_eq!(scraper.create_timeout(), Duration::from_secs(30));
        assert_eq!(scraper.options.max_deprecations_before_removal, 1);
        assert_eq!(scraper.options.min_interval_between_use, Duration::from_millis(2500));
        assert_eq!(scraper.options.lock_expire, Duration::from_secs(60));

        let search = &config.pools[1];
        assert!(search.factory_url.is_none());
        assert_eq!(search.options, PoolOptions::default());
    }

    #[test]
    fn token_env_overrides_token_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token");
        std::fs::write(&token_path, "from-file\n").unwrap();
        let contents = format!(
            "{}\n[factory]\ntoken_file = \"{}\"\n",
            valid_toml(),
            token_path.display()
        );
        let path = write_config(dir.path(), &contents);

        unsafe { remove_env(FACTORY_TOKEN_ENV) };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.factory.token.as_ref().unwrap().expose(), "from-file");

        unsafe { set_env(FACTORY_TOKEN_ENV, "from-env") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env(FACTORY_TOKEN_ENV) };
        assert_eq!(config.factory.token.as_ref().unwrap().expose(), "from-env");
    }

    #[test]
    fn missing_file_is_error() {
        assert!(Config::load(Path::new("/nonexistent/broker.toml")).is_err());
    }

    #[test]
    fn rejects_duplicate_pool_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[broker]
listen_addr = "127.0.0.1:8080"

[[pools]]
name = "scraper"

[[pools]]
name = "scraper"
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate pool name"), "got: {err}");
    }

    #[test]
    fn rejects_non_http_factory_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[broker]
listen_addr = "127.0.0.1:8080"

[[pools]]
name = "scraper"
factory_url = "ftp://signup.internal"
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("factory_url"), "got: {err}");
    }

    #[test]
    fn rejects_zero_max_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[broker]
listen_addr = "127.0.0.1:8080"
max_connections = 0

[[pools]]
name = "scraper"
"#,
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn rejects_missing_pools() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "[broker]\nlisten_addr = \"127.0.0.1:8080\"\n");
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("[[pools]]"), "got: {err}");
    }

    #[test]
    fn rejects_invalid_pool_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[broker]
listen_addr = "127.0.0.1:8080"

[[pools]]
name = "scraper"

[pools.options]
lock_expire = 0
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("pool scraper"), "got: {err}");
    }

    #[test]
    fn rejects_unknown_option_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[broker]
listen_addr = "127.0.0.1:8080"

[[pools]]
name = "scraper"

[pools.options]
lock_expiry = 60
"#,
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn resolve_path_prefers_cli() {
        let path = Config::resolve_path(Some("/etc/identity-broker/custom.toml"));
        assert_eq!(path, PathBuf::from("/etc/identity-broker/custom.toml"));
    }
}
