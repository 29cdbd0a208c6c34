//! Client configuration, loaded from TOML or JSON with defaults for every
//! field left out.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use xrdadmin_transport::{
    Credentials, PoolConfig, RetryConfig, ServerAddr, SessionConfig, TcpTransportConfig,
};

use crate::error::{AdminError, Result};

/// Retry policy for transient transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Pause before the first retry.
    pub initial_backoff_ms: u64,
    /// Cap on any single pause.
    pub max_backoff_ms: u64,
    /// Randomly stretch pauses.
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
            jitter: true,
        }
    }
}

/// Credentials presented at session login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSettings {
    /// User name.
    pub user: Option<String>,
    /// Opaque login token.
    pub token: Option<String>,
}

/// Everything an `AdminClient` is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Entry redirectors, `host:port`, tried in order.
    pub redirectors: Vec<String>,
    /// Redirect hops allowed per request.
    pub max_redirects: u32,
    /// Timeout of one request attempt.
    pub request_timeout_ms: u64,
    /// Budget for opening one connection.
    pub connect_timeout_ms: u64,
    /// Retries of transient transport failures.
    pub retry: RetrySettings,
    /// `Wait` replies honoured per request before giving up.
    pub max_wait_replies: u32,
    /// Lifetime of a cached path location.
    pub location_cache_ttl_ms: u64,
    /// Cached locations kept at most.
    pub location_cache_max_entries: usize,
    /// How long a failed server is skipped.
    pub unreachable_ttl_ms: u64,
    /// Requests in flight per batch.
    pub batch_concurrency: usize,
    /// Idle sessions kept per server.
    pub max_idle_sessions_per_server: usize,
    /// Idle sessions older than this are closed instead of reused.
    pub idle_session_timeout_ms: u64,
    /// Entries requested per dirlist page.
    pub dirlist_page_size: u32,
    /// Login credentials; anonymous when absent.
    pub credentials: Option<CredentialSettings>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            redirectors: Vec::new(),
            max_redirects: 16,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            retry: RetrySettings::default(),
            max_wait_replies: 8,
            location_cache_ttl_ms: 5_000,
            location_cache_max_entries: 4096,
            unreachable_ttl_ms: 30_000,
            batch_concurrency: 16,
            max_idle_sessions_per_server: 4,
            idle_session_timeout_ms: 60_000,
            dirlist_page_size: 256,
            credentials: None,
        }
    }
}

impl AdminConfig {
    /// Config with a single entry redirector and default settings.
    pub fn with_redirector(addr: impl Into<String>) -> Self {
        Self {
            redirectors: vec![addr.into()],
            ..Self::default()
        }
    }

    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: AdminConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: AdminConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Rejects settings no client can work with.
    pub fn validate(&self) -> Result<()> {
        if self.redirectors.is_empty() {
            return Err(AdminError::InvalidArgument(
                "at least one redirector is required".to_string(),
            ));
        }
        self.redirector_addrs()?;
        if self.max_redirects == 0 {
            return Err(AdminError::InvalidArgument(
                "max_redirects must be at least 1".to_string(),
            ));
        }
        if self.batch_concurrency == 0 {
            return Err(AdminError::InvalidArgument(
                "batch_concurrency must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(AdminError::InvalidArgument(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.dirlist_page_size == 0 {
            return Err(AdminError::InvalidArgument(
                "dirlist_page_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parsed entry redirector addresses.
    pub fn redirector_addrs(&self) -> Result<Vec<ServerAddr>> {
        self.redirectors
            .iter()
            .map(|s| {
                s.parse::<ServerAddr>()
                    .map_err(|e| AdminError::InvalidArgument(e.to_string()))
            })
            .collect()
    }

    /// Per-attempt request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Session pool settings derived from this config.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_server: self.max_idle_sessions_per_server,
            idle_timeout: Duration::from_millis(self.idle_session_timeout_ms),
            request_timeout: self.request_timeout(),
            max_wait_replies: self.max_wait_replies,
            unreachable_ttl: Duration::from_millis(self.unreachable_ttl_ms),
            retry: RetryConfig {
                max_retries: self.retry.max_retries,
                initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
                backoff_multiplier: 2.0,
                jitter: self.retry.jitter,
            },
            session: SessionConfig {
                login_timeout: self.request_timeout(),
                ..SessionConfig::default()
            },
        }
    }

    /// TCP settings for the network transport.
    pub fn tcp_config(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            ..TcpTransportConfig::default()
        }
    }

    /// Login credentials, if configured.
    pub fn login_credentials(&self) -> Option<Credentials> {
        self.credentials.as_ref().map(|c| Credentials {
            user: c.user.clone(),
            token: c.token.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = AdminConfig::default();
        assert!(config.redirectors.is_empty());
        assert_eq!(config.max_redirects, 16);
        assert_eq!(config.request_timeout_ms, 10_000);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.batch_concurrency, 16);
        assert_eq!(config.dirlist_page_size, 256);
        assert!(config.credentials.is_none());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
redirectors = ["mgr1.example.org:1094", "mgr2.example.org:1094"]
max_redirects = 8
batch_concurrency = 4

[retry]
max_retries = 1

[credentials]
user = "ops"
token = "t0k"
            "#
        )
        .unwrap();

        let config = AdminConfig::from_file(file.path()).unwrap();
        assert_eq!(config.redirectors.len(), 2);
        assert_eq!(config.max_redirects, 8);
        assert_eq!(config.batch_concurrency, 4);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.initial_backoff_ms, 100);
        assert_eq!(config.request_timeout_ms, 10_000);
        let creds = config.login_credentials().unwrap();
        assert_eq!(creds.user.as_deref(), Some("ops"));
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"redirectors": ["[::1]:1094"], "request_timeout_ms": 2500}}"#
        )
        .unwrap();

        let config = AdminConfig::from_file(file.path()).unwrap();
        assert_eq!(config.request_timeout_ms, 2500);
        let addrs = config.redirector_addrs().unwrap();
        assert_eq!(addrs[0], ServerAddr::new("::1", 1094));
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(AdminConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate() {
        assert_eq!(
            AdminConfig::default().validate().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert!(AdminConfig::with_redirector("mgr:1094").validate().is_ok());
        assert!(AdminConfig::with_redirector("mgr").validate().is_err());

        let zero = AdminConfig {
            batch_concurrency: 0,
            ..AdminConfig::with_redirector("mgr:1094")
        };
        assert!(zero.validate().is_err());

        let no_hops = AdminConfig {
            max_redirects: 0,
            ..AdminConfig::with_redirector("mgr:1094")
        };
        assert!(no_hops.validate().is_err());
    }

    #[test]
    fn test_pool_config_mapping() {
        let config = AdminConfig {
            request_timeout_ms: 750,
            max_wait_replies: 2,
            idle_session_timeout_ms: 1_500,
            ..AdminConfig::with_redirector("mgr:1094")
        };
        let pool = config.pool_config();
        assert_eq!(pool.request_timeout, Duration::from_millis(750));
        assert_eq!(pool.session.login_timeout, Duration::from_millis(750));
        assert_eq!(pool.max_wait_replies, 2);
        assert_eq!(pool.idle_timeout, Duration::from_millis(1_500));
        assert_eq!(pool.retry.max_backoff, Duration::from_secs(2));
    }
}
