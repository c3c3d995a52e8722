use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::http::UpstreamProxy;
use crate::logger::LogFormat;

/// Proxy configuration.
///
/// A plain value passed explicitly to the listener, which builds the DNS
/// cache, connection pool and filter chain from it.
#[derive(Debug, Clone)]
pub struct Config {
    // Listener
    pub host: String,
    pub port: u16,
    pub max_sessions: usize,

    // Connection pool
    pub max_connections_per_server: usize,
    pub pool_wait_seconds: u64,
    pub sweep_interval_seconds: u64,

    // Timeouts
    pub client_idle_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub read_timeout_seconds: u64,
    pub watchdog_grace_seconds: u64,

    // Framing
    pub max_header_size: usize,

    // DNS configuration
    pub dns_cache_size: usize,
    pub dns_cache_ttl_seconds: u64,
    pub dns_resolver_timeout_seconds: u64,
    pub ipv6_enabled: bool,

    // Identity
    pub proxy_agent: String,
    pub management_url: String,

    // Filters, by registry name
    pub request_triggers: Vec<String>,
    pub request_filters: Vec<String>,
    pub response_filters: Vec<String>,
    pub blocked_hosts: Vec<String>,

    // Upstream chaining
    pub upstream_proxy: Option<UpstreamProxy>,
    pub upstream_proxy_suffixes: Vec<String>,

    // Logging
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_sessions: 1000,
            max_connections_per_server: 4,
            pool_wait_seconds: 5,
            sweep_interval_seconds: 5,
            client_idle_timeout_seconds: 30,
            connect_timeout_seconds: 10,
            read_timeout_seconds: 30,
            watchdog_grace_seconds: 10,
            max_header_size: 16384,
            dns_cache_size: 5000,
            dns_cache_ttl_seconds: 600,
            dns_resolver_timeout_seconds: 5,
            ipv6_enabled: false,
            proxy_agent: format!("{}/{}", crate::NAME, crate::VERSION),
            management_url: "http://sidegate.local/filters".to_string(),
            request_triggers: vec!["host-trigger".to_string()],
            request_filters: vec!["block-flagged".to_string(), "upstream-route".to_string()],
            response_filters: vec!["via".to_string()],
            blocked_hosts: Vec::new(),
            upstream_proxy: None,
            upstream_proxy_suffixes: Vec::new(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let defaults = Config::default();

        let host = env::var("PROXY_HOST").unwrap_or(defaults.host);
        let port = env_parse("PROXY_PORT", defaults.port)?;
        let max_sessions = env_parse("MAX_SESSIONS", defaults.max_sessions)?;

        let max_connections_per_server =
            env_parse("MAX_CONNECTIONS_PER_SERVER", defaults.max_connections_per_server)?;
        let pool_wait_seconds = env_parse("POOL_WAIT_SECONDS", defaults.pool_wait_seconds)?;
        let sweep_interval_seconds =
            env_parse("SWEEP_INTERVAL_SECONDS", defaults.sweep_interval_seconds)?;

        let client_idle_timeout_seconds = env_parse(
            "CLIENT_IDLE_TIMEOUT_SECONDS",
            defaults.client_idle_timeout_seconds,
        )?;
        let connect_timeout_seconds =
            env_parse("CONNECT_TIMEOUT_SECONDS", defaults.connect_timeout_seconds)?;
        let read_timeout_seconds = env_parse("READ_TIMEOUT_SECONDS", defaults.read_timeout_seconds)?;
        let watchdog_grace_seconds =
            env_parse("WATCHDOG_GRACE_SECONDS", defaults.watchdog_grace_seconds)?;

        let max_header_size = env_parse("MAX_HEADER_SIZE", defaults.max_header_size)?;

        // DNS configuration
        let dns_cache_size = env_parse("DNS_CACHE_SIZE", defaults.dns_cache_size)?;
        let dns_cache_ttl_seconds =
            env_parse("DNS_CACHE_TTL_SECONDS", defaults.dns_cache_ttl_seconds)?;
        let dns_resolver_timeout_seconds = env_parse(
            "DNS_RESOLVER_TIMEOUT_SECONDS",
            defaults.dns_resolver_timeout_seconds,
        )?;
        let ipv6_enabled = env_parse("IPV6_ENABLED", defaults.ipv6_enabled)?;

        let proxy_agent = env::var("PROXY_AGENT").unwrap_or(defaults.proxy_agent);
        let management_url = env::var("MANAGEMENT_URL").unwrap_or(defaults.management_url);

        let request_triggers = env_list("REQUEST_TRIGGERS", defaults.request_triggers);
        let request_filters = env_list("REQUEST_FILTERS", defaults.request_filters);
        let response_filters = env_list("RESPONSE_FILTERS", defaults.response_filters);
        let blocked_hosts = env_list("BLOCKED_HOSTS", defaults.blocked_hosts);

        let upstream_proxy = match env::var("UPSTREAM_PROXY") {
            Ok(value) if !value.trim().is_empty() => Some(
                value
                    .parse::<UpstreamProxy>()
                    .context("Invalid UPSTREAM_PROXY")?,
            ),
            _ => None,
        };
        let upstream_proxy_suffixes =
            env_list("UPSTREAM_PROXY_SUFFIXES", defaults.upstream_proxy_suffixes);

        let log_format = env_parse("LOG_FORMAT", defaults.log_format)?;

        let config = Config {
            host,
            port,
            max_sessions,
            max_connections_per_server,
            pool_wait_seconds,
            sweep_interval_seconds,
            client_idle_timeout_seconds,
            connect_timeout_seconds,
            read_timeout_seconds,
            watchdog_grace_seconds,
            max_header_size,
            dns_cache_size,
            dns_cache_ttl_seconds,
            dns_resolver_timeout_seconds,
            ipv6_enabled,
            proxy_agent,
            management_url,
            request_triggers,
            request_filters,
            response_filters,
            blocked_hosts,
            upstream_proxy,
            upstream_proxy_suffixes,
            log_format,
        };
        config.validate()?;

        if let Some(upstream) = &config.upstream_proxy {
            tracing::info!(
                upstream = %upstream,
                suffixes = config.upstream_proxy_suffixes.len(),
                "Upstream proxy chaining enabled"
            );
        }

        Ok(config)
    }

    /// Reject values that would make the proxy unusable
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(anyhow::anyhow!("MAX_SESSIONS must be at least 1"));
        }
        if self.max_connections_per_server == 0 {
            return Err(anyhow::anyhow!(
                "MAX_CONNECTIONS_PER_SERVER must be at least 1"
            ));
        }
        if self.max_header_size < 256 {
            return Err(anyhow::anyhow!(
                "MAX_HEADER_SIZE is too small ({} bytes). Minimum is 256.",
                self.max_header_size
            ));
        }
        if self.dns_cache_size == 0 {
            return Err(anyhow::anyhow!("DNS_CACHE_SIZE must be at least 1"));
        }
        if self.pool_wait_seconds == 0 || self.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!(
                "POOL_WAIT_SECONDS and SWEEP_INTERVAL_SECONDS must be at least 1"
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.client_idle_timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    pub fn pool_wait(&self) -> Duration {
        Duration::from_secs(self.pool_wait_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn watchdog_grace(&self) -> Duration {
        Duration::from_secs(self.watchdog_grace_seconds)
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

/// Comma or whitespace separated list
fn env_list(name: &str, default: Vec<String>) -> Vec<String> {
    match env::var(name) {
        Ok(value) => split_list(&value),
        Err(_) => default,
    }
}

pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
