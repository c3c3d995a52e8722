//! Sidegate - forward HTTP proxy
//!
//! Sidegate accepts HTTP/1.x proxy requests, forwards them over a pool of
//! persistent upstream connections and tunnels CONNECT requests. Requests
//! can be chained through an HTTP or SOCKS5 upstream proxy, and every
//! exchange passes through a configurable chain of filters that may block,
//! reroute or rewrite it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sidegate::{Config, ProxyListener};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let listener = Arc::new(ProxyListener::bind(Config::from_env()?).await?);
//!     listener.spawn().await??;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `server` - listener, session ceiling and watchdog
//! - `session` - per-client state machine, plain exchanges and tunnels
//! - `http` - request/response heads, body framing and the chunked codec
//! - `connection_pool` - per-destination upstream connections
//! - `dns` - cached name resolution
//! - `filter` - request triggers, request filters and response filters
//! - `socks` - SOCKS5 client handshake for chaining

// Core proxy modules
pub mod config;
pub mod logger;
pub mod server;
pub mod session;

// Protocol
pub mod http;
pub mod socks;

// Upstream connections
pub mod connection_pool;
pub mod dns;

// Filtering
pub mod filter;

pub mod error;

// Metrics
pub mod http_metrics;

// Re-export commonly used types

/// Configuration types
pub use config::Config;

/// Listener and sessions
pub use server::ProxyListener;
pub use session::{ProxySession, SessionContext, SessionHandle, SessionState, SessionStatus};

/// Errors
pub use error::{ProxyError, ProxyResult};

/// Upstream connections
pub use connection_pool::{AcquireMode, ConnectionManager, PoolConfig, PoolError, PooledConnection, ReleaseOutcome};
pub use dns::{DnsCache, DnsEntry, DnsError, HostResolver};

/// Filtering
pub use filter::{Filter, FilterChain, FilterList, FilterRegistry, ListMode};

/// HTTP metrics
pub use http_metrics::HttpMetrics;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "sidegate");
    }
}
