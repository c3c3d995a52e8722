use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Error)]
#[error("Unknown log format '{0}'. Must be 'json' or 'pretty'")]
pub struct ParseLogFormatError(String);

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            _ => Err(ParseLogFormatError(s.to_string())),
        }
    }
}

/// Filter from `RUST_LOG` directives, INFO when unset or unparsable
fn env_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise everything at INFO and above is
/// printed.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = env_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

/// One completed exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub timestamp: String, // RFC 3339
    pub client: String,
    pub method: String,
    pub target: String,
    pub status: Option<u16>,
    pub response_bytes: u64,
    pub duration_ms: u64,
    pub keep_alive: bool,
    pub error: Option<String>,
}

impl AccessLogEntry {
    pub fn new(client: impl fmt::Display, method: &str, target: impl fmt::Display) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            client: client.to_string(),
            method: method.to_string(),
            target: target.to_string(),
            status: None,
            response_bytes: 0,
            duration_ms: 0,
            keep_alive: false,
            error: None,
        }
    }
}

/// Access log that emits every entry through tracing and keeps the most
/// recent ones in memory for status inspection.
#[derive(Debug)]
pub struct AccessLog {
    capacity: usize,
    recent: Mutex<VecDeque<AccessLogEntry>>,
}

pub type SharedAccessLog = Arc<AccessLog>;

impl AccessLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recent: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn record(&self, entry: AccessLogEntry) {
        info!(
            client = %entry.client,
            method = %entry.method,
            target = %entry.target,
            status = entry.status.unwrap_or(0),
            bytes = entry.response_bytes,
            duration_ms = entry.duration_ms,
            keep_alive = entry.keep_alive,
            error = entry.error.as_deref().unwrap_or(""),
            "[ACCESS]"
        );

        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(entry);
    }

    /// Most recent entries, oldest first
    pub fn recent(&self) -> Vec<AccessLogEntry> {
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.iter().cloned().collect()
    }

    /// Recent entries as a JSON array
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.recent())?)
    }
}

impl Default for AccessLog {
    fn default() -> Self {
        Self::new(256)
    }
}
