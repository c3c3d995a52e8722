//! Built-in filters.

use std::sync::Arc;

use anyhow::Result;
use http::Version;

use super::Filter;
use crate::config::Config;
use crate::http::html::escape_html;
use crate::http::{Request, UpstreamProxy};

/// True if `host` is `suffix` or a subdomain of it
pub fn host_matches(host: &str, suffix: &str) -> bool {
    let host = host.trim_end_matches('.');
    let suffix = suffix.trim().trim_start_matches('.').trim_end_matches('.');
    if suffix.is_empty() || host.len() < suffix.len() {
        return false;
    }
    let split = host.len() - suffix.len();
    let host = host.as_bytes();
    host[split..].eq_ignore_ascii_case(suffix.as_bytes()) && (split == 0 || host[split - 1] == b'.')
}

/// Trigger: tags requests to `BLOCKED_HOSTS` with `block`
pub struct HostTrigger {
    suffixes: Vec<String>,
}

impl HostTrigger {
    pub const NAME: &'static str = "host-trigger";

    pub fn new(suffixes: Vec<String>) -> Self {
        Self { suffixes }
    }

    pub fn from_config(config: &Config) -> Result<Arc<dyn Filter>> {
        Ok(Arc::new(Self::new(config.blocked_hosts.clone())))
    }
}

impl Filter for HostTrigger {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn apply(&self, request: &mut Request) -> Result<bool> {
        let host = request.target.host.clone();
        let Some(suffix) = self.suffixes.iter().find(|s| host_matches(&host, s)) else {
            return Ok(false);
        };
        request.flags.insert("block");
        request.add_trigger_html(format!(
            "<p>Host <b>{}</b> matches the blocked entry <b>{}</b>.</p>",
            escape_html(&host),
            escape_html(suffix)
        ));
        Ok(true)
    }

    fn status(&self) -> String {
        format!("{} ({} hosts)", Self::NAME, self.suffixes.len())
    }
}

/// Answers requests tagged `block` with the blocked page
pub struct BlockFlagged;

impl BlockFlagged {
    pub const NAME: &'static str = "block-flagged";

    pub fn from_config(_config: &Config) -> Result<Arc<dyn Filter>> {
        Ok(Arc::new(Self))
    }
}

impl Filter for BlockFlagged {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn apply(&self, request: &mut Request) -> Result<bool> {
        if !request.flags.contains("block") {
            return Ok(false);
        }
        let message = format!(
            "<p>The request for <b>{}</b> was blocked.</p>",
            escape_html(&request.target.to_string())
        );
        request.block("Blocked", &message)?;
        Ok(true)
    }
}

/// Sends matching hosts through `UPSTREAM_PROXY`; every host when no
/// suffixes are configured
pub struct UpstreamRoute {
    upstream: Option<UpstreamProxy>,
    suffixes: Vec<String>,
}

impl UpstreamRoute {
    pub const NAME: &'static str = "upstream-route";

    pub fn new(upstream: Option<UpstreamProxy>, suffixes: Vec<String>) -> Self {
        Self { upstream, suffixes }
    }

    pub fn from_config(config: &Config) -> Result<Arc<dyn Filter>> {
        Ok(Arc::new(Self::new(
            config.upstream_proxy.clone(),
            config.upstream_proxy_suffixes.clone(),
        )))
    }
}

impl Filter for UpstreamRoute {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn apply(&self, request: &mut Request) -> Result<bool> {
        let Some(upstream) = &self.upstream else {
            return Ok(false);
        };
        let routed = self.suffixes.is_empty()
            || self
                .suffixes
                .iter()
                .any(|s| host_matches(&request.target.host, s));
        if routed {
            request.upstream_proxy = Some(upstream.clone());
        }
        Ok(routed)
    }

    fn status(&self) -> String {
        match &self.upstream {
            Some(upstream) => format!("{} -> {}", Self::NAME, upstream),
            None => format!("{} (no upstream)", Self::NAME),
        }
    }
}

/// Response filter: appends a `Via` header to relayed responses
pub struct Via {
    agent: String,
}

impl Via {
    pub const NAME: &'static str = "via";

    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Arc<dyn Filter>> {
        Ok(Arc::new(Self::new(config.proxy_agent.clone())))
    }
}

impl Filter for Via {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn apply(&self, request: &mut Request) -> Result<bool> {
        let Some(response) = request.response_mut() else {
            return Ok(false);
        };
        if response.is_generated() {
            return Ok(false);
        }
        let version = if response.version == Version::HTTP_10 {
            "1.0"
        } else {
            "1.1"
        };
        response.headers.add("Via", format!("{} {}", version, self.agent));
        Ok(true)
    }
}
