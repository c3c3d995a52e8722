//! Request and response filtering.
//!
//! A [`Filter`] inspects or rewrites a request (and, on the response side,
//! the response attached to it) and reports whether it acted. Triggers
//! only tag the request through its [`Flags`](crate::http::Flags); acting
//! filters may attach a response, which ends request-side filtering and
//! skips the remote exchange.
//!
//! Filters are looked up by name in a [`FilterRegistry`] when the chain is
//! built, so the configured lists are plain strings.

pub mod builtin;

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use http::StatusCode;
use tracing::{debug, warn};

use crate::config::Config;
use crate::http::html::{escape_html, page};
use crate::http::{Request, Response};

pub trait Filter: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Returns true if the filter acted on the request
    fn apply(&self, request: &mut Request) -> Result<bool>;

    /// One-line description for status output
    fn status(&self) -> String {
        self.name().to_string()
    }
}

/// How a [`FilterList`] combines its members
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMode {
    /// Run every member; acted if any member acted
    All,
    /// Run members until one attaches a response
    UntilResponse,
    /// Stop at the first member that did not act; acted if all acted
    And,
    /// Stop at the first member that acted
    First,
}

/// An ordered list of filters, itself usable as a filter
pub struct FilterList {
    name: String,
    mode: ListMode,
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterList {
    pub fn new(name: impl Into<String>, mode: ListMode) -> Self {
        Self {
            name: name.into(),
            mode,
            filters: Vec::new(),
        }
    }

    pub fn push(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn with(mut self, filter: Arc<dyn Filter>) -> Self {
        self.push(filter);
        self
    }

    pub fn mode(&self) -> ListMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }
}

impl Filter for FilterList {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, request: &mut Request) -> Result<bool> {
        let mut any = false;
        for filter in &self.filters {
            let acted = run_guarded(filter.as_ref(), request)?;
            any |= acted;
            match self.mode {
                ListMode::All => {}
                ListMode::UntilResponse => {
                    if request.has_response() {
                        debug!(filter = filter.name(), "[FILTER] Response attached, list stopped");
                        break;
                    }
                }
                ListMode::And => {
                    if !acted {
                        return Ok(false);
                    }
                }
                ListMode::First => {
                    if acted {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(match self.mode {
            ListMode::And => true,
            _ => any,
        })
    }

    fn status(&self) -> String {
        let members: Vec<String> = self.filters.iter().map(|f| f.status()).collect();
        format!("{} ({:?}): [{}]", self.name, self.mode, members.join(", "))
    }
}

/// Run one filter, turning a panic into an error naming the filter
fn run_guarded(filter: &dyn Filter, request: &mut Request) -> Result<bool> {
    match catch_unwind(AssertUnwindSafe(|| filter.apply(request))) {
        Ok(result) => result.with_context(|| format!("filter '{}' failed", filter.name())),
        Err(panic) => Err(anyhow!(
            "filter '{}' panicked: {}",
            filter.name(),
            panic_message(panic.as_ref())
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

type Constructor = fn(&Config) -> Result<Arc<dyn Filter>>;

/// Maps stable filter names to constructors
#[derive(Clone, Default)]
pub struct FilterRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in filter
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(builtin::HostTrigger::NAME, builtin::HostTrigger::from_config);
        registry.register(builtin::BlockFlagged::NAME, builtin::BlockFlagged::from_config);
        registry.register(builtin::UpstreamRoute::NAME, builtin::UpstreamRoute::from_config);
        registry.register(builtin::Via::NAME, builtin::Via::from_config);
        registry
    }

    pub fn register(&mut self, name: &str, constructor: Constructor) {
        self.constructors
            .insert(name.to_ascii_lowercase(), constructor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn build(&self, name: &str, config: &Config) -> Result<Arc<dyn Filter>> {
        let Some(constructor) = self.constructors.get(&name.trim().to_ascii_lowercase()) else {
            bail!(
                "Unknown filter '{}' (available: {})",
                name,
                self.names().join(", ")
            );
        };
        constructor(config).with_context(|| format!("Failed to build filter '{}'", name))
    }

    fn build_list(
        &self,
        list_name: &str,
        mode: ListMode,
        names: &[String],
        config: &Config,
    ) -> Result<FilterList> {
        let mut list = FilterList::new(list_name, mode);
        for name in names {
            list.push(self.build(name, config)?);
        }
        Ok(list)
    }
}

/// Triggers, the blocking request list and the response list, in the
/// order the session runs them.
pub struct FilterChain {
    triggers: FilterList,
    request: FilterList,
    response: FilterList,
    management_url: String,
}

impl FilterChain {
    pub fn new(
        triggers: FilterList,
        request: FilterList,
        response: FilterList,
        management_url: impl Into<String>,
    ) -> Self {
        Self {
            triggers,
            request,
            response,
            management_url: management_url.into(),
        }
    }

    /// A chain that never acts
    pub fn empty() -> Self {
        Self::new(
            FilterList::new("triggers", ListMode::All),
            FilterList::new("request", ListMode::UntilResponse),
            FilterList::new("response", ListMode::All),
            "",
        )
    }

    /// Build the configured lists from the built-in registry
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::from_registry(&FilterRegistry::with_builtins(), config)
    }

    pub fn from_registry(registry: &FilterRegistry, config: &Config) -> Result<Self> {
        let chain = Self::new(
            registry
                .build_list("triggers", ListMode::All, &config.request_triggers, config)
                .context("Invalid REQUEST_TRIGGERS")?,
            registry
                .build_list("request", ListMode::UntilResponse, &config.request_filters, config)
                .context("Invalid REQUEST_FILTERS")?,
            registry
                .build_list("response", ListMode::All, &config.response_filters, config)
                .context("Invalid RESPONSE_FILTERS")?,
            config.management_url.clone(),
        );
        debug!(
            triggers = ?chain.triggers.names(),
            request = ?chain.request.names(),
            response = ?chain.response.names(),
            "[FILTER] Filter chain ready"
        );
        Ok(chain)
    }

    /// Run triggers, then the blocking list. A failing filter leaves a
    /// 500 page attached instead of an error.
    pub fn filter_request(&self, request: &mut Request) -> bool {
        let result = self
            .triggers
            .apply(request)
            .and_then(|triggered| Ok(self.request.apply(request)? || triggered));
        self.settle(request, result)
    }

    /// Run the response list over the response attached to `request`
    pub fn filter_response(&self, request: &mut Request) -> bool {
        let result = self.response.apply(request);
        self.settle(request, result)
    }

    pub fn status(&self) -> Vec<String> {
        vec![
            self.triggers.status(),
            self.request.status(),
            self.response.status(),
        ]
    }

    fn settle(&self, request: &mut Request, result: Result<bool>) -> bool {
        match result {
            Ok(acted) => acted,
            Err(e) => {
                warn!(request = %request, error = format!("{:#}", e), "[FILTER] Filter failed");
                if request.set_response(self.fault_response(&e)).is_err() {
                    warn!(request = %request, "[FILTER] Response already sent, fault page dropped");
                }
                true
            }
        }
    }

    fn fault_response(&self, error: &anyhow::Error) -> Response {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        let mut body = format!(
            "<p>A filter failed while handling this request:</p>\n<pre>{}</pre>",
            escape_html(&format!("{:#}", error))
        );
        if !self.management_url.is_empty() {
            let url = escape_html(&self.management_url);
            body.push_str(&format!(
                "\n<p><a href=\"{}\">Manage filters</a></p>",
                url
            ));
        }
        Response::generated(status, page(status, "Filter error", &body))
    }
}
