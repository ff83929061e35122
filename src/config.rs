//! Configuration structs, built once at startup and threaded through the
//! service. Core logic never reads the environment itself.

use std::env;

use url::Url;

use crate::error::{ConfigErrorKind, WorkflowError};
use crate::protocol::FlowControl;

pub const DEFAULT_DISPATCHER_URL: &str = "https://qstash.upstash.io";

/// Connection settings for the REST dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub base_url: String,
    pub token: String,
    pub request_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_DISPATCHER_URL.to_string(),
            token: String::new(),
            request_timeout_secs: 30,
        }
    }
}

impl DispatcherConfig {
    /// Load from `QSTASH_URL` and `QSTASH_TOKEN`, reading `.env` if present.
    pub fn from_env() -> Result<Self, WorkflowError> {
        dotenvy::dotenv().ok();
        let token = env::var("QSTASH_TOKEN").map_err(|_| {
            WorkflowError::configuration(ConfigErrorKind::MissingCredentials, "QSTASH_TOKEN is not set")
        })?;
        let base_url = env::var("QSTASH_URL").unwrap_or_else(|_| DEFAULT_DISPATCHER_URL.to_string());
        let request_timeout_secs = env::var("QSTASH_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        Ok(Self {
            base_url,
            token,
            request_timeout_secs,
        })
    }
}

/// Per-endpoint options of a workflow service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowOptions {
    /// Public URL of the endpoint; defaults to the inbound request URL.
    pub url: Option<String>,
    /// Replaces scheme and host of the workflow URL (local tunnels, proxies).
    pub base_url: Option<String>,
    /// Where failed runs are reported when no failure handler is registered.
    pub failure_url: Option<String>,
    /// Dispatcher retries for continuation requests.
    pub retries: Option<u32>,
    pub flow_control: Option<FlowControl>,
}

impl WorkflowOptions {
    /// Load `UPSTASH_WORKFLOW_URL` as the base URL, reading `.env` if present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            base_url: env::var("UPSTASH_WORKFLOW_URL").ok().filter(|v| !v.is_empty()),
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_failure_url(mut self, url: impl Into<String>) -> Self {
        self.failure_url = Some(url.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = Some(flow_control);
        self
    }

    /// Canonical workflow URL for a request received at `request_url`.
    ///
    /// With a base URL, the scheme, host and port are taken from it and its
    /// path is prefixed to the request path. Query and fragment are kept.
    pub fn workflow_url(&self, request_url: &str) -> Result<String, WorkflowError> {
        let url = self.url.as_deref().unwrap_or(request_url);
        match &self.base_url {
            Some(base) => replace_origin(url, base),
            None => Ok(url.to_string()),
        }
    }
}

fn parse_url(raw: &str) -> Result<Url, WorkflowError> {
    Url::parse(raw).map_err(|e| WorkflowError::configuration(ConfigErrorKind::InvalidUrl, format!("{raw}: {e}")))
}

fn replace_origin(url: &str, base: &str) -> Result<String, WorkflowError> {
    let mut target = parse_url(url)?;
    let base = parse_url(base)?;
    let invalid = |what: &str| {
        WorkflowError::configuration(
            ConfigErrorKind::InvalidUrl,
            format!("cannot move {what} of {url} onto base {base}"),
        )
    };

    let path = match target.path() {
        "/" if base.path() != "/" => base.path().trim_end_matches('/').to_string(),
        path => format!("{}{path}", base.path().trim_end_matches('/')),
    };
    target.set_scheme(base.scheme()).map_err(|_| invalid("scheme"))?;
    target.set_host(base.host_str()).map_err(|_| invalid("host"))?;
    target.set_port(base.port()).map_err(|_| invalid("port"))?;
    target.set_path(&path);
    Ok(target.to_string())
}
