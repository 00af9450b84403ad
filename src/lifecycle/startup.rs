//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the request template from the command line
//! - Load the optional config file and apply command-line overrides
//! - Validate the result before anything binds
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Template first: an unsupported method is reported without touching
//!   the filesystem or the network
//! - Precedence: defaults < config file < environment / command line

use std::path::PathBuf;

use crate::config::{load_config, validate_config, ConfigError, LogFormat, RelayConfig};
use crate::http::request::{BuildError, OutboundRequest};
use crate::net::listener::{effective_host, parse_port};
use crate::relay::types::RelayResult;

/// Everything the command line supplies.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub method: String,
    pub host: String,
    pub port: String,
    pub path: String,
    pub body: Option<String>,
    pub headers: Vec<String>,
    pub backend: Option<String>,
    pub config_path: Option<PathBuf>,
    pub log_format: Option<LogFormat>,
}

/// Validated configuration plus the template every relayed call derives from.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub config: RelayConfig,
    pub template: OutboundRequest,
}

/// Build the request template from the positional arguments.
pub fn build_template(invocation: &Invocation) -> Result<OutboundRequest, BuildError> {
    OutboundRequest::builder(
        invocation.method.as_str(),
        invocation.host.as_str(),
        invocation.port.as_str(),
    )
    .path(invocation.path.as_str())
    .maybe_body(invocation.body.clone().map(String::into_bytes))
    .headers(invocation.headers.iter().cloned())
    .build()
}

pub fn prepare(invocation: &Invocation) -> RelayResult<Prepared> {
    let template = build_template(invocation)?;

    let mut config = match &invocation.config_path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Loading configuration file");
            load_config(path)?
        }
        None => RelayConfig::default(),
    };

    config.listener.host = effective_host(&invocation.host).to_string();
    config.listener.port = parse_port(&invocation.port);
    if let Some(url) = &invocation.backend {
        config.backend.url = url.clone();
    }
    if let Some(format) = invocation.log_format {
        config.observability.log_format = format;
    }

    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(Prepared { config, template })
}
