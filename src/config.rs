//! Stage configuration loaded from TOML.
//!
//! Every field except `url` has a default. Validation happens when the
//! configuration is turned into runtime parts, before any request is issued.

use crate::pipeline::dispatcher::ExecutionMode;
use crate::pipeline::invoker::RequestTemplate;
use crate::pipeline::mapper::{HeaderFilter, ResponseMapper};
use crate::pipeline::retry::{BackoffStrategy, RetryPolicy, StatusMatcher};
use crate::template::{Template, TemplateError};
use anyhow::Context;
use reqwest::header::HeaderName;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

fn default_verb() -> String {
    "POST".to_string()
}

fn default_retry_period_ms() -> u64 {
    1_000
}

fn default_max_retry_backoff_ms() -> u64 {
    300_000
}

fn default_retry_on() -> Vec<StatusSpec> {
    ["1xx", "3xx", "4xx", "5xx"]
        .into_iter()
        .map(|class| StatusSpec::Pattern(class.to_string()))
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    5_000
}

/// Construction-time configuration errors. These abort before dispatch.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("url must not be empty")]
    EmptyUrl,
    #[error("invalid template in {field}: {source}")]
    Template {
        field: String,
        #[source]
        source: TemplateError,
    },
    #[error("invalid url {url:?}: {reason}")]
    Url { url: String, reason: String },
    #[error("invalid HTTP method {0:?}")]
    Method(String),
    #[error("invalid header name {0:?}")]
    HeaderName(String),
    #[error("invalid pattern in {field}: {source}")]
    Pattern {
        field: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("invalid status code spec {0:?}, expected a code like 429 or a class like \"5xx\"")]
    Status(String),
    #[error("timeout_ms must be greater than zero")]
    ZeroTimeout,
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// A status code (`429`) or a status class (`"5xx"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusSpec {
    Code(u16),
    Pattern(String),
}

impl StatusSpec {
    pub fn to_matcher(&self) -> Result<StatusMatcher, ConfigError> {
        let invalid = || ConfigError::Status(self.to_string());
        match self {
            StatusSpec::Code(code) if (100..=599).contains(code) => Ok(StatusMatcher::Code(*code)),
            StatusSpec::Code(_) => Err(invalid()),
            StatusSpec::Pattern(pattern) => {
                let pattern = pattern.trim().to_ascii_lowercase();
                if let Some(class) = pattern.strip_suffix("xx") {
                    return match class.parse::<u16>() {
                        Ok(class @ 1..=5) => Ok(StatusMatcher::Class(class)),
                        _ => Err(invalid()),
                    };
                }
                match pattern.parse::<u16>() {
                    Ok(code) if (100..=599).contains(&code) => Ok(StatusMatcher::Code(code)),
                    _ => Err(invalid()),
                }
            }
        }
    }
}

impl std::fmt::Display for StatusSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusSpec::Code(code) => write!(f, "{}", code),
            StatusSpec::Pattern(pattern) => write!(f, "{}", pattern),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Target URL, interpolated per message.
    pub url: String,
    #[serde(default = "default_verb")]
    pub verb: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Metadata keys matching any of these patterns are sent as request headers.
    #[serde(default)]
    pub metadata_headers: Vec<String>,
    /// Response headers matching any of these patterns are copied into metadata.
    #[serde(default)]
    pub extract_headers: Vec<String>,
    /// Request body template. Unset sends the raw payload.
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_retry_period_ms")]
    pub retry_period_ms: u64,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<StatusSpec>,
    #[serde(default = "default_true")]
    pub retry_transport_errors: bool,
    #[serde(default)]
    pub successful_on: Vec<u16>,
    /// Per-attempt timeout handed to the transport.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ProcessorConfig {
    /// A configuration with every option at its default.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            verb: default_verb(),
            headers: BTreeMap::new(),
            metadata_headers: Vec::new(),
            extract_headers: Vec::new(),
            body: None,
            parallel: false,
            retries: 0,
            retry_period_ms: default_retry_period_ms(),
            backoff: BackoffKind::default(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            retry_on: default_retry_on(),
            retry_transport_errors: true,
            successful_on: Vec::new(),
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("invalid processor configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        Self::from_toml_str(&content)
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        if self.parallel {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Serial
        }
    }

    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(Duration::from_millis(self.timeout_ms))
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let retry_on = self
            .retry_on
            .iter()
            .map(StatusSpec::to_matcher)
            .collect::<Result<Vec<_>, _>>()?;
        let backoff = match self.backoff {
            BackoffKind::Fixed => BackoffStrategy::Fixed,
            BackoffKind::Exponential => BackoffStrategy::ExponentialWithJitter {
                max: Duration::from_millis(self.max_retry_backoff_ms.max(self.retry_period_ms)),
            },
        };
        Ok(RetryPolicy {
            max_retries: self.retries,
            delay: Duration::from_millis(self.retry_period_ms),
            backoff,
            retry_on,
            retry_transport_errors: self.retry_transport_errors,
        })
    }

    pub fn request_template(&self) -> Result<RequestTemplate, ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::EmptyUrl);
        }
        let url = parse_template("url", &self.url)?;
        if url.is_static() {
            Url::parse(&self.url).map_err(|e| ConfigError::Url {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        }

        let method = Method::from_bytes(self.verb.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| ConfigError::Method(self.verb.clone()))?;

        let headers = self
            .headers
            .iter()
            .map(|(name, value)| {
                let header = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| ConfigError::HeaderName(name.clone()))?;
                let value = parse_template(&format!("headers.{}", name), value)?;
                Ok((header, value))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let metadata_headers = HeaderFilter::new(self.metadata_headers.as_slice())
            .map_err(|source| ConfigError::Pattern {
                field: "metadata_headers",
                source,
            })?;

        let body = self
            .body
            .as_deref()
            .map(|body| parse_template("body", body))
            .transpose()?;

        Ok(RequestTemplate {
            method,
            url,
            headers,
            metadata_headers,
            body,
        })
    }

    pub fn response_mapper(&self) -> Result<ResponseMapper, ConfigError> {
        let extract = HeaderFilter::new(self.extract_headers.as_slice()).map_err(|source| {
            ConfigError::Pattern {
                field: "extract_headers",
                source,
            }
        })?;
        Ok(ResponseMapper::new(extract))
    }
}

fn parse_template(field: &str, input: &str) -> Result<Template, ConfigError> {
    Template::parse(input).map_err(|source| ConfigError::Template {
        field: field.to_string(),
        source,
    })
}
