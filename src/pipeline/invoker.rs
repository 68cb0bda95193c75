//! Executes one message's request under the retry policy.

use crate::message::Message;
use crate::pipeline::mapper::HeaderFilter;
use crate::pipeline::retry::{with_retry, IsRetryable, RetryPolicy};
use crate::pipeline::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::template::Template;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use tracing::debug;

/// Request shape shared by every message of a stage.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub method: Method,
    pub url: Template,
    pub headers: Vec<(HeaderName, Template)>,
    /// Message metadata keys forwarded as request headers.
    pub metadata_headers: HeaderFilter,
    /// `None` sends the raw payload.
    pub body: Option<Template>,
}

impl RequestTemplate {
    pub fn new(method: Method, url: Template) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            metadata_headers: HeaderFilter::default(),
            body: None,
        }
    }

    /// Render the request for one message.
    pub fn render(&self, message: &Message) -> Result<HttpRequest, String> {
        let raw_url = self.url.render(message);
        let url = Url::parse(&raw_url).map_err(|e| format!("invalid url {:?}: {}", raw_url, e))?;

        let mut headers = HeaderMap::new();
        if !self.metadata_headers.is_empty() {
            for (key, value) in message.metadata() {
                if !self.metadata_headers.matches(key) {
                    continue;
                }
                match (
                    HeaderName::from_bytes(key.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    (Ok(name), Ok(value)) => {
                        headers.insert(name, value);
                    }
                    _ => debug!(key = %key, "skipping metadata not representable as a header"),
                }
            }
        }
        for (name, value) in &self.headers {
            let rendered = value.render(message);
            let value = HeaderValue::from_str(&rendered)
                .map_err(|e| format!("invalid value for header {}: {}", name, e))?;
            headers.insert(name.clone(), value);
        }

        let body = match &self.body {
            Some(template) => Bytes::from(template.render(message)),
            None => message.payload().clone(),
        };

        Ok(HttpRequest {
            method: self.method.clone(),
            url,
            headers,
            body,
        })
    }
}

/// Why an invocation ended in failure.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    UnexpectedStatus(u16),
    Transport(TransportError),
    InvalidRequest(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestFailure {
    /// Status of the final attempt, when a response was received.
    pub status: Option<u16>,
    pub reason: FailureReason,
    pub attempts: u32,
}

/// Terminal outcome of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Success(HttpResponse),
    Failure(RequestFailure),
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success(_))
    }
}

/// Failure of a single attempt, classified against the policy when it is produced.
#[derive(Debug)]
enum AttemptFailure {
    Status { code: u16, retryable: bool },
    Transport { error: TransportError, retryable: bool },
}

impl IsRetryable for AttemptFailure {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptFailure::Status { retryable, .. } => *retryable,
            AttemptFailure::Transport { retryable, .. } => *retryable,
        }
    }
}

pub struct RequestInvoker<T> {
    transport: T,
    template: RequestTemplate,
    policy: RetryPolicy,
    successful_on: Vec<u16>,
}

impl<T: Transport> RequestInvoker<T> {
    pub fn new(transport: T, template: RequestTemplate, policy: RetryPolicy) -> Self {
        Self {
            transport,
            template,
            policy,
            successful_on: Vec::new(),
        }
    }

    /// Treat these non-2xx codes as success.
    pub fn with_successful_on(mut self, codes: Vec<u16>) -> Self {
        self.successful_on = codes;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn is_success(&self, status: u16) -> bool {
        (200..300).contains(&status) || self.successful_on.contains(&status)
    }

    /// Run the request for `message` to a terminal outcome. Retry state is local
    /// to this call.
    #[tracing::instrument(
        name = "http_invoke",
        skip_all,
        fields(method = %self.template.method)
    )]
    pub async fn invoke(&self, message: &Message) -> RequestOutcome {
        let request = match self.template.render(message) {
            Ok(request) => request,
            Err(reason) => {
                debug!(%reason, "request could not be built");
                return RequestOutcome::Failure(RequestFailure {
                    status: None,
                    reason: FailureReason::InvalidRequest(reason),
                    attempts: 0,
                });
            }
        };

        let (result, attempts) = with_retry(&self.policy, |attempt| {
            let request = request.clone();
            async move {
                let response = self.transport.perform(request).await.map_err(|error| {
                    debug!(attempt, %error, "request attempt failed");
                    AttemptFailure::Transport {
                        retryable: self.policy.retry_transport_errors,
                        error,
                    }
                })?;

                if self.is_success(response.status) {
                    return Ok(response);
                }
                debug!(attempt, status = response.status, "unexpected response status");
                Err(AttemptFailure::Status {
                    code: response.status,
                    retryable: self.policy.is_retryable_status(response.status),
                })
            }
        })
        .await;

        match result {
            Ok(response) => RequestOutcome::Success(response),
            Err(AttemptFailure::Status { code, .. }) => RequestOutcome::Failure(RequestFailure {
                status: Some(code),
                reason: FailureReason::UnexpectedStatus(code),
                attempts,
            }),
            Err(AttemptFailure::Transport { error, .. }) => {
                RequestOutcome::Failure(RequestFailure {
                    status: None,
                    reason: FailureReason::Transport(error),
                    attempts,
                })
            }
        }
    }
}
