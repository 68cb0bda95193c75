//! Translates a request outcome into a mutated copy of the originating message.

use crate::message::{Message, MessageError};
use crate::pipeline::invoker::{FailureReason, RequestFailure, RequestOutcome};
use regex::Regex;

/// Metadata key carrying the observed response status code.
pub const STATUS_CODE_KEY: &str = "http_status_code";

/// A set of include patterns matched against header or metadata names.
///
/// A name is included when any pattern matches it; an empty filter includes nothing.
#[derive(Debug, Clone, Default)]
pub struct HeaderFilter {
    patterns: Vec<Regex>,
}

impl HeaderFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(name))
    }
}

impl From<RequestFailure> for MessageError {
    fn from(failure: RequestFailure) -> Self {
        match failure.reason {
            FailureReason::UnexpectedStatus(code) => MessageError::UnexpectedStatus { code },
            FailureReason::Transport(error) => MessageError::Transport {
                reason: error.to_string(),
                attempts: failure.attempts,
            },
            FailureReason::InvalidRequest(reason) => MessageError::InvalidRequest(reason),
        }
    }
}

/// Applies outcomes to messages. Deterministic: the same outcome applied to the
/// same message always yields the same result.
#[derive(Debug, Clone, Default)]
pub struct ResponseMapper {
    extract: HeaderFilter,
}

impl ResponseMapper {
    pub fn new(extract: HeaderFilter) -> Self {
        Self { extract }
    }

    pub fn apply(&self, mut message: Message, outcome: RequestOutcome) -> Message {
        match outcome {
            RequestOutcome::Success(response) => {
                if !self.extract.is_empty() {
                    for name in response.headers.keys() {
                        if !self.extract.matches(name.as_str()) {
                            continue;
                        }
                        // First value wins for repeated headers.
                        if let Some(value) = response.headers.get(name) {
                            message.set_meta(
                                name.as_str(),
                                String::from_utf8_lossy(value.as_bytes()),
                            );
                        }
                    }
                }
                message.set_meta(STATUS_CODE_KEY, response.status.to_string());
                message.set_payload(response.body);
            }
            RequestOutcome::Failure(failure) => {
                if let Some(status) = failure.status {
                    message.set_meta(STATUS_CODE_KEY, status.to_string());
                }
                message.set_error(failure.into());
            }
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::transport::{HttpResponse, TransportError};
    use bytes::Bytes;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn response(
        status: u16,
        body: &'static str,
        headers: &[(&'static str, &'static str)],
    ) -> RequestOutcome {
        let mut map = HeaderMap::new();
        for &(name, value) in headers {
            map.append(name, HeaderValue::from_static(value));
        }
        RequestOutcome::Success(HttpResponse {
            status,
            headers: map,
            body: Bytes::from_static(body.as_bytes()),
        })
    }

    fn status_failure(code: u16) -> RequestOutcome {
        RequestOutcome::Failure(RequestFailure {
            status: Some(code),
            reason: FailureReason::UnexpectedStatus(code),
            attempts: 1,
        })
    }

    #[test]
    fn success_replaces_payload_and_sets_status() {
        let mapper = ResponseMapper::default();
        let out = mapper.apply(
            Message::new("foo"),
            response(201, "foobar", &[("foobar", "baz")]),
        );

        assert_eq!(out.payload().as_ref(), b"foobar");
        assert_eq!(out.meta(STATUS_CODE_KEY), Some("201"));
        // No include patterns: nothing extracted.
        assert_eq!(out.meta("foobar"), None);
        assert!(!out.has_error());
    }

    #[test]
    fn success_extracts_matching_headers() {
        let mapper = ResponseMapper::new(HeaderFilter::new(&[".*"]).unwrap());
        let out = mapper.apply(
            Message::new("foo"),
            response(201, "foobar", &[("foobar", "baz")]),
        );

        assert_eq!(out.payload().as_ref(), b"foobar");
        assert_eq!(out.meta(STATUS_CODE_KEY), Some("201"));
        assert_eq!(out.meta("foobar"), Some("baz"));
    }

    #[test]
    fn non_matching_headers_are_dropped() {
        let mapper = ResponseMapper::new(HeaderFilter::new(&["^x-"]).unwrap());
        let out = mapper.apply(
            Message::new("foo"),
            response(200, "", &[("x-trace", "abc"), ("content-type", "text/plain")]),
        );

        assert_eq!(out.meta("x-trace"), Some("abc"));
        assert_eq!(out.meta("content-type"), None);
    }

    #[test]
    fn extracted_header_overwrites_upstream_metadata() {
        let mapper = ResponseMapper::new(HeaderFilter::new(&["foo"]).unwrap());
        let out = mapper.apply(
            Message::new("p").with_meta("foo", "bar").with_meta("keep", "me"),
            response(200, "ok", &[("foo", "from-header")]),
        );

        assert_eq!(out.meta("foo"), Some("from-header"));
        assert_eq!(out.meta("keep"), Some("me"));
    }

    #[test]
    fn empty_body_is_a_valid_success() {
        let mapper = ResponseMapper::default();
        let out = mapper.apply(Message::new("foo").with_meta("foo", "bar"), response(200, "", &[]));

        assert!(out.payload().is_empty());
        assert_eq!(out.meta(STATUS_CODE_KEY), Some("200"));
        assert_eq!(out.meta("foo"), Some("bar"));
        assert!(!out.has_error());
    }

    #[test]
    fn status_failure_preserves_payload_and_metadata() {
        let mapper = ResponseMapper::default();
        let out = mapper.apply(Message::new("foo").with_meta("foo", "bar"), status_failure(404));

        assert_eq!(out.payload().as_ref(), b"foo");
        assert_eq!(out.meta(STATUS_CODE_KEY), Some("404"));
        assert_eq!(out.meta("foo"), Some("bar"));
        assert_eq!(out.error(), Some(&MessageError::UnexpectedStatus { code: 404 }));
        assert!(out
            .error()
            .unwrap()
            .to_string()
            .contains("request returned unexpected response code"));
    }

    #[test]
    fn transport_failure_has_no_status_code() {
        let mapper = ResponseMapper::default();
        let outcome = RequestOutcome::Failure(RequestFailure {
            status: None,
            reason: FailureReason::Transport(TransportError::Timeout),
            attempts: 3,
        });
        let out = mapper.apply(Message::new("foo"), outcome);

        assert_eq!(out.payload().as_ref(), b"foo");
        assert_eq!(out.meta(STATUS_CODE_KEY), None);
        assert_eq!(
            out.error(),
            Some(&MessageError::Transport {
                reason: "request timed out".to_string(),
                attempts: 3,
            })
        );
    }

    #[test]
    fn mapping_is_deterministic() {
        let mapper = ResponseMapper::new(HeaderFilter::new(&[".*"]).unwrap());
        let input = Message::new("foo").with_meta("a", "b");
        let outcome = response(202, "body", &[("h1", "v1"), ("h2", "v2")]);

        let first = mapper.apply(input.clone(), outcome.clone());
        let second = mapper.apply(input, outcome);
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(HeaderFilter::new(&["("]).is_err());
    }
}
