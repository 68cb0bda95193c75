//! Per-message string interpolation for URLs, header values and bodies.
//!
//! Supported placeholders:
//! - `${! meta("key") }` inserts the metadata value for `key`, or nothing when unset.
//! - `${! content() }` inserts the message payload (lossy UTF-8).
//!
//! `$${!` produces a literal `${!`. Templates are parsed once at construction time so that
//! malformed placeholders fail before any request is issued.

use crate::message::Message;
use regex::Regex;
use std::sync::LazyLock;

static META_FN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^meta\(\s*"([^"]*)"\s*\)$"#).expect("valid meta regex"));
static CONTENT_FN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^content\(\s*\)$").expect("valid content regex"));

const OPEN: &str = "${!";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unterminated interpolation at byte {0}")]
    Unterminated(usize),
    #[error("unsupported interpolation function: {0:?}")]
    UnknownFunction(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Meta(String),
    Content,
}

/// A parsed template, rendered against one message at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(input: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = input;
        let mut offset = 0usize;

        while let Some(pos) = rest.find(OPEN) {
            if pos > 0 && rest.as_bytes()[pos - 1] == b'$' {
                literal.push_str(&rest[..pos - 1]);
                literal.push_str(OPEN);
                let consumed = pos + OPEN.len();
                rest = &rest[consumed..];
                offset += consumed;
                continue;
            }

            literal.push_str(&rest[..pos]);
            let expr_start = pos + OPEN.len();
            let Some(expr_len) = rest[expr_start..].find('}') else {
                return Err(TemplateError::Unterminated(offset + pos));
            };
            let segment = parse_function(rest[expr_start..expr_start + expr_len].trim())?;

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(segment);

            let consumed = expr_start + expr_len + 1;
            rest = &rest[consumed..];
            offset += consumed;
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    /// True when rendering never depends on the message.
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn render(&self, message: &Message) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Meta(key) => {
                    if let Some(value) = message.meta(key) {
                        out.push_str(value);
                    }
                }
                Segment::Content => out.push_str(&String::from_utf8_lossy(message.payload())),
            }
        }
        out
    }
}

fn parse_function(expr: &str) -> Result<Segment, TemplateError> {
    if let Some(caps) = META_FN.captures(expr) {
        return Ok(Segment::Meta(caps[1].to_string()));
    }
    if CONTENT_FN.is_match(expr) {
        return Ok(Segment::Content);
    }
    Err(TemplateError::UnknownFunction(expr.to_string()))
}
