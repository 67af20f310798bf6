// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

use crate::content::Message;
use crate::schema::ToolDefinition;

/// The normalized request handed to a model provider.  Providers translate
/// this into their own wire format; the core never sees the wire.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub system: Option<String>,
}

/// Why the model stopped producing output, normalized across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    Error,
    Other,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::ToolUse => "tool_use",
            StopReason::Error => "error",
            StopReason::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// Token usage reported for one request.  All counters are optional because
/// providers differ in what they report; absent values count as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

impl Usage {
    pub fn input(&self) -> u64 {
        self.input_tokens.unwrap_or(0)
    }

    pub fn output(&self) -> u64 {
        self.output_tokens.unwrap_or(0)
    }

    /// Merge another report into this one, field by field, saturating.
    pub fn add(&mut self, other: &Usage) {
        fn acc(slot: &mut Option<u64>, v: Option<u64>) {
            if let Some(v) = v {
                *slot = Some(slot.unwrap_or(0).saturating_add(v));
            }
        }
        acc(&mut self.input_tokens, other.input_tokens);
        acc(&mut self.output_tokens, other.output_tokens);
        acc(
            &mut self.cache_creation_input_tokens,
            other.cache_creation_input_tokens,
        );
        acc(
            &mut self.cache_read_input_tokens,
            other.cache_read_input_tokens,
        );
    }
}

/// A checkpoint: the id of the last summarized message plus the summary
/// text that replaces everything up to (and possibly including) it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub message_id: String,
    pub summary: String,
}

// ─── Request errors ───────────────────────────────────────────────────────────

/// A failure from a model request: connection, HTTP, or mid-stream.
///
/// The same error value travels through policy metadata, conversation
/// events, and retry predicates, so it must be cloneable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RequestError {
    pub message: String,
    /// HTTP status, when the failure came from a response.
    pub status: Option<u16>,
    /// Transport error code (`ECONNRESET` and friends), when known.
    pub code: Option<String>,
    /// Error code of a nested cause, when the transport wraps one.
    pub cause_code: Option<String>,
}

impl RequestError {
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: None,
            cause_code: None,
        }
    }

    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: Some(code.into()),
            cause_code: None,
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
            code: None,
            cause_code: None,
        }
    }

    /// A failure that happened after streaming began.  Mid-stream failures
    /// are terminal and never retried, so they carry no transport code.
    pub fn stream(message: impl Into<String>) -> Self {
        Self::other(message)
    }

    pub fn with_cause_code(mut self, code: impl Into<String>) -> Self {
        self.cause_code = Some(code.into());
        self
    }

    /// The default retry predicate: transient transport failures and the
    /// usual overload/gateway HTTP statuses.
    ///
    /// Codes are checked on the error itself and on its nested cause; as a
    /// last resort a few well-known phrases are matched in the lowercased
    /// message, since some transports only surface text.
    pub fn retryable_by_default(&self) -> bool {
        const RETRYABLE_CODES: &[&str] = &[
            "ECONNRESET",
            "ECONNREFUSED",
            "ECONNABORTED",
            "ETIMEDOUT",
            "ENETUNREACH",
            "EHOSTUNREACH",
            "EPIPE",
            "EAI_AGAIN",
        ];
        const RETRYABLE_STATUS: &[u16] = &[408, 429, 500, 502, 503, 504, 529];

        if let Some(status) = self.status {
            if RETRYABLE_STATUS.contains(&status) {
                return true;
            }
        }
        let code_matches = |code: &Option<String>| {
            code.as_deref()
                .is_some_and(|c| RETRYABLE_CODES.contains(&c))
        };
        if code_matches(&self.code) || code_matches(&self.cause_code) {
            return true;
        }
        let lower = self.message.to_lowercase();
        ["timed out", "timeout", "connection reset", "connection refused", "socket hang up"]
            .iter()
            .any(|phrase| lower.contains(phrase))
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(e: reqwest::Error) -> Self {
        let code = if e.is_timeout() {
            Some("ETIMEDOUT".to_string())
        } else if e.is_connect() {
            Some("ECONNREFUSED".to_string())
        } else {
            None
        };
        Self {
            message: e.to_string(),
            status: e.status().map(|s| s.as_u16()),
            code,
            cause_code: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(StopReason::ToolUse).unwrap(),
            serde_json::json!("tool_use")
        );
        assert_eq!(StopReason::EndTurn.to_string(), "end_turn");
    }

    #[test]
    fn usage_missing_fields_count_as_zero() {
        let u = Usage::default();
        assert_eq!(u.input(), 0);
        assert_eq!(u.output(), 0);
    }

    #[test]
    fn usage_add_accumulates_per_field() {
        let mut total = Usage {
            input_tokens: Some(10),
            ..Default::default()
        };
        total.add(&Usage {
            input_tokens: Some(5),
            output_tokens: Some(7),
            ..Default::default()
        });
        assert_eq!(total.input(), 15);
        assert_eq!(total.output(), 7);
        assert!(total.cache_read_input_tokens.is_none());
    }

    #[test]
    fn retryable_statuses() {
        for status in [408, 429, 500, 502, 503, 504, 529] {
            assert!(RequestError::http(status, "x").retryable_by_default(), "{status}");
        }
        assert!(!RequestError::http(400, "bad request").retryable_by_default());
        assert!(!RequestError::http(401, "unauthorized").retryable_by_default());
    }

    #[test]
    fn retryable_transport_codes() {
        assert!(RequestError::network("ECONNRESET", "reset").retryable_by_default());
        assert!(RequestError::network("EAI_AGAIN", "dns").retryable_by_default());
        assert!(!RequestError::network("EACCES", "denied").retryable_by_default());
    }

    #[test]
    fn nested_cause_code_is_consulted() {
        let e = RequestError::other("wrapped").with_cause_code("ETIMEDOUT");
        assert!(e.retryable_by_default());
    }

    #[test]
    fn message_heuristic_matches_lowercased_phrases() {
        assert!(RequestError::other("Request Timed Out").retryable_by_default());
        assert!(RequestError::other("socket hang up").retryable_by_default());
        assert!(!RequestError::other("invalid api key").retryable_by_default());
    }
}
