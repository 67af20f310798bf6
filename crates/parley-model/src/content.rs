use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

// ─── Tool results ─────────────────────────────────────────────────────────────

/// The outcome of a tool execution, as seen by the model.
///
/// Serializes as `{"result": true, …extra}` on success and
/// `{"result": false, "message": …, "error"?: …}` on failure, so the model
/// always receives a `result` discriminator it can branch on.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Success(Map<String, Value>),
    Failure {
        message: String,
        error: Option<Value>,
    },
}

impl ToolResult {
    /// Successful result with no extra payload.
    pub fn ok() -> Self {
        Self::Success(Map::new())
    }

    /// Successful result carrying extra fields (merged beside `result`).
    pub fn ok_with(extra: Map<String, Value>) -> Self {
        Self::Success(extra)
    }

    /// Successful result with a single `output` text field.  This is the
    /// shape remote tool bridges produce from textual server replies.
    pub fn output(text: impl Into<String>) -> Self {
        let mut extra = Map::new();
        extra.insert("output".into(), Value::String(text.into()));
        Self::Success(extra)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
            error: None,
        }
    }

    pub fn fail_with_error(message: impl Into<String>, error: Value) -> Self {
        Self::Failure {
            message: message.into(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The failure message, if this is a failure.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Failure { message, .. } => Some(message),
            Self::Success(_) => None,
        }
    }
}

impl Serialize for ToolResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = Map::new();
        match self {
            Self::Success(extra) => {
                map.insert("result".into(), Value::Bool(true));
                for (k, v) in extra {
                    map.insert(k.clone(), v.clone());
                }
            }
            Self::Failure { message, error } => {
                map.insert("result".into(), Value::Bool(false));
                map.insert("message".into(), Value::String(message.clone()));
                if let Some(error) = error {
                    map.insert("error".into(), error.clone());
                }
            }
        }
        map.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ToolResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut map = Map::deserialize(deserializer)?;
        let result = map
            .remove("result")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| serde::de::Error::custom("tool result requires a boolean `result`"))?;
        if result {
            Ok(Self::Success(map))
        } else {
            let message = match map.remove("message") {
                Some(Value::String(s)) => s,
                _ => String::new(),
            };
            Ok(Self::Failure {
                message,
                error: map.remove("error"),
            })
        }
    }
}

// ─── Content blocks ───────────────────────────────────────────────────────────

/// Message author role.  There is no system role; the system prompt travels
/// on the request, not in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// The tagged payload of a content block.
///
/// - `Text` — plain text (any role)
/// - `Thinking` — model reasoning (assistant only)
/// - `Tool` — a tool invocation request (assistant only)
/// - `ToolResult` — the reply to a tool request (user only)
/// - `Raw` — opaque provider payload tagged with the producing model kind,
///   carried through untouched so provider-specific features survive the
///   normalized model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBody {
    Text {
        text: String,
    },
    Thinking {
        thought: String,
    },
    Tool {
        tool_request_id: String,
        tool: String,
        params: Map<String, Value>,
    },
    ToolResult {
        tool_request_id: String,
        tool: String,
        result: ToolResult,
    },
    Raw {
        model_kind: String,
        data: String,
    },
}

impl ContentBody {
    /// Whether this variant may appear in a message of the given role.
    pub fn allowed_for(&self, role: Role) -> bool {
        match self {
            ContentBody::Text { .. } | ContentBody::Raw { .. } => true,
            ContentBody::Thinking { .. } | ContentBody::Tool { .. } => role == Role::Assistant,
            ContentBody::ToolResult { .. } => role == Role::User,
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            ContentBody::Text { .. } => "text",
            ContentBody::Thinking { .. } => "thinking",
            ContentBody::Tool { .. } => "tool",
            ContentBody::ToolResult { .. } => "tool_result",
            ContentBody::Raw { .. } => "raw",
        }
    }
}

/// A single content block: a tagged body plus identity and adornments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(flatten)]
    pub body: ContentBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Provider-specific adornments (e.g. thinking signatures, citations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<Map<String, Value>>,
}

impl Content {
    pub fn new(body: ContentBody) -> Self {
        Self {
            body,
            id: None,
            timestamp: None,
            extended: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(ContentBody::Text { text: text.into() })
    }

    pub fn thinking(thought: impl Into<String>) -> Self {
        Self::new(ContentBody::Thinking {
            thought: thought.into(),
        })
    }

    pub fn tool(
        tool_request_id: impl Into<String>,
        tool: impl Into<String>,
        params: Map<String, Value>,
    ) -> Self {
        Self::new(ContentBody::Tool {
            tool_request_id: tool_request_id.into(),
            tool: tool.into(),
            params,
        })
    }

    pub fn tool_result(
        tool_request_id: impl Into<String>,
        tool: impl Into<String>,
        result: ToolResult,
    ) -> Self {
        Self::new(ContentBody::ToolResult {
            tool_request_id: tool_request_id.into(),
            tool: tool.into(),
            result,
        })
    }

    pub fn raw(model_kind: impl Into<String>, data: impl Into<String>) -> Self {
        Self::new(ContentBody::Raw {
            model_kind: model_kind.into(),
            data: data.into(),
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_extended(mut self, extended: Map<String, Value>) -> Self {
        self.extended = Some(extended);
        self
    }

    /// The block's identity: the supplied id, or a stable hash of the body.
    ///
    /// The hash covers only the tagged body, so adding a timestamp or
    /// extended adornments never changes a block's identity.
    pub fn stable_id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => hash_json(&self.body),
        }
    }

    /// Fill in identity and timestamp if absent.  Called when a block enters
    /// conversation history; stored blocks are never re-stamped.
    pub fn stamp(&mut self) {
        if self.id.is_none() {
            self.id = Some(hash_json(&self.body));
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
    }

    /// Plain text of a `Text` block.
    pub fn as_text(&self) -> Option<&str> {
        match &self.body {
            ContentBody::Text { text } => Some(text),
            _ => None,
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// Errors from message construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("content variant `{variant}` is not allowed in a {role} message")]
    RoleMismatch { role: Role, variant: &'static str },
}

/// A single turn in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Construct a message, validating that every content variant is legal
    /// for the role.
    pub fn new(role: Role, content: Vec<Content>) -> Result<Self, ContentError> {
        for block in &content {
            if !block.body.allowed_for(role) {
                return Err(ContentError::RoleMismatch {
                    role,
                    variant: block.body.variant_name(),
                });
            }
        }
        Ok(Self {
            role,
            content,
            id: None,
            timestamp: None,
        })
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![Content::text(text)],
            id: None,
            timestamp: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![Content::text(text)],
            id: None,
            timestamp: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The message's identity: the supplied id, or a stable hash over the
    /// role and the content block identities.
    ///
    /// Identity is computed from the *original* content — context
    /// transformers rewrite outgoing copies and never cause a re-hash, so a
    /// persisted message keeps its id across transformer changes.
    pub fn stable_id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => {
                let parts: Vec<String> = self.content.iter().map(|c| c.stable_id()).collect();
                hash_json(&(self.role, parts))
            }
        }
    }

    /// Fill in identity and timestamps if absent, recursing into content.
    pub fn stamp(&mut self) {
        for block in &mut self.content {
            block.stamp();
        }
        if self.id.is_none() {
            self.id = Some(self.stable_id());
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
    }

    /// Concatenated text of all `Text` blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(Content::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// All `Tool` request blocks, in order.
    pub fn tool_requests(&self) -> Vec<&Content> {
        self.content
            .iter()
            .filter(|c| matches!(c.body, ContentBody::Tool { .. }))
            .collect()
    }

    pub fn has_tool_requests(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c.body, ContentBody::Tool { .. }))
    }
}

/// Stable 16-hex-char digest of a serializable value.
///
/// serde_json maps are BTreeMap-backed, so object keys serialize in sorted
/// order and the digest is deterministic for equal values.
fn hash_json<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex::encode(&digest[..8])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
