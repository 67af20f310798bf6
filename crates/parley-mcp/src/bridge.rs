// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The bridge between a remote MCP-style tool server and parley's tool
//! contracts.  It sits at the seam between the wire protocol and
//! [`parley_tools`] so neither side needs to know about the other: the
//! transport implements [`ToolServer`], and the bridge turns every
//! advertised tool into a [`ToolClass`] whose `execute` forwards the call
//! and converts the textual reply into a [`ToolResult`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use parley_model::{ParamDef, ParamKind, ToolDefinition, ToolResult};
use parley_tools::{Tool, ToolClass, ToolContext, Toolkit};

/// A tool as advertised by a remote server: name, description, and the
/// raw JSON Schema of its input.
#[derive(Debug, Clone)]
pub struct RemoteToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// The outcome of a remote call: the server's textual reply plus its
/// error flag.
#[derive(Debug, Clone)]
pub struct RemoteCallOutcome {
    pub text: String,
    pub is_error: bool,
}

/// Abstract view of the remote server.  Concrete transports (stdio,
/// websocket, in-process) implement this; the bridge never sees the wire.
#[async_trait]
pub trait ToolServer: Send + Sync {
    async fn list_tools(&self) -> anyhow::Result<Vec<RemoteToolInfo>>;

    async fn call_tool(
        &self,
        name: &str,
        args: Map<String, Value>,
    ) -> anyhow::Result<RemoteCallOutcome>;
}

/// Builds [`ToolClass`]es from a server's advertised tools.
///
/// Remote tools default to parallelizable; override per name for tools
/// with server-side state that must not run concurrently.
pub struct McpToolBridge {
    server: Arc<dyn ToolServer>,
    parallelizable: HashMap<String, bool>,
}

impl McpToolBridge {
    pub fn new(server: Arc<dyn ToolServer>) -> Self {
        Self {
            server,
            parallelizable: HashMap::new(),
        }
    }

    pub fn with_parallelizable(mut self, name: impl Into<String>, parallelizable: bool) -> Self {
        self.parallelizable.insert(name.into(), parallelizable);
        self
    }

    /// One [`ToolClass`] per advertised tool.
    pub async fn tool_classes(&self) -> anyhow::Result<Vec<Arc<dyn ToolClass>>> {
        let tools = self.server.list_tools().await?;
        debug!(count = tools.len(), "bridging remote tools");
        Ok(tools
            .into_iter()
            .map(|info| {
                let parallelizable = self
                    .parallelizable
                    .get(&info.name)
                    .copied()
                    .unwrap_or(true);
                Arc::new(RemoteToolClass {
                    info,
                    parallelizable,
                    server: Arc::clone(&self.server),
                }) as Arc<dyn ToolClass>
            })
            .collect())
    }

    /// Register every advertised tool into a toolkit.  Returns how many
    /// were added.
    pub async fn register_into(&self, toolkit: &mut Toolkit) -> anyhow::Result<usize> {
        let classes = self.tool_classes().await?;
        let count = classes.len();
        for class in classes {
            toolkit.register_arc(class);
        }
        Ok(count)
    }
}

struct RemoteToolClass {
    info: RemoteToolInfo,
    parallelizable: bool,
    server: Arc<dyn ToolServer>,
}

impl ToolClass for RemoteToolClass {
    fn definition(&self) -> ToolDefinition {
        let def = ToolDefinition::new(self.info.name.clone(), self.info.description.clone())
            .with_parameters(params_from_schema(&self.info.input_schema));
        if self.parallelizable {
            def
        } else {
            def.serial()
        }
    }

    fn instantiate(&self, _ctx: &ToolContext) -> Arc<dyn Tool> {
        Arc::new(RemoteTool {
            name: self.info.name.clone(),
            server: Arc::clone(&self.server),
        })
    }
}

struct RemoteTool {
    name: String,
    server: Arc<dyn ToolServer>,
}

#[async_trait]
impl Tool for RemoteTool {
    async fn execute(&self, params: Map<String, Value>) -> ToolResult {
        match self.server.call_tool(&self.name, params).await {
            Ok(outcome) if outcome.is_error => ToolResult::fail(outcome.text),
            Ok(outcome) => ToolResult::output(outcome.text),
            Err(e) => ToolResult::fail(format!("remote tool call failed: {e}")),
        }
    }
}

// ─── JSON Schema translation ──────────────────────────────────────────────────

/// Best-effort translation of a JSON Schema object into parameter
/// definitions.  Unknown or missing types degrade to plain strings so a
/// creative server schema never breaks tool registration.
fn params_from_schema(schema: &Value) -> Vec<ParamDef> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    properties
        .iter()
        .map(|(name, prop)| {
            let mut def = ParamDef::new(name.clone(), kind_from_schema(prop));
            if required.contains(&name.as_str()) {
                def = def.required();
            }
            if let Some(description) = prop.get("description").and_then(Value::as_str) {
                def = def.with_description(description);
            }
            if let Some(default) = prop.get("default") {
                def = def.with_default(default.clone());
            }
            def
        })
        .collect()
}

fn kind_from_schema(prop: &Value) -> ParamKind {
    match prop.get("type").and_then(Value::as_str) {
        Some("number") | Some("integer") => ParamKind::Number,
        Some("boolean") => ParamKind::Boolean,
        Some("object") => ParamKind::Object {
            properties: params_from_schema(prop),
        },
        Some("array") => {
            let items = prop
                .get("items")
                .map(|items| ParamDef::new("items", kind_from_schema(items)))
                .unwrap_or_else(|| ParamDef::string("items"));
            ParamKind::Array {
                items: Box::new(items),
            }
        }
        _ => ParamKind::String {
            enum_values: prop.get("enum").and_then(Value::as_array).map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            }),
        },
    }
}

// ─── rmcp model conversions ───────────────────────────────────────────────────

/// Read an rmcp tool descriptor into bridge form.
pub fn info_from_mcp_tool(tool: &rmcp::model::Tool) -> RemoteToolInfo {
    RemoteToolInfo {
        name: tool.name.to_string(),
        description: tool
            .description
            .as_deref()
            .unwrap_or_default()
            .to_string(),
        input_schema: Value::Object((*tool.input_schema).clone()),
    }
}

/// Flatten an rmcp call result into the textual outcome the bridge
/// converts.  Non-text content items are skipped.
pub fn outcome_from_call_result(result: rmcp::model::CallToolResult) -> RemoteCallOutcome {
    let text = result
        .content
        .iter()
        .filter_map(|item| item.as_text().map(|t| t.text.clone()))
        .collect::<Vec<_>>()
        .join("\n");
    RemoteCallOutcome {
        text,
        is_error: result.is_error.unwrap_or(false),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    struct FakeServer {
        calls: Mutex<Vec<(String, Map<String, Value>)>>,
        reply: RemoteCallOutcome,
    }

    impl FakeServer {
        fn new(text: &str, is_error: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply: RemoteCallOutcome {
                    text: text.to_string(),
                    is_error,
                },
            })
        }
    }

    #[async_trait]
    impl ToolServer for FakeServer {
        async fn list_tools(&self) -> anyhow::Result<Vec<RemoteToolInfo>> {
            Ok(vec![
                RemoteToolInfo {
                    name: "search".into(),
                    description: "Searches things".into(),
                    input_schema: json!({
                        "type": "object",
                        "properties": {
                            "query": {"type": "string", "description": "What to find"},
                            "limit": {"type": "integer", "default": 10},
                        },
                        "required": ["query"],
                    }),
                },
                RemoteToolInfo {
                    name: "mutate".into(),
                    description: "Changes server state".into(),
                    input_schema: json!({"type": "object", "properties": {}}),
                },
            ])
        }

        async fn call_tool(
            &self,
            name: &str,
            args: Map<String, Value>,
        ) -> anyhow::Result<RemoteCallOutcome> {
            self.calls.lock().unwrap().push((name.to_string(), args));
            Ok(self.reply.clone())
        }
    }

    fn detached_ctx() -> ToolContext {
        ToolContext::detached(Map::new())
    }

    #[tokio::test]
    async fn bridge_exposes_one_class_per_remote_tool() {
        let bridge = McpToolBridge::new(FakeServer::new("ok", false));
        let classes = bridge.tool_classes().await.unwrap();
        let mut names: Vec<String> = classes.iter().map(|c| c.definition().name).collect();
        names.sort();
        assert_eq!(names, vec!["mutate", "search"]);
    }

    #[tokio::test]
    async fn remote_schema_translates_to_parameters() {
        let bridge = McpToolBridge::new(FakeServer::new("ok", false));
        let classes = bridge.tool_classes().await.unwrap();
        let search = classes
            .iter()
            .find(|c| c.definition().name == "search")
            .unwrap()
            .definition();

        let schema = search.input_schema();
        assert_eq!(schema["properties"]["query"]["type"], "string");
        assert_eq!(schema["properties"]["query"]["description"], "What to find");
        assert_eq!(schema["properties"]["limit"]["type"], "number");
        assert_eq!(schema["properties"]["limit"]["default"], 10);
        assert_eq!(schema["required"], json!(["query"]));
    }

    #[tokio::test]
    async fn parallelizable_is_configurable_per_name() {
        let bridge = McpToolBridge::new(FakeServer::new("ok", false))
            .with_parallelizable("mutate", false);
        let classes = bridge.tool_classes().await.unwrap();
        for class in classes {
            let def = class.definition();
            match def.name.as_str() {
                "mutate" => assert!(!def.parallelizable),
                _ => assert!(def.parallelizable),
            }
        }
    }

    #[tokio::test]
    async fn execute_forwards_and_wraps_success_as_output() {
        let server = FakeServer::new("found 3 results", false);
        let bridge = McpToolBridge::new(server.clone());
        let classes = bridge.tool_classes().await.unwrap();
        let search = classes
            .iter()
            .find(|c| c.definition().name == "search")
            .unwrap();

        let tool = search.instantiate(&detached_ctx());
        let mut args = Map::new();
        args.insert("query".into(), json!("rust"));
        let result = tool.execute(args).await;

        assert!(result.is_success());
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["output"], "found 3 results");
        let calls = server.calls.lock().unwrap();
        assert_eq!(calls[0].0, "search");
        assert_eq!(calls[0].1["query"], json!("rust"));
    }

    #[tokio::test]
    async fn server_error_flag_becomes_failure_result() {
        let bridge = McpToolBridge::new(FakeServer::new("file not found", true));
        let classes = bridge.tool_classes().await.unwrap();
        let tool = classes[0].instantiate(&detached_ctx());
        let result = tool.execute(Map::new()).await;
        assert_eq!(result.message(), Some("file not found"));
    }

    #[tokio::test]
    async fn register_into_fills_a_toolkit() {
        let bridge = McpToolBridge::new(FakeServer::new("ok", false));
        let mut toolkit = Toolkit::new();
        let count = bridge.register_into(&mut toolkit).await.unwrap();
        assert_eq!(count, 2);
        assert!(toolkit.get("search").is_some());
        assert!(toolkit.get("mutate").is_some());
    }

    // ── Schema edge cases ──────────────────────────────────────────────────

    #[test]
    fn schema_without_properties_yields_no_params() {
        assert!(params_from_schema(&json!({"type": "object"})).is_empty());
        assert!(params_from_schema(&json!("nonsense")).is_empty());
    }

    #[test]
    fn nested_arrays_and_objects_translate_recursively() {
        let params = params_from_schema(&json!({
            "type": "object",
            "properties": {
                "entries": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {"path": {"type": "string"}},
                        "required": ["path"],
                    },
                },
            },
        }));
        assert_eq!(params.len(), 1);
        match &params[0].kind {
            ParamKind::Array { items } => match &items.kind {
                ParamKind::Object { properties } => {
                    assert_eq!(properties[0].name, "path");
                    assert!(properties[0].required);
                }
                other => panic!("expected object items, got {other:?}"),
            },
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn enum_values_survive_translation() {
        let params = params_from_schema(&json!({
            "properties": {"mode": {"type": "string", "enum": ["fast", "safe"]}},
        }));
        match &params[0].kind {
            ParamKind::String { enum_values } => {
                assert_eq!(enum_values.as_deref(), Some(&["fast".to_string(), "safe".to_string()][..]));
            }
            other => panic!("expected string, got {other:?}"),
        }
    }

    // ── rmcp conversions ───────────────────────────────────────────────────

    #[test]
    fn mcp_tool_descriptor_converts() {
        let mut schema = serde_json::Map::new();
        schema.insert("type".into(), json!("object"));
        let tool = rmcp::model::Tool::new(
            std::borrow::Cow::Borrowed("read_file"),
            std::borrow::Cow::Borrowed("Reads a file"),
            Arc::new(schema),
        );
        let info = info_from_mcp_tool(&tool);
        assert_eq!(info.name, "read_file");
        assert_eq!(info.description, "Reads a file");
        assert_eq!(info.input_schema["type"], "object");
    }

    #[test]
    fn call_result_text_flattens() {
        let result = rmcp::model::CallToolResult::success(vec![
            rmcp::model::Content::text("line one"),
            rmcp::model::Content::text("line two"),
        ]);
        let outcome = outcome_from_call_result(result);
        assert!(!outcome.is_error);
        assert_eq!(outcome.text, "line one\nline two");
    }
}
