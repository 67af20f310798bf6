// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use parley_model::ToolDefinition;

use crate::tool::ToolClass;

/// Central registry holding all tools a conversation may call.
pub struct Toolkit {
    classes: HashMap<String, Arc<dyn ToolClass>>,
}

impl Toolkit {
    pub fn new() -> Self {
        Self {
            classes: HashMap::new(),
        }
    }

    /// Register a tool class under its definition name.  Registering the
    /// same name twice replaces the earlier class.
    pub fn register(&mut self, class: impl ToolClass + 'static) {
        self.register_arc(Arc::new(class));
    }

    pub fn register_arc(&mut self, class: Arc<dyn ToolClass>) {
        self.classes.insert(class.definition().name, class);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolClass>> {
        self.classes.get(name).cloned()
    }

    /// Definitions for all registered tools, sorted by name so requests are
    /// deterministic.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.classes.values().map(|c| c.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Whether calls to `name` may run concurrently with their neighbours.
    /// Unknown tools default to parallelizable — they fail at execution
    /// time anyway, and a singleton batch would serialize for nothing.
    pub fn parallelizable(&self, name: &str) -> bool {
        self.classes
            .get(name)
            .map(|c| c.definition().parallelizable)
            .unwrap_or(true)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl Default for Toolkit {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{Map, Value};

    use parley_model::{ToolDefinition, ToolResult};

    use crate::tool::{Tool, ToolContext};

    use super::*;

    struct EchoClass {
        name: &'static str,
        parallelizable: bool,
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        async fn execute(&self, params: Map<String, Value>) -> ToolResult {
            ToolResult::output(Value::Object(params).to_string())
        }
    }

    impl ToolClass for EchoClass {
        fn definition(&self) -> ToolDefinition {
            let def = ToolDefinition::new(self.name, "echoes its input");
            if self.parallelizable {
                def
            } else {
                def.serial()
            }
        }

        fn instantiate(&self, _ctx: &ToolContext) -> std::sync::Arc<dyn Tool> {
            std::sync::Arc::new(EchoTool)
        }
    }

    fn toolkit() -> Toolkit {
        let mut kit = Toolkit::new();
        kit.register(EchoClass {
            name: "echo",
            parallelizable: true,
        });
        kit.register(EchoClass {
            name: "editor",
            parallelizable: false,
        });
        kit
    }

    #[test]
    fn register_and_get() {
        let kit = toolkit();
        assert!(kit.get("echo").is_some());
        assert!(kit.get("nope").is_none());
    }

    #[test]
    fn definitions_are_sorted_by_name() {
        let mut kit = Toolkit::new();
        kit.register(EchoClass {
            name: "zeta",
            parallelizable: true,
        });
        kit.register(EchoClass {
            name: "alpha",
            parallelizable: true,
        });
        let names: Vec<String> = kit.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn parallelizable_reads_the_definition() {
        let kit = toolkit();
        assert!(kit.parallelizable("echo"));
        assert!(!kit.parallelizable("editor"));
    }

    #[test]
    fn unknown_tools_default_to_parallelizable() {
        let kit = toolkit();
        assert!(kit.parallelizable("missing"));
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut kit = toolkit();
        kit.register(EchoClass {
            name: "echo",
            parallelizable: false,
        });
        assert_eq!(kit.names().iter().filter(|n| *n == "echo").count(), 1);
        assert!(!kit.parallelizable("echo"));
    }

    #[tokio::test]
    async fn instantiated_tool_executes() {
        let kit = toolkit();
        let class = kit.get("echo").unwrap();
        let tool = class.instantiate(&ToolContext::detached(Map::new()));
        let mut params = Map::new();
        params.insert("x".into(), serde_json::json!(1));
        let result = tool.execute(params).await;
        assert!(result.is_success());
    }
}
