// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// The shape of a single tool parameter.  Recursive: objects and arrays
/// nest further [`ParamDef`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    String {
        #[serde(
            rename = "enum",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        enum_values: Option<Vec<String>>,
    },
    Number,
    Boolean,
    Object {
        properties: Vec<ParamDef>,
    },
    Array {
        items: Box<ParamDef>,
    },
}

/// A named, typed tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParamKind,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamDef {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            description: None,
            default: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::String { enum_values: None })
    }

    pub fn string_enum(name: impl Into<String>, values: &[&str]) -> Self {
        Self::new(
            name,
            ParamKind::String {
                enum_values: Some(values.iter().map(|v| v.to_string()).collect()),
            },
        )
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Boolean)
    }

    pub fn object(name: impl Into<String>, properties: Vec<ParamDef>) -> Self {
        Self::new(name, ParamKind::Object { properties })
    }

    pub fn array(name: impl Into<String>, items: ParamDef) -> Self {
        Self::new(
            name,
            ParamKind::Array {
                items: Box::new(items),
            },
        )
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// JSON Schema fragment for this parameter (without the name key).
    fn schema_value(&self) -> Value {
        let mut schema = match &self.kind {
            ParamKind::String { enum_values } => {
                let mut s = json!({"type": "string"});
                if let Some(values) = enum_values {
                    s["enum"] = json!(values);
                }
                s
            }
            ParamKind::Number => json!({"type": "number"}),
            ParamKind::Boolean => json!({"type": "boolean"}),
            ParamKind::Object { properties } => object_schema(properties),
            ParamKind::Array { items } => json!({
                "type": "array",
                "items": items.schema_value(),
            }),
        };
        if let Some(description) = &self.description {
            schema["description"] = json!(description);
        }
        if let Some(default) = &self.default {
            schema["default"] = default.clone();
        }
        schema
    }
}

fn object_schema(properties: &[ParamDef]) -> Value {
    let mut props = Map::new();
    let mut required: Vec<&str> = Vec::new();
    for p in properties {
        props.insert(p.name.clone(), p.schema_value());
        if p.required {
            required.push(&p.name);
        }
    }
    let mut schema = json!({"type": "object", "properties": props});
    if !required.is_empty() {
        schema["required"] = json!(required);
    }
    schema
}

fn default_parallelizable() -> bool {
    true
}

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParamDef>,
    /// Whether calls to this tool may run concurrently with neighbouring
    /// calls from the same assistant message.  Non-parallelizable tools form
    /// their own execution batch.
    #[serde(default = "default_parallelizable")]
    pub parallelizable: bool,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            parallelizable: true,
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<ParamDef>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn serial(mut self) -> Self {
        self.parallelizable = false;
        self
    }

    /// The JSON Schema object handed to providers as the tool's input schema.
    pub fn input_schema(&self) -> Value {
        object_schema(&self.parameters)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn flat_schema_lists_properties_and_required() {
        let def = ToolDefinition::new("get_weather", "Current weather").with_parameters(vec![
            ParamDef::string("city")
                .required()
                .with_description("City name"),
            ParamDef::boolean("metric").with_default(json!(true)),
        ]);
        let schema = def.input_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["city"]["type"], "string");
        assert_eq!(schema["properties"]["city"]["description"], "City name");
        assert_eq!(schema["properties"]["metric"]["default"], true);
        assert_eq!(schema["required"], json!(["city"]));
    }

    #[test]
    fn no_required_params_omits_required_key() {
        let def = ToolDefinition::new("noop", "does nothing")
            .with_parameters(vec![ParamDef::string("hint")]);
        assert!(def.input_schema().get("required").is_none());
    }

    #[test]
    fn enum_values_appear_in_schema() {
        let def = ToolDefinition::new("set_mode", "switch mode")
            .with_parameters(vec![ParamDef::string_enum("mode", &["fast", "safe"])]);
        assert_eq!(
            def.input_schema()["properties"]["mode"]["enum"],
            json!(["fast", "safe"])
        );
    }

    #[test]
    fn nested_object_and_array_schemas_recurse() {
        let def = ToolDefinition::new("batch", "run items").with_parameters(vec![
            ParamDef::array(
                "items",
                ParamDef::object(
                    "item",
                    vec![ParamDef::string("name").required(), ParamDef::number("count")],
                ),
            )
            .required(),
        ]);
        let schema = def.input_schema();
        let items = &schema["properties"]["items"]["items"];
        assert_eq!(items["type"], "object");
        assert_eq!(items["properties"]["name"]["type"], "string");
        assert_eq!(items["required"], json!(["name"]));
    }

    #[test]
    fn parallelizable_defaults_to_true_on_deserialize() {
        let def: ToolDefinition = serde_json::from_value(json!({
            "name": "t",
            "description": "d",
            "parameters": [],
        }))
        .unwrap();
        assert!(def.parallelizable);
    }

    #[test]
    fn serial_marks_tool_non_parallelizable() {
        let def = ToolDefinition::new("editor", "edits files").serial();
        assert!(!def.parallelizable);
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["parallelizable"], false);
    }

    #[test]
    fn param_def_round_trips() {
        let p = ParamDef::object(
            "config",
            vec![ParamDef::string_enum("level", &["a", "b"]).required()],
        )
        .with_description("config block");
        let json = serde_json::to_string(&p).unwrap();
        let back: ParamDef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
