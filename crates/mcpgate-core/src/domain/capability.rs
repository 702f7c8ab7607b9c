//! Capability descriptors discovered from upstream servers.
//!
//! Schemas are opaque JSON to the gateway; field names follow the MCP wire
//! format so these types round-trip through `serde_json` against the SDK's
//! model types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool advertised by an upstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// A resource advertised by an upstream server. URIs are already
/// schema-qualified and pass through the gateway unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A prompt advertised by an upstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<PromptArgument>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

/// A capability annotated with the upstream server that owns it.
///
/// Aggregated queries return these so callers never hold aliases into live
/// session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotated<T> {
    pub server_id: String,
    pub server_name: String,
    #[serde(flatten)]
    pub item: T,
}

impl<T> Annotated<T> {
    pub fn new(server_id: impl Into<String>, server_name: impl Into<String>, item: T) -> Self {
        Self {
            server_id: server_id.into(),
            server_name: server_name.into(),
            item,
        }
    }
}

pub type AggregatedTool = Annotated<ToolInfo>;
pub type AggregatedResource = Annotated<ResourceInfo>;
pub type AggregatedPrompt = Annotated<PromptInfo>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_info_uses_wire_field_names() {
        let tool: ToolInfo = serde_json::from_value(json!({
            "name": "search",
            "description": "Search things",
            "inputSchema": { "type": "object" }
        }))
        .unwrap();
        assert_eq!(tool.name, "search");
        assert!(tool.input_schema.is_some());

        let back = serde_json::to_value(&tool).unwrap();
        assert!(back.get("inputSchema").is_some());
    }

    #[test]
    fn annotated_flattens_item() {
        let agg = AggregatedTool::new(
            "id1",
            "GitHub",
            ToolInfo {
                name: "search".to_string(),
                description: None,
                input_schema: None,
            },
        );
        let value = serde_json::to_value(&agg).unwrap();
        assert_eq!(value["serverId"], "id1");
        assert_eq!(value["name"], "search");
    }
}
