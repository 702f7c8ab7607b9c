//! Built-in `gateway__` meta-tools.
//!
//! `tools/list` stays cheap by advertising upstream tools with compacted
//! descriptions; these three tools are the on-demand detail channel. New
//! meta-tools must preserve that split: terse listing, detail on request.

use rmcp::model::{CallToolResult, Content, Tool};
use serde_json::{json, Value};

use mcpgate_core::routing::{normalize_prefix, prefix_name};

use crate::gateway::Gateway;

pub const META_LIST_SERVERS: &str = "gateway__list_servers";
pub const META_SEARCH_TOOLS: &str = "gateway__search_tools";
pub const META_GET_SERVER_TOOLS: &str = "gateway__get_server_tools";

const DEFAULT_SEARCH_LIMIT: usize = 20;

pub fn is_meta_tool(name: &str) -> bool {
    matches!(
        name,
        META_LIST_SERVERS | META_SEARCH_TOOLS | META_GET_SERVER_TOOLS
    )
}

/// Tool definitions, listed ahead of upstream tools with their full
/// descriptions.
pub fn meta_tool_definitions() -> Vec<Tool> {
    let defs = json!([
        {
            "name": META_LIST_SERVERS,
            "description": "List every registered upstream MCP server with its connection \
                            status, tool prefix, and capability counts. Start here to see \
                            what this gateway aggregates.",
            "inputSchema": { "type": "object", "properties": {}, "additionalProperties": false }
        },
        {
            "name": META_SEARCH_TOOLS,
            "description": "Search all upstream tools by name and description. Every \
                            whitespace-separated word of the query must match. Returns full \
                            descriptions and input schemas, unlike the compact tools/list.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Words to match against tool names and descriptions" },
                    "server": { "type": "string", "description": "Restrict to servers whose prefix contains this substring" },
                    "limit": { "type": "integer", "description": "Maximum number of results (default 20)" }
                },
                "required": ["query"]
            }
        },
        {
            "name": META_GET_SERVER_TOOLS,
            "description": "Return every tool of the servers whose prefix contains the given \
                            substring, grouped by server, with full descriptions and schemas.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "server": { "type": "string", "description": "Substring of the server prefix" }
                },
                "required": ["server"]
            }
        }
    ]);
    serde_json::from_value(defs).unwrap_or_default()
}

/// Dispatch a meta-tool call. Meta-tools are internal: they are never
/// request-logged and failures surface as `isError` content.
pub async fn call_meta_tool(gateway: &Gateway, name: &str, arguments: &Value) -> CallToolResult {
    match name {
        META_LIST_SERVERS => list_servers(gateway).await,
        META_SEARCH_TOOLS => search_tools(gateway, arguments).await,
        META_GET_SERVER_TOOLS => get_server_tools(gateway, arguments).await,
        _ => error_result(format!("unknown meta tool: {name}")),
    }
}

async fn list_servers(gateway: &Gateway) -> CallToolResult {
    let statuses = gateway.get_all_server_statuses().await;
    let connected = statuses.iter().filter(|s| s.status.is_connected()).count();

    let rows: Vec<Value> = statuses
        .iter()
        .map(|s| {
            json!({
                "name": s.name,
                "prefix": normalize_prefix(&s.name),
                "status": s.status.as_str(),
                "transport": s.transport.as_str(),
                "tools": s.tools,
                "resources": s.resources,
                "prompts": s.prompts,
            })
        })
        .collect();

    let text = format!(
        "{connected} of {} server(s) connected\n{}",
        statuses.len(),
        serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
    );
    CallToolResult::success(vec![Content::text(text)])
}

async fn search_tools(gateway: &Gateway, arguments: &Value) -> CallToolResult {
    let Some(query) = arguments.get("query").and_then(Value::as_str) else {
        return error_result("missing required argument: query");
    };
    let server_filter = arguments
        .get("server")
        .and_then(Value::as_str)
        .map(str::to_lowercase);
    let limit = arguments
        .get("limit")
        .and_then(Value::as_u64)
        .map(|l| l as usize)
        .unwrap_or(DEFAULT_SEARCH_LIMIT);

    let words: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();

    let hits: Vec<Value> = gateway
        .get_all_tools()
        .await
        .iter()
        .filter(|tool| {
            if let Some(filter) = &server_filter {
                if !normalize_prefix(&tool.server_name).contains(filter) {
                    return false;
                }
            }
            let prefixed = prefix_name(&tool.server_name, &tool.item.name);
            let haystack = format!(
                "{} {} {}",
                tool.item.name,
                prefixed,
                tool.item.description.as_deref().unwrap_or_default()
            )
            .to_lowercase();
            words.iter().all(|w| haystack.contains(w))
        })
        .take(limit)
        .map(|tool| {
            json!({
                "name": prefix_name(&tool.server_name, &tool.item.name),
                "server": tool.server_name,
                "description": tool.item.description,
                "inputSchema": tool.item.input_schema,
            })
        })
        .collect();

    let text = if hits.is_empty() {
        format!("No tools matched {query:?}")
    } else {
        serde_json::to_string_pretty(&hits).unwrap_or_else(|_| "[]".to_string())
    };
    CallToolResult::success(vec![Content::text(text)])
}

async fn get_server_tools(gateway: &Gateway, arguments: &Value) -> CallToolResult {
    let Some(server) = arguments.get("server").and_then(Value::as_str) else {
        return error_result("missing required argument: server");
    };
    let needle = server.to_lowercase();

    let mut groups = serde_json::Map::new();
    for tool in gateway.get_all_tools().await {
        if !normalize_prefix(&tool.server_name).contains(&needle) {
            continue;
        }
        let entry = groups
            .entry(tool.server_name.clone())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = entry {
            list.push(json!({
                "name": prefix_name(&tool.server_name, &tool.item.name),
                "description": tool.item.description,
                "inputSchema": tool.item.input_schema,
            }));
        }
    }

    let text = if groups.is_empty() {
        format!("No servers matched {server:?}")
    } else {
        serde_json::to_string_pretty(&Value::Object(groups)).unwrap_or_else(|_| "{}".to_string())
    };
    CallToolResult::success(vec![Content::text(text)])
}

fn error_result(message: impl Into<String>) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(message.into())],
        structured_content: None,
        is_error: Some(true),
        meta: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitions_deserialize_into_tools() {
        let defs = meta_tool_definitions();
        assert_eq!(defs.len(), 3);
        assert_eq!(defs[0].name, META_LIST_SERVERS);
        assert!(is_meta_tool(&defs[1].name));
        assert!(!is_meta_tool("github__search"));
    }
}
