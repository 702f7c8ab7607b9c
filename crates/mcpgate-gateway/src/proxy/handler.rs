//! Downstream-facing MCP server handler.
//!
//! Each downstream session gets a clone of this handler through rmcp's
//! `StreamableHttpService`. Requests fan out to the gateway: tool and
//! prompt names are resolved through their prefixes, resource URIs pass
//! through unchanged. Tool failures come back as `isError` content per MCP
//! ergonomics; resource and prompt failures are JSON-RPC errors.

use std::sync::Arc;

use rmcp::model::*;
use rmcp::service::{NotificationContext, RequestContext};
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use mcpgate_core::request_log::{RequestKind, RequestStart};
use mcpgate_core::{routing, GatewayError, RequestLog};

use crate::gateway::Gateway;

use super::meta;
use super::notifier::ProxyNotifier;

/// Handler bound to every downstream MCP session.
#[derive(Clone)]
pub struct ProxyHandler {
    gateway: Arc<Gateway>,
    notifier: Arc<ProxyNotifier>,
    request_log: Arc<RequestLog>,
}

impl ProxyHandler {
    pub fn new(
        gateway: Arc<Gateway>,
        notifier: Arc<ProxyNotifier>,
        request_log: Arc<RequestLog>,
    ) -> Self {
        Self {
            gateway,
            notifier,
            request_log,
        }
    }

    /// Highest protocol version both sides support.
    fn negotiate_protocol_version(&self, client_version_str: &str) -> ProtocolVersion {
        let our_max = ProtocolVersion::LATEST;
        let our_max_str = our_max.to_string();
        if client_version_str > our_max_str.as_str() {
            debug!(
                client_version = %client_version_str,
                our_max = %our_max_str,
                "client speaks a newer protocol; negotiating down"
            );
            our_max
        } else {
            serde_json::from_value(Value::String(client_version_str.to_string()))
                .unwrap_or(our_max)
        }
    }

    fn error_content(message: impl Into<String>) -> CallToolResult {
        CallToolResult {
            content: vec![Content::text(message.into())],
            structured_content: None,
            is_error: Some(true),
            meta: None,
        }
    }
}

impl ServerHandler for ProxyHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools_with(ToolsCapability {
                    list_changed: Some(true),
                })
                .enable_prompts_with(PromptsCapability {
                    list_changed: Some(true),
                })
                .enable_resources_with(ResourcesCapability {
                    subscribe: Some(false),
                    list_changed: Some(true),
                })
                .build(),
            server_info: Implementation {
                name: "mcpgate".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "mcpgate aggregates multiple MCP servers. Tools and prompts carry a \
                 <server>__ prefix; use gateway__search_tools and \
                 gateway__get_server_tools for full descriptions and schemas."
                    .to_string(),
            ),
        }
    }

    async fn initialize(
        &self,
        params: InitializeRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        let negotiated = self.negotiate_protocol_version(&params.protocol_version.to_string());
        debug!(protocol_version = %negotiated, "downstream client initializing");

        let info = self.get_info();
        Ok(InitializeResult {
            protocol_version: negotiated,
            capabilities: info.capabilities,
            server_info: info.server_info,
            instructions: info.instructions,
        })
    }

    async fn on_initialized(&self, context: NotificationContext<RoleServer>) {
        // hashes first, so the session doesn't get a spurious blast for
        // state that predates it
        self.notifier.prime_hashes().await;
        let session_id = self.notifier.register_peer(Arc::new(context.peer));
        info!(downstream_session = %session_id, "downstream client initialized");
    }

    async fn list_tools(
        &self,
        _params: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        // meta-tools first with full descriptions, then upstream tools
        // grouped per server with compacted provenance-tagged descriptions
        let mut tools = meta::meta_tool_definitions();

        for aggregated in self.gateway.get_all_tools().await {
            let prefixed = routing::prefix_name(&aggregated.server_name, &aggregated.item.name);
            let description = routing::compact_description(&routing::annotate_description(
                &aggregated.server_name,
                aggregated.item.description.as_deref(),
            ));
            let schema = aggregated
                .item
                .input_schema
                .clone()
                .unwrap_or_else(|| json!({ "type": "object" }));

            match serde_json::from_value::<Tool>(json!({
                "name": prefixed,
                "description": description,
                "inputSchema": schema,
            })) {
                Ok(tool) => tools.push(tool),
                Err(e) => warn!(tool = %prefixed, error = %e, "skipping unconvertible tool"),
            }
        }

        debug!(count = tools.len(), "list_tools");
        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(
        &self,
        params: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let name = params.name.to_string();
        let arguments = params
            .arguments
            .map(Value::Object)
            .unwrap_or_else(|| json!({}));

        info!(tool = %name, "call_tool");

        if meta::is_meta_tool(&name) {
            return Ok(meta::call_meta_tool(&self.gateway, &name, &arguments).await);
        }

        let tools = self.gateway.get_all_tools().await;
        let Some(target) = routing::resolve_tool(&tools, &name) else {
            // unresolvable names are tool-level errors, not JSON-RPC errors
            return Ok(Self::error_content(format!("unknown tool: {name}")));
        };

        let log_id = self.request_log.start(RequestStart {
            kind: RequestKind::Tool,
            method: name.clone(),
            original_method: Some(target.item.name.clone()),
            server_id: target.server_id.clone(),
            server_name: target.server_name.clone(),
            arguments: arguments.clone(),
            downstream_session_id: None,
        });

        match self
            .gateway
            .call_tool(&target.server_id, &target.item.name, Some(arguments))
            .await
        {
            Ok(result) => {
                let response = serde_json::to_value(&result).unwrap_or(Value::Null);
                self.request_log.complete(&log_id, response);
                Ok(result)
            }
            Err(e) => {
                self.request_log.fail(&log_id, e.to_string());
                Ok(Self::error_content(format!("tool call failed: {e}")))
            }
        }
    }

    async fn list_resources(
        &self,
        _params: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        let mut resources = Vec::new();
        for aggregated in self.gateway.get_all_resources().await {
            let description = routing::annotate_description(
                &aggregated.server_name,
                aggregated.item.description.as_deref(),
            );
            match serde_json::from_value::<Resource>(json!({
                "uri": aggregated.item.uri,
                "name": aggregated.item.name,
                "description": description,
                "mimeType": aggregated.item.mime_type,
            })) {
                Ok(resource) => resources.push(resource),
                Err(e) => {
                    warn!(uri = %aggregated.item.uri, error = %e, "skipping unconvertible resource")
                }
            }
        }

        debug!(count = resources.len(), "list_resources");
        Ok(ListResourcesResult::with_all_items(resources))
    }

    async fn read_resource(
        &self,
        params: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let uri = params.uri.to_string();
        let Some(owner) = self.gateway.find_resource(&uri).await else {
            return Err(McpError::invalid_params(
                format!("resource '{uri}' not found"),
                None,
            ));
        };

        let log_id = self.request_log.start(RequestStart {
            kind: RequestKind::Resource,
            method: uri.clone(),
            original_method: None,
            server_id: owner.server_id.clone(),
            server_name: owner.server_name.clone(),
            arguments: json!({ "uri": uri }),
            downstream_session_id: None,
        });

        match self.gateway.read_resource(&owner.server_id, &uri).await {
            Ok(result) => {
                self.request_log
                    .complete(&log_id, serde_json::to_value(&result).unwrap_or(Value::Null));
                Ok(result)
            }
            Err(e) => {
                self.request_log.fail(&log_id, e.to_string());
                Err(map_rpc_error(e))
            }
        }
    }

    async fn list_prompts(
        &self,
        _params: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        let mut prompts = Vec::new();
        for aggregated in self.gateway.get_all_prompts().await {
            let prefixed = routing::prefix_name(&aggregated.server_name, &aggregated.item.name);
            let description = routing::compact_description(&routing::annotate_description(
                &aggregated.server_name,
                aggregated.item.description.as_deref(),
            ));
            match serde_json::from_value::<Prompt>(json!({
                "name": prefixed,
                "description": description,
                "arguments": aggregated.item.arguments,
            })) {
                Ok(prompt) => prompts.push(prompt),
                Err(e) => warn!(prompt = %prefixed, error = %e, "skipping unconvertible prompt"),
            }
        }

        debug!(count = prompts.len(), "list_prompts");
        Ok(ListPromptsResult::with_all_items(prompts))
    }

    async fn get_prompt(
        &self,
        params: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        let name = params.name.to_string();
        let prompts = self.gateway.get_all_prompts().await;
        let Some(target) = routing::resolve_prompt(&prompts, &name) else {
            return Err(McpError::invalid_params(
                format!("prompt '{name}' not found"),
                None,
            ));
        };

        let log_id = self.request_log.start(RequestStart {
            kind: RequestKind::Prompt,
            method: name.clone(),
            original_method: Some(target.item.name.clone()),
            server_id: target.server_id.clone(),
            server_name: target.server_name.clone(),
            arguments: params
                .arguments
                .clone()
                .map(Value::Object)
                .unwrap_or_else(|| json!({})),
            downstream_session_id: None,
        });

        match self
            .gateway
            .get_prompt(&target.server_id, &target.item.name, params.arguments)
            .await
        {
            Ok(result) => {
                self.request_log
                    .complete(&log_id, serde_json::to_value(&result).unwrap_or(Value::Null));
                Ok(result)
            }
            Err(e) => {
                self.request_log.fail(&log_id, e.to_string());
                Err(map_rpc_error(e))
            }
        }
    }
}

/// Resource/prompt failures become JSON-RPC errors: unknown names are
/// `invalid_params`, everything upstream-side is `internal_error`.
fn map_rpc_error(e: GatewayError) -> McpError {
    match &e {
        GatewayError::NoSuchResource(_)
        | GatewayError::NoSuchPrompt(_)
        | GatewayError::NoSuchTool(_) => McpError::invalid_params(e.to_string(), None),
        _ => McpError::internal_error(e.to_string(), None),
    }
}
