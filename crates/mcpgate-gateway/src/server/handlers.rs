//! HTTP handlers for the REST control surface.
//!
//! Every response uses the `{success, data?, error?}` envelope; gateway
//! errors map onto meaningful status codes.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use mcpgate_core::request_log::LogFilter;
use mcpgate_core::{EventBus, GatewayError, RequestLog, ServerPatch};

use crate::gateway::{Gateway, NewServerRequest};
use crate::proxy::ProxyNotifier;

/// Shared state for all REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub notifier: Arc<ProxyNotifier>,
    pub request_log: Arc<RequestLog>,
    pub events: EventBus,
    pub started_at: Instant,
}

/// Uniform REST envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

/// A gateway error with its HTTP status.
pub struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::ConfigNotFound(_)
            | GatewayError::NoSuchTool(_)
            | GatewayError::NoSuchResource(_)
            | GatewayError::NoSuchPrompt(_) => StatusCode::NOT_FOUND,
            GatewayError::DuplicateName(_) => StatusCode::CONFLICT,
            GatewayError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotConnected(_) | GatewayError::AwaitingOauth(_) => {
                StatusCode::CONFLICT
            }
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream { .. } | GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::OAuth { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::StorePersist(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ApiResponse::<Value> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
        });
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ----------------------------------------------------------------------
// Health
// ----------------------------------------------------------------------

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let statuses = state.gateway.get_all_server_statuses().await;
    let connected = statuses.iter().filter(|s| s.status.is_connected()).count();
    Json(json!({
        "status": "ok",
        "servers": { "total": statuses.len(), "connected": connected },
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

// ----------------------------------------------------------------------
// Server CRUD & lifecycle
// ----------------------------------------------------------------------

pub async fn list_servers(State(state): State<AppState>) -> ApiResult<Value> {
    let statuses = state.gateway.get_all_server_statuses().await;
    Ok(ApiResponse::ok(json!(statuses)))
}

pub async fn create_server(
    State(state): State<AppState>,
    Json(request): Json<NewServerRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Value>>), ApiError> {
    info!(name = %request.name, "creating server");
    let config = state.gateway.register_server(request).await?;
    let Json(body) = ApiResponse::ok(json!(config));
    Ok((StatusCode::CREATED, Json(body)))
}

pub async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let status = state
        .gateway
        .get_server_status(&id)
        .await
        .ok_or_else(|| GatewayError::ConfigNotFound(id.clone()))?;
    let config = state
        .gateway
        .store()
        .get_server(&id)
        .await
        .ok_or(GatewayError::ConfigNotFound(id))?;
    Ok(ApiResponse::ok(json!({
        "config": config,
        "status": status,
    })))
}

pub async fn update_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<ServerPatch>,
) -> ApiResult<Value> {
    let updated = state.gateway.update_server(&id, patch).await?;
    Ok(ApiResponse::ok(json!(updated)))
}

pub async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    state.gateway.remove_server(&id).await?;
    Ok(ApiResponse::ok(json!({ "removed": id })))
}

macro_rules! lifecycle_handler {
    ($name:ident, $method:ident) => {
        pub async fn $name(
            State(state): State<AppState>,
            Path(id): Path<String>,
        ) -> ApiResult<Value> {
            state.gateway.$method(&id).await?;
            let status = state.gateway.get_server_status(&id).await;
            Ok(ApiResponse::ok(json!(status)))
        }
    };
}

lifecycle_handler!(connect_server, connect_server);
lifecycle_handler!(disconnect_server, disconnect_server);
lifecycle_handler!(reconnect_server, reconnect_server);
lifecycle_handler!(refresh_server, refresh_server);

pub async fn enable_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    set_enabled(&state, &id, true).await
}

pub async fn disable_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    set_enabled(&state, &id, false).await
}

async fn set_enabled(state: &AppState, id: &str, enabled: bool) -> ApiResult<Value> {
    let patch = ServerPatch {
        enabled: Some(enabled),
        ..Default::default()
    };
    let updated = state.gateway.update_server(id, patch).await?;
    Ok(ApiResponse::ok(json!(updated)))
}

// ----------------------------------------------------------------------
// Auth
// ----------------------------------------------------------------------

pub async fn auth_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let status = state.gateway.auth_status(&id).await?;
    Ok(ApiResponse::ok(json!(status)))
}

pub async fn auth_initiate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let outcome = state.gateway.initiate_auth(&id).await?;
    Ok(ApiResponse::ok(json!({
        "result": outcome.result_str(),
        "authUrl": outcome.auth_url(),
    })))
}

pub async fn auth_revoke(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    state.gateway.revoke_auth(&id).await?;
    Ok(ApiResponse::ok(json!({ "revoked": id })))
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackParams {
    pub code: Option<String>,
    #[allow(dead_code)]
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// OAuth redirect target: `/oauth/callback/{serverId}?code=...`. The path
/// segment carries the routing key planted in `redirect_url`; success and
/// failure both bounce to the UI with query flags.
pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Query(params): Query<OAuthCallbackParams>,
) -> Redirect {
    if let Some(error) = params.error {
        let message = match params.error_description {
            Some(desc) => format!("{error}: {desc}"),
            None => error,
        };
        warn!(server_id = %server_id, message = %message, "authorization server returned an error");
        return error_redirect(&server_id, &message);
    }

    let Some(code) = params.code else {
        return error_redirect(&server_id, "callback is missing the authorization code");
    };

    match state.gateway.handle_oauth_callback(&server_id, &code).await {
        Ok(()) => {
            info!(server_id = %server_id, "OAuth callback completed");
            Redirect::to(&format!(
                "/?oauth=success&serverId={}",
                urlencoding::encode(&server_id)
            ))
        }
        Err(e) => {
            warn!(server_id = %server_id, error = %e, "OAuth callback failed");
            error_redirect(&server_id, &e.to_string())
        }
    }
}

fn error_redirect(server_id: &str, message: &str) -> Redirect {
    Redirect::to(&format!(
        "/?oauth=error&serverId={}&message={}",
        urlencoding::encode(server_id),
        urlencoding::encode(message)
    ))
}

// ----------------------------------------------------------------------
// Aggregated capabilities
// ----------------------------------------------------------------------

pub async fn list_tools(State(state): State<AppState>) -> ApiResult<Value> {
    Ok(ApiResponse::ok(json!(state.gateway.get_all_tools().await)))
}

pub async fn list_resources(State(state): State<AppState>) -> ApiResult<Value> {
    Ok(ApiResponse::ok(json!(
        state.gateway.get_all_resources().await
    )))
}

pub async fn list_prompts(State(state): State<AppState>) -> ApiResult<Value> {
    Ok(ApiResponse::ok(json!(state.gateway.get_all_prompts().await)))
}

#[derive(Debug, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

pub async fn call_tool(
    State(state): State<AppState>,
    Json(request): Json<ToolCallRequest>,
) -> ApiResult<Value> {
    debug!(tool = %request.name, "REST tool call");
    let result = state
        .gateway
        .call_tool_by_name(&request.name, request.arguments)
        .await?;
    Ok(ApiResponse::ok(
        serde_json::to_value(result).unwrap_or(Value::Null),
    ))
}

// ----------------------------------------------------------------------
// Events (SSE)
// ----------------------------------------------------------------------

/// Live stream of the event bus as `text/event-stream`; the event name is
/// the bus type tag, the payload the serialized event.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let mut receiver = state.events.subscribe();
    let stream = async_stream::stream! {
        while let Some(event) = receiver.recv().await {
            let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            yield Ok(Event::default().event(event.type_name()).data(payload));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ----------------------------------------------------------------------
// Request log
// ----------------------------------------------------------------------

pub async fn list_logs(
    State(state): State<AppState>,
    Query(filter): Query<LogFilter>,
) -> ApiResult<Value> {
    Ok(ApiResponse::ok(json!(state.request_log.snapshot(&filter))))
}

pub async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let entry = state
        .request_log
        .get(&id)
        .ok_or(GatewayError::ConfigNotFound(id))?;
    Ok(ApiResponse::ok(json!(entry)))
}

pub async fn log_stats(State(state): State<AppState>) -> ApiResult<Value> {
    Ok(ApiResponse::ok(json!(state.request_log.stats())))
}

pub async fn clear_logs(State(state): State<AppState>) -> ApiResult<Value> {
    state.request_log.clear();
    Ok(ApiResponse::ok(json!({ "cleared": true })))
}
