//! API endpoint handlers
//!
//! This module implements the HTTP endpoints of the gateway: provider
//! forwarding with PII protection, the dashboard data endpoints, and health
//! checks.

use crate::core::config::Config;
use crate::core::provider::{Provider, ProviderError, ProviderType, UpstreamRequest};
use crate::core::providers::ProviderRegistry;
use crate::dashboard::{match_conversations, parse_alerts, parse_prompt_with_output};
use crate::db::Database;
use crate::pipeline::pii::restore_pii_json;
use crate::pipeline::stream::{Framing, StreamProcessor, process_stream};
use crate::pipeline::{PipelineContext, PipelineFactory, SystemMessageStyle};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, Query, RawQuery, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const DEFAULT_PAGE_SIZE: usize = 100;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub providers: Arc<ProviderRegistry>,
    pub pipelines: Arc<PipelineFactory>,
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/dashboard/messages", get(dashboard_messages))
        .route("/dashboard/alerts", get(dashboard_alerts))
        .route("/dashboard/prompts/{id}", get(dashboard_prompt))
        .route("/{provider}/{*path}", get(forward).post(forward))
        .with_state(state)
}

fn error_response(status: StatusCode, error_type: &str, message: impl Into<String>) -> Response {
    let body = json!({
        "error": {
            "type": error_type,
            "message": message.into(),
        }
    });
    (status, Json(body)).into_response()
}

/// Status returned to the client for an upstream failure
fn upstream_status(e: &ProviderError) -> StatusCode {
    StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// `fim` for completion style requests, `chat` otherwise
fn prompt_type(path: &str, request: &Value) -> &'static str {
    if request.get("messages").is_none()
        && (request.get("prompt").is_some() || path.ends_with("completions"))
    {
        "fim"
    } else {
        "chat"
    }
}

/// /{provider}/{*path} - Forward a request to an upstream provider
async fn forward(
    State(state): State<AppState>,
    Path((provider_name, path)): Path<(String, String)>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(provider_type) = ProviderType::from_str(&provider_name) else {
        return error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Unknown provider: {}", provider_name),
        );
    };
    let Some(provider) = state.providers.get(&provider_type).cloned() else {
        return error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Provider not configured: {}", provider_name),
        );
    };

    let request: Option<Value> = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(provider = %provider_type, error = %e, "Rejecting non-JSON request body");
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request_error",
                    format!("Request body is not valid JSON: {}", e),
                );
            }
        }
    };

    let style = if provider_type == ProviderType::Anthropic {
        SystemMessageStyle::TopLevel
    } else {
        SystemMessageStyle::Message
    };
    let mut context = PipelineContext::new(style);

    let mut prompt_id = None;
    let request = match request {
        Some(request) if request.is_object() => {
            let request = state
                .pipelines
                .create_input_pipeline()
                .run(request, &mut context)
                .await;
            prompt_id = record_prompt(&state.db, provider_type, &path, &request, &context);
            Some(request)
        }
        other => other,
    };

    let streaming = request
        .as_ref()
        .map(|r| {
            r.get("stream")
                .and_then(Value::as_bool)
                .unwrap_or_else(|| provider.streams_by_default())
        })
        .unwrap_or(false);

    info!(
        provider = %provider_type,
        %path,
        %method,
        streaming,
        session_id = %context.session_id,
        "Forwarding request"
    );

    let upstream = UpstreamRequest {
        method,
        path,
        query,
        headers,
        body: request,
    };

    let response = match provider.send(upstream).await {
        Ok(response) => response,
        Err(e) => {
            error!(provider = %provider_type, error = %e, "Upstream request failed");
            state.pipelines.finish(&context);
            return error_response(upstream_status(&e), "upstream_error", e.to_string());
        }
    };

    if streaming {
        stream_response(state, provider, context, prompt_id, response)
    } else {
        buffered_response(state, context, prompt_id, response).await
    }
}

fn record_prompt(
    db: &Database,
    provider: ProviderType,
    path: &str,
    request: &Value,
    context: &PipelineContext,
) -> Option<String> {
    let prompt = match db.record_prompt(
        Some(provider.as_str()),
        &request.to_string(),
        prompt_type(path, request),
    ) {
        Ok(prompt) => prompt,
        Err(e) => {
            error!(error = %e, "Failed to record prompt");
            return None;
        }
    };

    for alert in context.alerts_for_prompt(&prompt.id) {
        if let Err(e) = db.record_alert(&alert) {
            error!(error = %e, "Failed to record alert");
        }
    }
    Some(prompt.id)
}

fn content_type(response: &reqwest::Response, fallback: &'static str) -> HeaderValue {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(fallback))
}

fn stream_response(
    state: AppState,
    provider: Arc<dyn Provider>,
    context: PipelineContext,
    prompt_id: Option<String>,
    response: reqwest::Response,
) -> Response {
    let (framing, fallback) = if provider.provider_type() == ProviderType::Ollama {
        (Framing::NdJson, "application/x-ndjson")
    } else {
        (Framing::Sse, "text/event-stream")
    };
    let status = response.status();
    let content_type = content_type(&response, fallback);

    let processor = StreamProcessor::new(framing, state.pipelines.create_output_pipeline(), context);
    let db = state.db.clone();
    let pipelines = state.pipelines.clone();
    let stream = process_stream(Box::pin(response.bytes_stream()), processor, move |chunks, context| {
        if let Some(prompt_id) = prompt_id {
            let output = Value::Array(chunks).to_string();
            if let Err(e) = db.record_output(&prompt_id, &output) {
                error!(error = %e, "Failed to record streamed output");
            }
        }
        pipelines.finish(&context);
        debug!(session_id = %context.session_id, "Stream complete");
    });

    (
        status,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn buffered_response(
    state: AppState,
    context: PipelineContext,
    prompt_id: Option<String>,
    response: reqwest::Response,
) -> Response {
    let status = response.status();
    let content_type = content_type(&response, "application/json");

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            state.pipelines.finish(&context);
            return error_response(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                format!("Failed to read upstream response: {}", e),
            );
        }
    };

    let body = match serde_json::from_slice::<Value>(&body) {
        Ok(mut value) => {
            if let Some(ref prompt_id) = prompt_id {
                if let Err(e) = state.db.record_output(prompt_id, &value.to_string()) {
                    error!(error = %e, "Failed to record output");
                }
            }
            restore_pii_json(state.pipelines.sensitive(), &context.session_id, &mut value);
            Bytes::from(value.to_string())
        }
        Err(_) => body,
    };
    state.pipelines.finish(&context);

    (status, [(header::CONTENT_TYPE, content_type)], body).into_response()
}

#[derive(Debug, Deserialize)]
struct Page {
    limit: Option<usize>,
    offset: Option<usize>,
}

/// GET /dashboard/messages - Conversations built from stored traffic
async fn dashboard_messages(State(state): State<AppState>, Query(page): Query<Page>) -> Response {
    let limit = page.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let offset = page.offset.unwrap_or(0);

    match state.db.list_prompts_with_output(limit, offset) {
        Ok(rows) => {
            let partials = rows.iter().map(parse_prompt_with_output).collect();
            Json(match_conversations(partials)).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to load messages");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "database_error", e.to_string())
        }
    }
}

/// GET /dashboard/alerts - Recent alerts with their conversation
async fn dashboard_alerts(State(state): State<AppState>, Query(page): Query<Page>) -> Response {
    let limit = page.limit.unwrap_or(DEFAULT_PAGE_SIZE);

    match state.db.list_alerts(limit) {
        Ok(rows) => Json(parse_alerts(&rows)).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to load alerts");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "database_error", e.to_string())
        }
    }
}

/// GET /dashboard/prompts/{id} - One prompt with all its outputs and alerts
async fn dashboard_prompt(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.db.prompt_with_outputs_and_alerts(&id) {
        Ok(Some(detail)) => Json(detail).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Prompt '{}' not found", id),
        ),
        Err(e) => {
            error!(error = %e, prompt_id = %id, "Failed to load prompt");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "database_error", e.to_string())
        }
    }
}

/// GET / - Root endpoint
async fn root(State(state): State<AppState>) -> impl IntoResponse {
    let providers: serde_json::Map<String, Value> = ProviderType::ALL
        .iter()
        .map(|p| (p.as_str().to_string(), Value::String(state.config.provider_url(*p))))
        .collect();

    Json(json!({
        "message": format!("CodeGate v{}", env!("CARGO_PKG_VERSION")),
        "status": "running",
        "providers": providers,
        "proxy_port": state.config.proxy_port,
        "endpoints": {
            "forward": "/{provider}/{path}",
            "messages": "/dashboard/messages",
            "alerts": "/dashboard/alerts",
            "health": "/health",
        },
    }))
}

/// GET /health - Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::providers::build_registry;
    use crate::core::prompts::PromptConfig;
    use axum::routing::post;
    use tokio::net::TcpListener;

    async fn spawn(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn test_state(openai_url: &str) -> AppState {
        let mut config = Config::default();
        config.provider_urls.insert(ProviderType::OpenAI, openai_url.to_string());
        config.prompts = PromptConfig::from_yaml_str("pii_redacted: PII was redacted\n").unwrap();
        AppState {
            providers: Arc::new(build_registry(&config).unwrap()),
            pipelines: Arc::new(PipelineFactory::new(&config.prompts)),
            db: Arc::new(Database::open_in_memory().unwrap()),
            config: Arc::new(config),
        }
    }

    /// Upstream that echoes the last user message back
    async fn echo_upstream() -> String {
        async fn chat(Json(body): Json<Value>) -> Response {
            let text = body["messages"]
                .as_array()
                .and_then(|m| m.last())
                .and_then(|m| m["content"].as_str())
                .unwrap_or_default()
                .to_string();
            if body["stream"].as_bool() == Some(true) {
                let first = json!({"id": "chat-1", "choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}}]});
                let second = json!({"id": "chat-1", "choices": [{"index": 0, "delta": {"content": text}}]});
                let sse = format!("data: {}\n\ndata: {}\n\ndata: [DONE]\n\n", first, second);
                ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response()
            } else {
                Json(json!({
                    "id": "chat-2",
                    "choices": [{"index": 0, "message": {"role": "assistant", "content": text}}]
                }))
                .into_response()
            }
        }
        async fn check_auth(headers: HeaderMap) -> Response {
            match headers.get("authorization") {
                Some(_) => Json(json!({"data": []})).into_response(),
                None => (StatusCode::UNAUTHORIZED, "missing key").into_response(),
            }
        }
        spawn(
            Router::new()
                .route("/chat/completions", post(chat))
                .route("/models", get(check_auth)),
        )
        .await
    }

    #[tokio::test]
    async fn test_health_and_unknown_provider() {
        let base = spawn(create_router(test_state("http://127.0.0.1:9"))).await;
        let client = reqwest::Client::new();

        let health: Value = client.get(format!("{}/health", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(health, json!({"status": "healthy"}));

        let response = client
            .post(format!("{}/bedrock/chat/completions", base))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let base = spawn(create_router(test_state("http://127.0.0.1:9"))).await;
        let response = reqwest::Client::new()
            .post(format!("{}/openai/chat/completions", base))
            .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 502);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["type"], "upstream_error");
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let base = spawn(create_router(test_state("http://127.0.0.1:9"))).await;
        let response = reqwest::Client::new()
            .post(format!("{}/openai/chat/completions", base))
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn test_forward_redacts_and_restores() {
        let upstream = echo_upstream().await;
        let state = test_state(&upstream);
        let db = state.db.clone();
        let pipelines = state.pipelines.clone();
        let base = spawn(create_router(state)).await;

        let response = reqwest::Client::new()
            .post(format!("{}/openai/chat/completions", base))
            .header("authorization", "Bearer sk-test")
            .json(&json!({"messages": [{"role": "user", "content": "mail jane@example.com"}]}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "mail jane@example.com");

        let rows = db.list_prompts_with_output(10, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].request.contains("jane@example.com"));
        assert!(rows[0].request.contains("PII was redacted"));
        assert_eq!(db.list_alerts(10).unwrap().len(), 1);
        assert_eq!(pipelines.sensitive().session_count(), 0);

        let client = reqwest::Client::new();
        let detail: Value = client
            .get(format!("{}/dashboard/prompts/{}", base, rows[0].id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(detail["prompt"]["id"], rows[0].id.as_str());
        assert_eq!(detail["outputs"].as_array().unwrap().len(), 1);
        assert_eq!(detail["alerts"][0]["trigger_type"], "codegate-pii");

        let missing = client
            .get(format!("{}/dashboard/prompts/nope", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn test_forward_streaming_restores_and_notifies() {
        let upstream = echo_upstream().await;
        let state = test_state(&upstream);
        let db = state.db.clone();
        let base = spawn(create_router(state.clone())).await;

        let text = reqwest::Client::new()
            .post(format!("{}/openai/chat/completions", base))
            .json(&json!({
                "stream": true,
                "messages": [{"role": "user", "content": "server 10.20.30.40"}]
            }))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        assert!(text.contains("server 10.20.30.40"));
        assert!(text.contains("CodeGate protected 1 instances of PII, including 1 ip address"));
        assert!(text.trim_end().ends_with("data: [DONE]"));

        let conversations: Value = reqwest::get(format!("{}/dashboard/messages", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(conversations[0]["chat_id"], "chat-1");
        assert_eq!(db.list_prompts_with_output(10, 0).unwrap().len(), 1);

        let alerts: Value = reqwest::get(format!("{}/dashboard/alerts", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(alerts[0]["trigger_type"], "codegate-pii");
    }

    #[tokio::test]
    async fn test_get_passthrough_keeps_upstream_status() {
        let upstream = echo_upstream().await;
        let base = spawn(create_router(test_state(&upstream))).await;
        let client = reqwest::Client::new();

        let ok = client
            .get(format!("{}/openai/models", base))
            .header("authorization", "Bearer sk-test")
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), 200);

        let denied = client.get(format!("{}/openai/models", base)).send().await.unwrap();
        assert_eq!(denied.status(), 401);
    }
}
