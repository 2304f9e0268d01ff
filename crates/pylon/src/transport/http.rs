//! Equivalent HTTP interface: the same dispatch core driven over HTTP,
//! without the worker-pool reliability protocol. Useful for simpler
//! deployments and for debugging extension points with plain curl.
//!
//! The request body is the call's `param`; the call context travels in the
//! `x-pylon-plugin-context` header as base64-encoded JSON.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;
use crate::error::{PluginError, Result};

pub const CONTEXT_HEADER: &str = "x-pylon-plugin-context";

type AppState = Arc<Dispatcher>;

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/", post(call_generic))
        .route("/init", get(init).post(init))
        .route("/op/:name", post(call_op))
        .route("/hook/:name", post(call_hook))
        .route("/timer/:name", post(call_timer))
        .route("/event/:name", post(call_event))
        .route("/provider/:name/:action", post(call_provider))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/// Bind and serve until the task is cancelled.
pub async fn serve(addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http transport listening");
    axum::serve(listener, router(dispatcher)).await?;
    Ok(())
}

fn context_from_headers(headers: &HeaderMap) -> Value {
    let Some(raw) = headers.get(CONTEXT_HEADER).and_then(|v| v.to_str().ok()) else {
        return json!({});
    };
    BASE64
        .decode(raw)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_else(|| {
            tracing::warn!("ignoring malformed plugin context header");
            json!({})
        })
}

fn param_from_body(body: &Bytes) -> std::result::Result<Value, Json<Value>> {
    if body.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|e| {
        let err = PluginError::invalid_argument(format!("malformed request body: {e}"));
        Json(json!({ "error": err.as_value() }))
    })
}

/// Run one dispatch off the async runtime; user callables may block.
async fn dispatch_call(
    state: AppState,
    kind: &'static str,
    name: String,
    param: Value,
    context: Value,
) -> Json<Value> {
    let result =
        tokio::task::spawn_blocking(move || state.call(kind, &name, param, context, None))
            .await
            .unwrap_or_else(|e| {
                let err = PluginError::unexpected(format!("dispatch task failed: {e}"));
                json!({ "error": err.as_value() })
            });
    Json(result)
}

async fn init(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "result": state.registry().func_list() }))
}

async fn call_generic(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let request: Value = match param_from_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let kind = request["kind"].as_str().unwrap_or("").to_string();
    let name = request["name"].as_str().unwrap_or("").to_string();
    let param = request.get("param").cloned().unwrap_or_else(|| json!({}));
    let context = request
        .get("context")
        .cloned()
        .unwrap_or_else(|| context_from_headers(&headers));
    let result = tokio::task::spawn_blocking(move || state.call(&kind, &name, param, context, None))
        .await
        .unwrap_or_else(|e| {
            let err = PluginError::unexpected(format!("dispatch task failed: {e}"));
            json!({ "error": err.as_value() })
        });
    Json(result)
}

async fn call_op(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let param = match param_from_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    dispatch_call(state, "op", name, param, context_from_headers(&headers)).await
}

async fn call_hook(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let param = match param_from_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    dispatch_call(state, "hook", name, param, context_from_headers(&headers)).await
}

async fn call_timer(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let param = match param_from_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    dispatch_call(state, "timer", name, param, context_from_headers(&headers)).await
}

async fn call_event(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let param = match param_from_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    dispatch_call(state, "event", name, param, context_from_headers(&headers)).await
}

async fn call_provider(
    State(state): State<AppState>,
    Path((name, action)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let mut param = match param_from_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    // The route carries the action; fold it into the param the dispatch
    // core expects.
    if let Some(obj) = param.as_object_mut() {
        obj.insert("action".to_string(), json!(action));
    }
    dispatch_call(state, "provider", name, param, context_from_headers(&headers)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{OpArgs, Registry};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router() -> Router {
        let mut registry = Registry::new();
        registry.op("double", |_ctx, args| match args {
            OpArgs::Positional(items) => {
                let n = items.first().and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(n * 2))
            }
            OpArgs::Named(_) => Ok(json!(null)),
        });
        registry.op("whoami", |ctx, _args| Ok(json!(ctx.user_id())));
        router(Arc::new(Dispatcher::new(registry)))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_op_endpoint() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/op/double")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"args":[21]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"result": 42}));
    }

    #[tokio::test]
    async fn test_generic_endpoint() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::from(
                        r#"{"kind":"op","name":"double","param":{"args":[5]}}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!({"result": 10}));
    }

    #[tokio::test]
    async fn test_context_header() {
        let context = BASE64.encode(br#"{"user_id":"user-9"}"#);
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/op/whoami")
                    .header(CONTEXT_HEADER, context)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!({"result": "user-9"}));
    }

    #[tokio::test]
    async fn test_init_lists_extension_points() {
        let response = test_router()
            .oneshot(Request::builder().uri("/init").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        let ops = body["result"]["op"].as_array().unwrap();
        assert!(ops.contains(&json!("double")));
    }

    #[tokio::test]
    async fn test_missing_op_yields_error_body() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/op/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], crate::error::code::UNDEFINED_OPERATION);
    }
}
