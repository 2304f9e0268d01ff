//! Dispatch core shared by every transport.
//!
//! Turns an incoming `(kind, name, param, context)` request into a call to
//! the registered function and wraps the outcome as `{"result": ...}` or
//! `{"error": {...}}`. The wrapping step is the last line of defense before
//! a response is written back to the socket and must never fail itself.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::{code, PluginError};
use crate::record::{deserialize_or_none, serialize_record};
use crate::registry::{ErrorOutcome, ExtensionKind, OpArgs, PluginResult, Registry};

/// Outbound channel toward the host, available to a callable while it runs
/// inside a worker. Implemented by the worker's live connection (nested
/// calls) and by the one-off outbound worker.
pub trait HostChannel {
    fn send_action(&self, action: &str, payload: Value) -> PluginResult<Value>;
}

/// Call-scoped context for one dispatch. Constructed on entry, dropped on
/// exit; it is threaded as an explicit parameter, never ambient state.
pub struct CallContext<'a> {
    values: Value,
    host: Option<&'a dyn HostChannel>,
}

impl<'a> CallContext<'a> {
    pub fn new(values: Value) -> Self {
        Self { values, host: None }
    }

    pub fn with_host(values: Value, host: &'a dyn HostChannel) -> Self {
        Self {
            values,
            host: Some(host),
        }
    }

    pub fn empty() -> Self {
        Self::new(Value::Null)
    }

    /// The raw context object the host attached to this request.
    pub fn values(&self) -> &Value {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// The authenticated user of the current request, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.get("user_id").and_then(Value::as_str)
    }

    /// Originate a call back to the host. Inside a worker this becomes a
    /// nested outbound request on the worker's own connection.
    pub fn send_action(&self, action: &str, payload: Value) -> PluginResult<Value> {
        match self.host {
            Some(host) => host.send_action(action, payload),
            None => Err(PluginError::new(
                "no host connection available in this context",
                code::PLUGIN_UNAVAILABLE,
            )),
        }
    }
}

/// HTTP-shaped request delivered to a `handler` extension point.
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    pub method: String,
    pub path: String,
    pub query_string: Option<String>,
    /// Header name to list-of-values, as the host sends them.
    pub headers: Map<String, Value>,
    pub body: Vec<u8>,
}

impl HandlerRequest {
    fn from_param(param: &Value) -> PluginResult<Self> {
        let method = param
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| PluginError::invalid_argument("handler param is missing 'method'"))?
            .to_ascii_uppercase();
        let path = param
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or("/")
            .to_string();
        let query_string = param
            .get("query_string")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let headers = param
            .get("header")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let body = match param.get("body").and_then(Value::as_str) {
            Some(encoded) => BASE64
                .decode(encoded)
                .map_err(|e| PluginError::invalid_argument(format!("malformed body: {e}")))?,
            None => Vec::new(),
        };
        Ok(Self {
            method,
            path,
            query_string,
            headers,
            body,
        })
    }

    /// Parse the body as JSON.
    pub fn json_body<T: for<'de> Deserialize<'de>>(&self) -> PluginResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| PluginError::invalid_argument(format!("malformed JSON body: {e}")))
    }
}

/// Response produced by a `handler` extension point.
#[derive(Debug, Clone)]
pub struct HandlerResponse {
    pub status: u16,
    pub headers: Map<String, Value>,
    pub body: Vec<u8>,
}

impl HandlerResponse {
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: Map::new(),
            body,
        }
    }

    pub fn plain_text(text: impl Into<String>) -> Self {
        let mut resp = Self::new(200, text.into().into_bytes());
        resp.headers.insert(
            "Content-Type".to_string(),
            json!(["text/plain; charset=utf-8"]),
        );
        resp
    }

    pub fn json(value: &Value) -> Self {
        let mut resp = Self::new(200, value.to_string().into_bytes());
        resp.headers
            .insert("Content-Type".to_string(), json!(["application/json"]));
        resp
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    fn into_value(self) -> Value {
        json!({
            "status": self.status,
            "header": Value::Object(self.headers),
            "body": BASE64.encode(&self.body),
        })
    }
}

/// The parsed JSON payload of a `REQUEST` frame.
#[derive(Debug, Deserialize)]
struct RequestPayload {
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    param: Value,
    #[serde(default)]
    context: Value,
}

/// Kind-specific argument derivation and result/error wrapping around the
/// registry. One instance is shared by every transport.
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Dispatch a raw request payload (the JSON body of a `REQUEST` frame)
    /// and return the serialized response body.
    pub fn dispatch_payload(&self, payload: &[u8], host: Option<&dyn HostChannel>) -> Vec<u8> {
        let response = match serde_json::from_slice::<RequestPayload>(payload) {
            Ok(req) => self.call(&req.kind, &req.name, req.param, req.context, host),
            Err(e) => {
                tracing::warn!(error = %e, "malformed request payload");
                json!({ "error": PluginError::unexpected(format!("malformed request payload: {e}")).as_value() })
            }
        };
        response.to_string().into_bytes()
    }

    /// Execute one call and wrap its outcome. Never fails.
    pub fn call(
        &self,
        kind: &str,
        name: &str,
        param: Value,
        context: Value,
        host: Option<&dyn HostChannel>,
    ) -> Value {
        let Some(kind) = ExtensionKind::parse(kind) else {
            let err = PluginError::new(
                format!("unknown plugin extension point '{kind}'"),
                code::UNDEFINED_OPERATION,
            );
            return json!({ "error": err.as_value() });
        };

        let ctx = match host {
            Some(h) => CallContext::with_host(context, h),
            None => CallContext::new(context),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| self.invoke(kind, name, param, &ctx)));

        match outcome {
            Ok(Ok(result)) => json!({ "result": result }),
            Ok(Err(err)) => self.wrap_error(err),
            Err(panic) => {
                let message = panic_message(panic);
                tracing::error!(kind = kind.as_str(), name, %message, "callable panicked");
                let err = PluginError::unexpected(message).with_info("panic", json!(true));
                self.wrap_error(err)
            }
        }
    }

    fn invoke(
        &self,
        kind: ExtensionKind,
        name: &str,
        param: Value,
        ctx: &CallContext<'_>,
    ) -> PluginResult<Value> {
        match kind {
            ExtensionKind::Op => self.invoke_op(name, &param, ctx),
            ExtensionKind::Hook => self.invoke_hook(name, &param, ctx),
            ExtensionKind::Timer => {
                let f = self.registry.get_timer(name)?;
                f(ctx)
            }
            ExtensionKind::Event => self.invoke_event(name, param),
            ExtensionKind::Handler => self.invoke_handler(name, &param, ctx),
            ExtensionKind::Provider => self.invoke_provider(name, param, ctx),
        }
    }

    fn invoke_op(&self, name: &str, param: &Value, ctx: &CallContext<'_>) -> PluginResult<Value> {
        let f = self.registry.get_op(name)?;
        let args = match param.get("args") {
            None | Some(Value::Null) => OpArgs::Named(Map::new()),
            Some(Value::Array(items)) => OpArgs::Positional(items.clone()),
            Some(Value::Object(fields)) => OpArgs::Named(fields.clone()),
            Some(other) => {
                return Err(PluginError::invalid_argument(format!(
                    "unsupported args type '{}'",
                    json_type_name(other)
                )))
            }
        };
        f(ctx, args)
    }

    fn invoke_hook(&self, name: &str, param: &Value, ctx: &CallContext<'_>) -> PluginResult<Value> {
        let f = self.registry.get_hook(name)?;
        let record = deserialize_or_none(param.get("record"))?;
        let original = deserialize_or_none(param.get("original"))?;

        // A hook that returns no record means "keep the incoming record".
        let returned = f(ctx, record.clone(), original)?.or(record);
        Ok(match returned {
            Some(record) => serialize_record(&record),
            None => Value::Null,
        })
    }

    fn invoke_event(&self, name: &str, param: Value) -> PluginResult<Value> {
        match self.registry.get_event(name) {
            Ok(f) => f(param),
            // The discovery event is built in; a user registration for
            // "init" takes precedence over it.
            Err(_) if name == "init" => Ok(self.registry.func_list()),
            Err(_) => {
                tracing::warn!(name, "missing event func");
                Ok(Value::Null)
            }
        }
    }

    fn invoke_handler(
        &self,
        name: &str,
        param: &Value,
        ctx: &CallContext<'_>,
    ) -> PluginResult<Value> {
        let request = HandlerRequest::from_param(param)?;
        let f = self.registry.get_handler(name, &request.method)?;
        let response = f(ctx, request)?;
        Ok(response.into_value())
    }

    fn invoke_provider(
        &self,
        name: &str,
        param: Value,
        ctx: &CallContext<'_>,
    ) -> PluginResult<Value> {
        let mut fields = match param {
            Value::Object(fields) => fields,
            other => {
                return Err(PluginError::invalid_argument(format!(
                    "provider param must be an object, got '{}'",
                    json_type_name(&other)
                )))
            }
        };
        let action = fields
            .remove("action")
            .and_then(|v| v.as_str().map(str::to_owned))
            .ok_or_else(|| PluginError::invalid_argument("provider param is missing 'action'"))?;
        let provider = self.registry.get_provider(name)?;
        provider.handle_action(ctx, &action, Value::Object(fields))
    }

    /// Wrap a domain error into a response, consulting the registered error
    /// handlers first. Must never panic.
    fn wrap_error(&self, err: PluginError) -> Value {
        match self.registry.handle_error(&err) {
            Some(ErrorOutcome::Resolve(value)) => json!({ "result": value }),
            Some(ErrorOutcome::Replace(replacement)) => {
                json!({ "error": replacement.as_value() })
            }
            Some(ErrorOutcome::Keep) | None => {
                if err.code == code::UNEXPECTED_ERROR {
                    tracing::error!(error = %err, "error occurred processing request");
                }
                json!({ "error": err.as_value() })
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .finish()
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "callable panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;
    use crate::registry::Registry;

    fn dispatcher_with(build: impl FnOnce(&mut Registry)) -> Dispatcher {
        let mut registry = Registry::new();
        build(&mut registry);
        Dispatcher::new(registry)
    }

    #[test]
    fn test_op_positional_args() {
        let d = dispatcher_with(|r| {
            r.op("add", |_ctx, args| match args {
                OpArgs::Positional(items) => {
                    let sum: i64 = items.iter().filter_map(Value::as_i64).sum();
                    Ok(json!(sum))
                }
                OpArgs::Named(_) => Err(PluginError::invalid_argument("expected array")),
            });
        });
        let resp = d.call("op", "add", json!({"args": [1, 2]}), Value::Null, None);
        assert_eq!(resp, json!({"result": 3}));
    }

    #[test]
    fn test_op_named_args() {
        let d = dispatcher_with(|r| {
            r.op("echo", |_ctx, args| match args {
                OpArgs::Named(fields) => Ok(Value::Object(fields)),
                OpArgs::Positional(_) => Err(PluginError::invalid_argument("expected object")),
            });
        });
        let resp = d.call("op", "echo", json!({"args": {"a": 1}}), Value::Null, None);
        assert_eq!(resp, json!({"result": {"a": 1}}));
    }

    #[test]
    fn test_op_rejects_scalar_args() {
        let d = dispatcher_with(|r| {
            r.op("noop", |_ctx, _args| Ok(Value::Null));
        });
        let resp = d.call("op", "noop", json!({"args": "nope"}), Value::Null, None);
        assert_eq!(resp["error"]["code"], code::INVALID_ARGUMENT);
    }

    #[test]
    fn test_missing_op_is_undefined_operation() {
        let d = dispatcher_with(|_| {});
        let resp = d.call("op", "nope", json!({}), Value::Null, None);
        assert_eq!(resp["error"]["code"], code::UNDEFINED_OPERATION);
    }

    #[test]
    fn test_unknown_kind_is_an_error_response() {
        let d = dispatcher_with(|_| {});
        let resp = d.call("banana", "x", json!({}), Value::Null, None);
        assert_eq!(resp["error"]["code"], code::UNDEFINED_OPERATION);
    }

    #[test]
    fn test_hook_none_return_keeps_record() {
        let d = dispatcher_with(|r| {
            r.hook("before_save", "note", |_ctx, _record, _original| Ok(None));
        });
        let param = json!({
            "record": {"_id": "note/1", "title": "kept"},
            "original": null,
        });
        let resp = d.call("hook", "note:before_save", param, Value::Null, None);
        assert_eq!(resp["result"]["_id"], "note/1");
        assert_eq!(resp["result"]["title"], "kept");
    }

    #[test]
    fn test_hook_can_mutate_record() {
        let d = dispatcher_with(|r| {
            r.hook("before_save", "note", |_ctx, record, _original| {
                let mut record = record.expect("record payload");
                record.set("title", json!("rewritten"));
                Ok(Some(record))
            });
        });
        let param = json!({"record": {"_id": "note/1", "title": "old"}});
        let resp = d.call("hook", "note:before_save", param, Value::Null, None);
        assert_eq!(resp["result"]["title"], "rewritten");
    }

    #[test]
    fn test_event_missing_func_yields_null_result() {
        let d = dispatcher_with(|_| {});
        let resp = d.call("event", "no-such-event", json!({}), Value::Null, None);
        assert_eq!(resp, json!({"result": null}));
    }

    #[test]
    fn test_init_event_answers_func_list() {
        let d = dispatcher_with(|r| {
            r.op("ping", |_ctx, _args| Ok(Value::Null));
        });
        let resp = d.call("event", "init", json!({}), Value::Null, None);
        assert_eq!(resp["result"]["op"], json!(["ping"]));
    }

    #[test]
    fn test_provider_action_dispatch() {
        struct EchoProvider;
        impl crate::registry::Provider for EchoProvider {
            fn handle_action(
                &self,
                _ctx: &CallContext,
                action: &str,
                param: Value,
            ) -> PluginResult<Value> {
                Ok(json!({"action": action, "param": param}))
            }
        }

        let d = dispatcher_with(|r| {
            r.register_provider("auth", "com.example.auth", Arc::new(EchoProvider));
        });
        let resp = d.call(
            "provider",
            "com.example.auth",
            json!({"action": "login", "user": "bob"}),
            Value::Null,
            None,
        );
        assert_eq!(resp["result"]["action"], "login");
        // The action key is consumed before the provider sees the param.
        assert_eq!(resp["result"]["param"], json!({"user": "bob"}));
    }

    #[test]
    fn test_panic_is_wrapped_as_unexpected_error() {
        let d = dispatcher_with(|r| {
            r.op("explode", |_ctx, _args| panic!("kaboom"));
        });
        let resp = d.call("op", "explode", json!({}), Value::Null, None);
        assert_eq!(resp["error"]["code"], code::UNEXPECTED_ERROR);
        assert_eq!(resp["error"]["message"], "kaboom");
        assert_eq!(resp["error"]["info"]["panic"], json!(true));
    }

    #[test]
    fn test_error_handler_can_resolve() {
        let d = dispatcher_with(|r| {
            r.op("denied", |_ctx, _args| {
                Err(PluginError::new("nope", code::PERMISSION_DENIED))
            });
            r.register_error_handler(
                Arc::new(|e| e.code == code::PERMISSION_DENIED),
                Arc::new(|_| ErrorOutcome::Resolve(json!("fine actually"))),
            );
        });
        let resp = d.call("op", "denied", json!({}), Value::Null, None);
        assert_eq!(resp, json!({"result": "fine actually"}));
    }

    #[test]
    fn test_context_is_visible_to_callable() {
        let d = dispatcher_with(|r| {
            r.op("whoami", |ctx, _args| Ok(json!(ctx.user_id())));
        });
        let resp = d.call(
            "op",
            "whoami",
            json!({}),
            json!({"user_id": "user-42"}),
            None,
        );
        assert_eq!(resp, json!({"result": "user-42"}));
    }

    #[test]
    fn test_send_action_without_host_fails() {
        let ctx = CallContext::empty();
        let err = ctx.send_action("noop", Value::Null).unwrap_err();
        assert_eq!(err.code, code::PLUGIN_UNAVAILABLE);
    }

    #[test]
    fn test_handler_round_trip() {
        let d = dispatcher_with(|r| {
            r.handler("notes", &["POST"], |_ctx, req| {
                assert_eq!(req.path, "/notes");
                let body: Value = req.json_body()?;
                Ok(HandlerResponse::json(&json!({"got": body})))
            });
        });
        let body = BASE64.encode(br#"{"title":"x"}"#);
        let param = json!({
            "method": "POST",
            "path": "/notes",
            "header": {},
            "body": body,
        });
        let resp = d.call("handler", "notes", param, Value::Null, None);
        assert_eq!(resp["result"]["status"], 200);
        let decoded = BASE64
            .decode(resp["result"]["body"].as_str().unwrap())
            .unwrap();
        let decoded: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(decoded["got"]["title"], "x");
    }

    #[test]
    fn test_dispatch_payload_malformed_json() {
        let d = dispatcher_with(|_| {});
        let out = d.dispatch_payload(b"{not json", None);
        let resp: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(resp["error"]["code"], code::UNEXPECTED_ERROR);
    }
}
