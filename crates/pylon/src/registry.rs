//! Extension point registry.
//!
//! The registry maps extension-point kind and name to the registered
//! callable, and keeps the introspectable metadata the host reads through
//! the `init` discovery event. It is populated once at startup, then shared
//! read-only behind an `Arc` by every transport; no locking is needed for
//! lookups because registration never happens after workers start.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::dispatch::{CallContext, HandlerRequest, HandlerResponse};
use crate::error::{Error, PluginError, Result};
use crate::record::Record;

/// The kinds of extension point a host can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
    Op,
    Hook,
    Timer,
    Handler,
    Event,
    Provider,
}

impl ExtensionKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "op" => Some(Self::Op),
            "hook" => Some(Self::Hook),
            "timer" => Some(Self::Timer),
            "handler" => Some(Self::Handler),
            "event" => Some(Self::Event),
            "provider" => Some(Self::Provider),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Op => "op",
            Self::Hook => "hook",
            Self::Timer => "timer",
            Self::Handler => "handler",
            Self::Event => "event",
            Self::Provider => "provider",
        }
    }
}

/// Arguments derived for an `op` call: a JSON array becomes positional
/// arguments, a JSON object becomes named arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum OpArgs {
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

pub type PluginResult<T> = std::result::Result<T, PluginError>;

pub type OpFunc = Arc<dyn Fn(&CallContext, OpArgs) -> PluginResult<Value> + Send + Sync>;
pub type HookFunc = Arc<
    dyn Fn(&CallContext, Option<Record>, Option<Record>) -> PluginResult<Option<Record>>
        + Send
        + Sync,
>;
pub type TimerFunc = Arc<dyn Fn(&CallContext) -> PluginResult<Value> + Send + Sync>;
pub type EventFunc = Arc<dyn Fn(Value) -> PluginResult<Value> + Send + Sync>;
pub type HandlerFunc =
    Arc<dyn Fn(&CallContext, HandlerRequest) -> PluginResult<HandlerResponse> + Send + Sync>;

/// A pluggable auth/action provider. The provider is responsible for
/// interpreting the `action` sub-operation named in the request parameters.
pub trait Provider: Send + Sync {
    fn handle_action(&self, ctx: &CallContext, action: &str, param: Value)
        -> PluginResult<Value>;
}

/// Disposition returned by a registered error handler.
pub enum ErrorOutcome {
    /// Report the original error unchanged.
    Keep,
    /// Report a different error instead.
    Replace(PluginError),
    /// Swallow the error and report this success payload.
    Resolve(Value),
}

pub type ErrorPredicate = Arc<dyn Fn(&PluginError) -> bool + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&PluginError) -> ErrorOutcome + Send + Sync>;

/// Registration options for a data-mutation hook.
#[derive(Debug, Clone)]
pub struct HookOptions {
    /// Record type the hook fires for.
    pub record_type: String,
}

/// Registration options for a scheduled timer.
#[derive(Debug, Clone, Default)]
pub struct TimerOptions {
    /// Schedule spec, interpreted by the host (e.g. a cron expression or
    /// an interval in seconds).
    pub spec: Option<String>,
}

pub struct Registry {
    ops: HashMap<String, OpFunc>,
    /// Hooks are keyed `"{record_type}:{name}"`; the host addresses them by
    /// that composite name.
    hooks: HashMap<String, HookFunc>,
    timers: HashMap<String, TimerFunc>,
    events: HashMap<String, EventFunc>,
    /// Handlers are keyed by name *and* HTTP-style method.
    handlers: HashMap<String, HashMap<String, HandlerFunc>>,
    providers: HashMap<String, Arc<dyn Provider>>,
    /// Checked in order; the first matching predicate wins, so callers
    /// register specific predicates before general ones.
    error_handlers: Vec<(ErrorPredicate, ErrorHandler)>,

    // Introspectable metadata, answered to the host's discovery request.
    op_meta: Vec<String>,
    hook_meta: Vec<Value>,
    timer_meta: Vec<Value>,
    event_meta: Vec<String>,
    handler_meta: Vec<Value>,
    provider_meta: Vec<Value>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            ops: HashMap::new(),
            hooks: HashMap::new(),
            timers: HashMap::new(),
            events: HashMap::new(),
            handlers: HashMap::new(),
            providers: HashMap::new(),
            error_handlers: Vec::new(),
            op_meta: Vec::new(),
            hook_meta: Vec::new(),
            timer_meta: Vec::new(),
            event_meta: Vec::new(),
            handler_meta: Vec::new(),
            provider_meta: Vec::new(),
        }
    }

    fn warn_replaced(kind: ExtensionKind, name: &str) {
        // Plugin modules may be hot-reloaded during development, so an
        // identical key replaces the prior entry rather than erroring.
        tracing::warn!(kind = kind.as_str(), name, "replacing registered extension point");
    }

    pub fn register_op(&mut self, name: &str, f: OpFunc) {
        if self.ops.insert(name.to_string(), f).is_some() {
            Self::warn_replaced(ExtensionKind::Op, name);
        } else {
            self.op_meta.push(name.to_string());
        }
        tracing::debug!(name, "registered op");
    }

    pub fn register_hook(&mut self, name: &str, f: HookFunc, opts: HookOptions) {
        let key = format!("{}:{}", opts.record_type, name);
        if self.hooks.insert(key.clone(), f).is_some() {
            Self::warn_replaced(ExtensionKind::Hook, &key);
            self.hook_meta
                .retain(|m| m.get("trigger").and_then(Value::as_str) != Some(key.as_str()));
        }
        self.hook_meta.push(json!({
            "type": opts.record_type,
            "trigger": key,
            "name": name,
        }));
        tracing::debug!(name, record_type = %opts.record_type, "registered hook");
    }

    pub fn register_timer(&mut self, name: &str, f: TimerFunc, opts: TimerOptions) {
        if self.timers.insert(name.to_string(), f).is_some() {
            Self::warn_replaced(ExtensionKind::Timer, name);
            self.timer_meta
                .retain(|m| m.get("name").and_then(Value::as_str) != Some(name));
        }
        self.timer_meta.push(json!({ "name": name, "spec": opts.spec }));
        tracing::debug!(name, "registered timer");
    }

    pub fn register_event(&mut self, name: &str, f: EventFunc) {
        if self.events.insert(name.to_string(), f).is_some() {
            Self::warn_replaced(ExtensionKind::Event, name);
        } else {
            self.event_meta.push(name.to_string());
        }
        tracing::debug!(name, "registered event");
    }

    /// Register a handler for one or more HTTP-style methods. Each method
    /// gets its own metadata entry but they share one dispatch table keyed
    /// by `(name, method)`.
    pub fn register_handler(&mut self, name: &str, f: HandlerFunc, methods: &[&str]) {
        let entry = self.handlers.entry(name.to_string()).or_default();
        for method in methods {
            let method = method.to_ascii_uppercase();
            if entry.insert(method.clone(), Arc::clone(&f)).is_some() {
                Self::warn_replaced(ExtensionKind::Handler, &format!("{name} {method}"));
                self.handler_meta.retain(|m| {
                    !(m.get("name").and_then(Value::as_str) == Some(name)
                        && m.get("method").and_then(Value::as_str) == Some(method.as_str()))
                });
            }
            self.handler_meta.push(json!({ "name": name, "method": method }));
        }
        tracing::debug!(name, ?methods, "registered handler");
    }

    pub fn register_provider(
        &mut self,
        provider_type: &str,
        id: &str,
        provider: Arc<dyn Provider>,
    ) {
        if self.providers.insert(id.to_string(), provider).is_some() {
            Self::warn_replaced(ExtensionKind::Provider, id);
            self.provider_meta
                .retain(|m| m.get("id").and_then(Value::as_str) != Some(id));
        }
        self.provider_meta.push(json!({ "type": provider_type, "id": id }));
        tracing::debug!(id, provider_type, "registered provider");
    }

    /// Register an error handler checked before the default wrapping.
    /// Handlers run most-specific-first in registration order.
    pub fn register_error_handler(&mut self, predicate: ErrorPredicate, handler: ErrorHandler) {
        self.error_handlers.push((predicate, handler));
    }

    // ── Sugar over the register_* primitives ────────────────────────────

    pub fn op<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&CallContext, OpArgs) -> PluginResult<Value> + Send + Sync + 'static,
    {
        self.register_op(name, Arc::new(f));
    }

    pub fn hook<F>(&mut self, name: &str, record_type: &str, f: F)
    where
        F: Fn(&CallContext, Option<Record>, Option<Record>) -> PluginResult<Option<Record>>
            + Send
            + Sync
            + 'static,
    {
        self.register_hook(
            name,
            Arc::new(f),
            HookOptions {
                record_type: record_type.to_string(),
            },
        );
    }

    pub fn timer<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&CallContext) -> PluginResult<Value> + Send + Sync + 'static,
    {
        self.register_timer(name, Arc::new(f), TimerOptions::default());
    }

    pub fn event<F>(&mut self, name: &str, f: F)
    where
        F: Fn(Value) -> PluginResult<Value> + Send + Sync + 'static,
    {
        self.register_event(name, Arc::new(f));
    }

    pub fn handler<F>(&mut self, name: &str, methods: &[&str], f: F)
    where
        F: Fn(&CallContext, HandlerRequest) -> PluginResult<HandlerResponse>
            + Send
            + Sync
            + 'static,
    {
        self.register_handler(name, Arc::new(f), methods);
    }

    // ── Lookups ─────────────────────────────────────────────────────────

    pub fn get_op(&self, name: &str) -> Result<OpFunc> {
        self.ops
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no op named '{name}'")))
    }

    pub fn get_hook(&self, name: &str) -> Result<HookFunc> {
        self.hooks
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no hook named '{name}'")))
    }

    pub fn get_timer(&self, name: &str) -> Result<TimerFunc> {
        self.timers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no timer named '{name}'")))
    }

    pub fn get_event(&self, name: &str) -> Result<EventFunc> {
        self.events
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no event named '{name}'")))
    }

    pub fn get_handler(&self, name: &str, method: &str) -> Result<HandlerFunc> {
        self.handlers
            .get(name)
            .and_then(|by_method| by_method.get(&method.to_ascii_uppercase()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no handler for '{name}' ({method})")))
    }

    pub fn get_provider(&self, id: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no provider with id '{id}'")))
    }

    /// Walk the registered error handlers; the first matching predicate
    /// decides the outcome.
    pub fn handle_error(&self, err: &PluginError) -> Option<ErrorOutcome> {
        self.error_handlers
            .iter()
            .find(|(predicate, _)| predicate(err))
            .map(|(_, handler)| handler(err))
    }

    /// The full metadata map, used to answer the host's discovery request.
    pub fn func_list(&self) -> Value {
        json!({
            "op": self.op_meta,
            "hook": self.hook_meta,
            "timer": self.timer_meta,
            "event": self.event_meta,
            "handler": self.handler_meta,
            "provider": self.provider_meta,
        })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("ops", &self.ops.len())
            .field("hooks", &self.hooks.len())
            .field("timers", &self.timers.len())
            .field("events", &self.events.len())
            .field("handlers", &self.handlers.len())
            .field("providers", &self.providers.len())
            .finish()
    }
}
