//! Tag-based RPC dispatch.
//!
//! The original implementation composes handler maps up a class hierarchy
//! via a metaclass; here each role builds a [`HandlerRegistry`] explicitly
//! and merges its base role's registry in before adding its own entries,
//! preserving base-to-derived invocation order without needing reflection.

use std::future::Future;
use std::pin::Pin;

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

use crate::error::AgentError;

/// Named JSON arguments passed to an RPC handler, plus the injected caller
/// identity (`from_token`, taken from the delivery's `app_id`).
#[derive(Debug, Clone, Default)]
pub struct RpcArgs {
    pub from_token: Option<String>,
    pub arguments: Map<String, Value>,
}

impl RpcArgs {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.arguments.get(key)
    }
}

// Not `Send`: an `Agent` and everything built on it lives on a single
// current-thread scheduler (see the crate-level concurrency notes), so a
// handler is free to close over `Rc<RefCell<_>>` state shared with its owning
// role (e.g. a `DataClient`'s data-connection cell) instead of routing
// through a thread-safe channel.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<Value>, AgentError>>>>;
pub type RpcHandler = Box<dyn Fn(RpcArgs) -> HandlerFuture>;

/// A tag → ordered handler list, composed base-to-derived.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: FxHashMap<&'static str, Vec<RpcHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: FxHashMap::default(),
        }
    }

    /// Registers a handler for `tag`, appended after any already registered
    /// (i.e. after everything a prior `merge` brought in from a base role).
    pub fn register(&mut self, tag: &'static str, handler: RpcHandler) {
        self.handlers.entry(tag).or_default().push(handler);
    }

    /// Folds `base`'s handlers in ahead of anything already registered here,
    /// the registry-builder equivalent of a subclass inheriting its parent's
    /// `_rpc_handlers` before adding its own.
    pub fn merge(&mut self, base: HandlerRegistry) {
        for (tag, mut base_handlers) in base.handlers {
            let entry = self.handlers.entry(tag).or_default();
            base_handlers.append(entry);
            *entry = base_handlers;
        }
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Invokes every handler registered for `tag` in base-to-derived order.
    ///
    /// At most one handler may return `Some(_)`; a second one doing so is
    /// `AmbiguousRpcReturn`. An unregistered tag is `UnknownRpc`.
    pub async fn dispatch(&self, tag: &str, args: RpcArgs) -> Result<Option<Value>, AgentError> {
        let handlers = self
            .handlers
            .get(tag)
            .ok_or_else(|| AgentError::UnknownRpc(tag.to_string()))?;

        let mut result = None;
        for handler in handlers {
            let value = handler(args.clone()).await?;
            if value.is_some() {
                if result.is_some() {
                    return Err(AgentError::AmbiguousRpcReturn(tag.to_string()));
                }
                result = value;
            }
        }
        Ok(result)
    }
}

/// Convenience macro-free constructor for a single-handler closure, used in
/// tests and in role `Default`/`new` implementations.
pub fn handler<F, Fut>(f: F) -> RpcHandler
where
    F: Fn(RpcArgs) -> Fut + 'static,
    Fut: Future<Output = Result<Option<Value>, AgentError>> + 'static,
{
    Box::new(move |args| Box::pin(f(args)))
}

/// A `config` handler that does nothing, registered by roles (`Source`,
/// `HistoryClient`, `DurableSink`) whose register/subscribe reply may carry
/// an inline `config` object even when the role has no built-in reaction to
/// it — matching `handle_config(self, **config): pass` in the original
/// implementation, present purely so dispatching `"config"` is never
/// `UnknownRpc` by default.
pub(crate) fn noop_config_handler() -> RpcHandler {
    handler(|_args: RpcArgs| async { Ok(None) })
}

/// The classification of an inbound delivery's JSON body: either a request
/// naming a `function` tag, or a reply to a previously issued request.
pub enum InboundRpc {
    Request { function: String, args: RpcArgs },
    Response { correlation_id: String, body: Value },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok_handler(v: Option<Value>) -> RpcHandler {
        handler(move |_args| {
            let v = v.clone();
            async move { Ok(v) }
        })
    }

    #[tokio::test]
    async fn dispatch_unknown_tag_fails() {
        let registry = HandlerRegistry::new();
        let err = registry.dispatch("nope", RpcArgs::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownRpc(tag) if tag == "nope"));
    }

    #[tokio::test]
    async fn dispatch_single_handler_returns_its_value() {
        let mut registry = HandlerRegistry::new();
        registry.register("config", ok_handler(Some(json!({"ok": true}))));
        let result = registry.dispatch("config", RpcArgs::default()).await.unwrap();
        assert_eq!(result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn dispatch_runs_all_handlers_base_to_derived() {
        let mut base = HandlerRegistry::new();
        base.register("config", ok_handler(None));
        let mut derived = HandlerRegistry::new();
        derived.merge(base);
        derived.register("config", ok_handler(Some(json!(42))));

        let result = derived.dispatch("config", RpcArgs::default()).await.unwrap();
        assert_eq!(result, Some(json!(42)));
    }

    #[tokio::test]
    async fn dispatch_two_non_empty_returns_is_ambiguous() {
        let mut registry = HandlerRegistry::new();
        registry.register("config", ok_handler(Some(json!(1))));
        registry.register("config", ok_handler(Some(json!(2))));

        let err = registry.dispatch("config", RpcArgs::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::AmbiguousRpcReturn(_)));
    }
}
