//! Hook/extension runtime.
//!
//! Named lifecycle events with ordered handler lists. Dispatch is
//! sequential in registration order; a failing handler is logged and the
//! rest still run. Registration can happen at any time — dispatch takes a
//! snapshot of the handler list so the lock is never held across handler
//! calls.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;

use ag_domain::Result;

/// Lifecycle events the runtime fires. Handlers may also register for
/// arbitrary names, but these are always emitted by the core.
pub const LIFECYCLE_EVENTS: &[&str] = &[
    "session_start",
    "before_prompt_build",
    "before_model_resolve",
    "before_agent_start",
    "llm_input",
    "llm_output",
    "before_tool_call",
    "after_tool_call",
    "tool_result_persist",
    "before_message_write",
    "agent_end",
    "session_end",
    "agent:bootstrap",
];

/// Context passed to every handler.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub agent_id: String,
    pub session_id: String,
    pub session_key: String,
}

/// An async hook handler: `(payload, context) → optional result`.
pub type Handler = Arc<
    dyn Fn(Value, HookContext) -> BoxFuture<'static, Result<Option<Value>>> + Send + Sync,
>;

#[derive(Default)]
pub struct HookRegistry {
    handlers: Mutex<HashMap<String, Vec<Handler>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event: &str, handler: Handler) {
        self.handlers
            .lock()
            .entry(event.to_owned())
            .or_default()
            .push(handler);
    }

    /// Convenience for synchronous handlers.
    pub fn register_fn<F>(&self, event: &str, f: F)
    where
        F: Fn(Value, HookContext) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.register(
            event,
            Arc::new(move |payload, ctx| {
                let f = f.clone();
                Box::pin(async move { f(payload, ctx) })
            }),
        );
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.lock().get(event).map_or(0, |h| h.len())
    }

    /// Dispatch an event to all handlers in registration order and collect
    /// their non-empty results. Handler errors are logged, not propagated.
    pub async fn emit(&self, event: &str, payload: Value, ctx: &HookContext) -> Vec<Value> {
        let snapshot: Vec<Handler> = self
            .handlers
            .lock()
            .get(event)
            .cloned()
            .unwrap_or_default();

        let mut results = Vec::new();
        for handler in snapshot {
            match handler(payload.clone(), ctx.clone()).await {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(event = %event, error = %e, "hook handler failed");
                }
            }
        }
        results
    }

    /// Dispatch `before_agent_start` and merge the results:
    /// `prependContext` strings are concatenated with `"\n\n"`, and the
    /// last `systemPrompt` wins.
    pub async fn emit_before_agent_start(
        &self,
        payload: Value,
        ctx: &HookContext,
    ) -> AgentStartOverrides {
        let results = self.emit("before_agent_start", payload, ctx).await;
        merge_agent_start(&results)
    }
}

/// Merged result of the `before_agent_start` hooks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentStartOverrides {
    pub prepend_context: Option<String>,
    pub system_prompt: Option<String>,
}

fn merge_agent_start(results: &[Value]) -> AgentStartOverrides {
    let mut prepend: Vec<&str> = Vec::new();
    let mut system_prompt: Option<String> = None;

    for result in results {
        if let Some(text) = result.get("prependContext").and_then(Value::as_str) {
            if !text.is_empty() {
                prepend.push(text);
            }
        }
        if let Some(text) = result.get("systemPrompt").and_then(Value::as_str) {
            if !text.is_empty() {
                system_prompt = Some(text.to_owned());
            }
        }
    }

    AgentStartOverrides {
        prepend_context: if prepend.is_empty() {
            None
        } else {
            Some(prepend.join("\n\n"))
        },
        system_prompt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_domain::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let registry = HookRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            registry.register_fn("llm_input", move |_, _| {
                order.lock().push(i);
                Ok(None)
            });
        }
        registry
            .emit("llm_input", Value::Null, &HookContext::default())
            .await;
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_abort_the_rest() {
        let registry = HookRegistry::new();
        let ran = Arc::new(AtomicUsize::new(0));
        registry.register_fn("after_tool_call", |_, _| {
            Err(Error::Other("boom".into()))
        });
        {
            let ran = ran.clone();
            registry.register_fn("after_tool_call", move |_, _| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(Some(serde_json::json!({"ok": true})))
            });
        }
        let results = registry
            .emit("after_tool_call", Value::Null, &HookContext::default())
            .await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn before_agent_start_merges_prepend_and_last_prompt_wins() {
        let registry = HookRegistry::new();
        registry.register_fn("before_agent_start", |_, _| {
            Ok(Some(serde_json::json!({
                "prependContext": "memo one",
                "systemPrompt": "first prompt"
            })))
        });
        registry.register_fn("before_agent_start", |_, _| {
            Ok(Some(serde_json::json!({ "prependContext": "memo two" })))
        });
        registry.register_fn("before_agent_start", |_, _| {
            Ok(Some(serde_json::json!({ "systemPrompt": "final prompt" })))
        });

        let merged = registry
            .emit_before_agent_start(Value::Null, &HookContext::default())
            .await;
        assert_eq!(merged.prepend_context.as_deref(), Some("memo one\n\nmemo two"));
        assert_eq!(merged.system_prompt.as_deref(), Some("final prompt"));
    }

    #[tokio::test]
    async fn emit_without_handlers_is_empty() {
        let registry = HookRegistry::new();
        let results = registry
            .emit("session_end", Value::Null, &HookContext::default())
            .await;
        assert!(results.is_empty());
    }
}
