//! Tool registry and dispatch.
//!
//! Tool bodies live outside the gateway core; the registry holds whatever
//! implementations were registered at startup and converts typed tool
//! failures into tool results with `is_error = true` (they never abort a
//! turn).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use ag_domain::tool::{Tool, ToolDefinition};
use ag_domain::CancelToken;

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

/// Outcome of one tool invocation, ready to feed back to the model.
#[derive(Debug, Clone)]
pub struct ToolDispatchResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.write().insert(tool.name().to_owned(), tool);
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .values()
            .map(|t| t.definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Invoke a tool by name. Unknown tools and tool failures both come
    /// back as error results.
    pub async fn dispatch(
        &self,
        tool_name: &str,
        tool_call_id: &str,
        args: serde_json::Value,
        abort: CancelToken,
    ) -> ToolDispatchResult {
        let tool = self.tools.read().get(tool_name).cloned();
        let Some(tool) = tool else {
            return ToolDispatchResult {
                content: format!("unknown tool: {tool_name}"),
                is_error: true,
            };
        };

        match tool.execute(tool_call_id, args, abort, None).await {
            Ok(output) => ToolDispatchResult {
                content: output.to_text(),
                is_error: false,
            },
            Err(e) => {
                tracing::warn!(tool = %tool_name, call_id = %tool_call_id, error = %e, "tool failed");
                ToolDispatchResult { content: e.message, is_error: true }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_domain::tool::{ToolError, ToolOutput, ToolUpdateFn};
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo the input back"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(
            &self,
            _tool_call_id: &str,
            args: serde_json::Value,
            _abort: CancelToken,
            _on_update: Option<ToolUpdateFn>,
        ) -> Result<ToolOutput, ToolError> {
            let text = args["text"].as_str().unwrap_or_default();
            if text.is_empty() {
                return Err(ToolError::new("text is required"));
            }
            Ok(ToolOutput::text(text))
        }
    }

    #[tokio::test]
    async fn dispatch_success() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let result = registry
            .dispatch("echo", "c1", serde_json::json!({"text": "hi"}), CancelToken::new())
            .await;
        assert!(!result.is_error);
        assert_eq!(result.content, "hi");
    }

    #[tokio::test]
    async fn tool_failure_becomes_error_result() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let result = registry
            .dispatch("echo", "c1", serde_json::json!({}), CancelToken::new())
            .await;
        assert!(result.is_error);
        assert_eq!(result.content, "text is required");
    }

    #[tokio::test]
    async fn unknown_tool_is_error_result() {
        let registry = ToolRegistry::new();
        let result = registry
            .dispatch("missing", "c1", serde_json::json!({}), CancelToken::new())
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("unknown tool"));
    }

    #[test]
    fn definitions_are_sorted() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
    }
}
