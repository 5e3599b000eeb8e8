//! LLM streaming-client contract.
//!
//! The gateway core never speaks a provider wire protocol. It depends on
//! this trait: given messages and a tool set, an implementation yields a
//! typed event stream and signals `Done` exactly once. HTTP/SSE adapters
//! live outside this workspace; the [`mock`] module provides a scripted
//! client for tests.

pub mod mock;

use std::pin::Pin;

use serde::{Deserialize, Serialize};

use ag_domain::tool::{Message, ToolDefinition};
use ag_domain::Result;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events yielded while streaming one LLM turn.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LlmEvent {
    /// Incremental assistant text.
    TextDelta { text: String },

    /// Incremental reasoning/thinking text.
    ThinkingDelta { text: String },

    /// A tool call is complete with full arguments.
    ToolCallEnd {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// Stream finished. Emitted exactly once per turn.
    Done {
        stop_reason: StopReason,
        usage: Option<Usage>,
    },

    /// The stream failed. Terminal; no `Done` follows.
    Error { message: String, reason: String },
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// Token usage for one turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One streaming request to the model.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Session the request belongs to (provider-side caching / routing hint).
    pub session_id: String,
}

/// The external LLM streaming client.
///
/// Retries for transient HTTP failures belong in the implementation, not
/// in the gateway core.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat_stream(&self, req: LlmRequest) -> Result<BoxStream<'static, LlmEvent>>;

    /// Provider identifier ("anthropic", "openai", …).
    fn provider_id(&self) -> &str;
}

/// Placeholder client for deployments that have not wired a provider:
/// every turn fails with a `chat.error`. The gateway stays up.
pub struct NullClient;

#[async_trait::async_trait]
impl LlmClient for NullClient {
    async fn chat_stream(&self, _req: LlmRequest) -> Result<BoxStream<'static, LlmEvent>> {
        let stream = async_stream::stream! {
            yield LlmEvent::Error {
                message: "no LLM client configured".into(),
                reason: "unconfigured".into(),
            };
        };
        Ok(Box::pin(stream))
    }

    fn provider_id(&self) -> &str {
        "null"
    }
}
