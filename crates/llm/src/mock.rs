//! Scripted mock client for tests.
//!
//! Each call to `chat_stream` pops the next script from the queue and plays
//! its events back, optionally pausing between them. When the queue is
//! empty the last script is replayed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{BoxStream, LlmClient, LlmEvent, LlmRequest, StopReason, Usage};
use ag_domain::Result;

/// One scripted turn: events played back in order.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub events: Vec<LlmEvent>,
    /// Delay inserted before each event.
    pub event_gap: Option<Duration>,
}

impl Script {
    /// A plain text answer split into `chunks`, then a clean `Done`.
    pub fn text_chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut events: Vec<LlmEvent> = chunks
            .into_iter()
            .map(|c| LlmEvent::TextDelta { text: c.into() })
            .collect();
        events.push(LlmEvent::Done {
            stop_reason: StopReason::EndTurn,
            usage: Some(Usage { input_tokens: 10, output_tokens: 5 }),
        });
        Self { events, event_gap: None }
    }

    /// A single tool call followed by `Done { ToolUse }`.
    pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> Self {
        Self {
            events: vec![
                LlmEvent::ToolCallEnd {
                    id: id.into(),
                    name: name.into(),
                    arguments,
                },
                LlmEvent::Done {
                    stop_reason: StopReason::ToolUse,
                    usage: Some(Usage { input_tokens: 10, output_tokens: 5 }),
                },
            ],
            event_gap: None,
        }
    }

    pub fn with_gap(mut self, gap: Duration) -> Self {
        self.event_gap = Some(gap);
        self
    }
}

/// A mock [`LlmClient`] that replays scripted events.
pub struct MockClient {
    scripts: Mutex<VecDeque<Script>>,
    last: Mutex<Script>,
    /// Requests observed, for assertions on what the runner sent.
    pub requests: Arc<Mutex<Vec<LlmRequest>>>,
}

impl MockClient {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        let queue: VecDeque<Script> = scripts.into_iter().collect();
        let last = queue.back().cloned().unwrap_or_else(|| Script::text_chunks(["ok"]));
        Self {
            scripts: Mutex::new(queue),
            last: Mutex::new(last),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Append another script to the queue.
    pub fn push(&self, script: Script) {
        *self.last.lock() = script.clone();
        self.scripts.lock().push_back(script);
    }
}

#[async_trait::async_trait]
impl LlmClient for MockClient {
    async fn chat_stream(&self, req: LlmRequest) -> Result<BoxStream<'static, LlmEvent>> {
        self.requests.lock().push(req);
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.last.lock().clone());

        let stream = async_stream::stream! {
            for event in script.events {
                if let Some(gap) = script.event_gap {
                    tokio::time::sleep(gap).await;
                }
                yield event;
            }
        };
        Ok(Box::pin(stream))
    }

    fn provider_id(&self) -> &str {
        "mock"
    }
}
