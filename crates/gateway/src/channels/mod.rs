//! Channel plugin manager.
//!
//! Adapters implement [`ChannelAdapter`] (start/stop/send) and emit
//! normalized [`InboundMsg`]s into the manager's fan-in channel. The
//! manager routes inbound traffic through each channel's auto-reply
//! pipeline and fans outbound replies back to the right adapter.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use ag_domain::config::{ChannelConfig, Peer};
use ag_domain::{Error, Result};

use crate::auto_reply::AutoReplyPipeline;
use crate::state::AppState;

const INBOUND_FANIN_CAPACITY: usize = 256;

/// A normalized inbound message from any channel adapter.
#[derive(Debug, Clone)]
pub struct InboundMsg {
    pub channel: String,
    pub account_id: String,
    pub peer: Peer,
    pub peer_name: Option<String>,
    /// Platform-native message id (echo detection, reply threading).
    pub message_id: String,
    pub text: String,
    pub attachments: Vec<serde_json::Value>,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub thread_id: Option<String>,
}

/// Outbound payload handed to an adapter's `send`.
#[derive(Debug, Clone)]
pub enum OutboundPayload {
    Text(String),
    Reply {
        text: String,
        reply_to_message_id: String,
    },
}

impl OutboundPayload {
    pub fn text(&self) -> &str {
        match self {
            OutboundPayload::Text(text) => text,
            OutboundPayload::Reply { text, .. } => text,
        }
    }
}

/// Runtime context handed to an adapter at start.
pub struct ChannelContext {
    pub config: ChannelConfig,
    /// Where the adapter pushes normalized inbound messages.
    pub inbound: mpsc::Sender<InboundMsg>,
}

/// Contract every channel adapter implements. Wire protocols live in the
/// adapter; the gateway core only sees this surface. Adapters own their
/// outbound retry policy (exponential backoff on recoverable errors).
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, ctx: ChannelContext) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Deliver a payload to a target (peer/chat id). Returns the platform
    /// message id when the channel reports one.
    async fn send(&self, target: &str, payload: OutboundPayload) -> Result<Option<String>>;
}

/// Registry and lifecycle manager for channel adapters.
pub struct ChannelManager {
    adapters: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
    pipelines: RwLock<HashMap<String, Arc<AutoReplyPipeline>>>,
    inbound_tx: mpsc::Sender<InboundMsg>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMsg>>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_FANIN_CAPACITY);
        Self {
            adapters: RwLock::new(HashMap::new()),
            pipelines: RwLock::new(HashMap::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters
            .write()
            .insert(adapter.name().to_owned(), adapter);
    }

    /// Sender adapters use to push inbound messages (also used by tests
    /// to inject synthetic traffic).
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMsg> {
        self.inbound_tx.clone()
    }

    pub fn adapter(&self, channel: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.read().get(channel).cloned()
    }

    pub fn pipeline(&self, channel: &str) -> Option<Arc<AutoReplyPipeline>> {
        self.pipelines.read().get(channel).cloned()
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Build per-channel pipelines, start enabled adapters, and spawn the
    /// inbound fan-in loop.
    pub async fn start(&self, state: &AppState) {
        for (name, config) in &state.config.channels {
            if !config.enabled {
                continue;
            }
            let pipeline = Arc::new(AutoReplyPipeline::new(state.clone(), name, config.clone()));
            self.pipelines.write().insert(name.clone(), pipeline);

            let Some(adapter) = self.adapter(name) else {
                tracing::warn!(channel = %name, "channel configured but no adapter registered");
                continue;
            };
            let ctx = ChannelContext {
                config: config.clone(),
                inbound: self.inbound_sender(),
            };
            match adapter.start(ctx).await {
                Ok(()) => tracing::info!(channel = %name, "channel started"),
                Err(e) => tracing::error!(channel = %name, error = %e, "channel failed to start"),
            }
        }

        // Fan-in loop: every adapter's messages land here.
        let Some(mut inbound_rx) = self.inbound_rx.lock().take() else {
            return;
        };
        let state = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound_rx.recv().await {
                let pipeline = state.channels.pipeline(&msg.channel);
                match pipeline {
                    Some(pipeline) => pipeline.handle(msg),
                    None => {
                        tracing::debug!(channel = %msg.channel, "inbound for unconfigured channel dropped");
                    }
                }
            }
        });
    }

    /// Stop all adapters and flush pending debounce batches.
    pub async fn stop(&self) {
        let adapters: Vec<Arc<dyn ChannelAdapter>> =
            self.adapters.read().values().cloned().collect();
        for adapter in adapters {
            if let Err(e) = adapter.stop().await {
                tracing::warn!(channel = %adapter.name(), error = %e, "channel stop failed");
            }
        }
        let pipelines: Vec<Arc<AutoReplyPipeline>> =
            self.pipelines.read().values().cloned().collect();
        for pipeline in pipelines {
            pipeline.flush_all();
        }
    }

    /// Deliver text to a channel target and record the sent message id
    /// for echo suppression.
    pub async fn deliver(&self, channel: &str, target: &str, text: &str) -> Result<()> {
        let adapter = self.adapter(channel).ok_or_else(|| Error::Channel {
            channel: channel.to_owned(),
            message: "no such channel".into(),
        })?;
        let message_id = adapter
            .send(target, OutboundPayload::Text(text.to_owned()))
            .await?;
        if let (Some(message_id), Some(pipeline)) = (message_id, self.pipeline(channel)) {
            pipeline.mark_outbound(&message_id);
        }
        Ok(())
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}
