//! Auto-reply pipeline — decides which inbound messages trigger turns.
//!
//! Order per message: echo suppression, group gating, then the per-peer
//! debouncer. When a debounce batch fires, the batch becomes one chat
//! run on the routed session.

use std::time::Duration;

use ag_domain::config::{ChannelConfig, PeerKind};
use ag_domain::trace::TraceEvent;
use ag_sessions::routing::{resolve_agent_route, RouteInput};
use ag_sessions::store::{DeliveryContext, SessionEntry};

use crate::auto_reply::echo::EchoTracker;
use crate::auto_reply::gating::group_message_triggers;
use crate::auto_reply::MessageDebouncer;
use crate::channels::InboundMsg;
use crate::runtime::chat_queue::{self, SubmitParams};
use crate::state::AppState;

pub struct AutoReplyPipeline {
    channel: String,
    config: ChannelConfig,
    echo: EchoTracker,
    debouncer: MessageDebouncer<InboundMsg>,
}

impl AutoReplyPipeline {
    pub fn new(state: AppState, channel: &str, config: ChannelConfig) -> Self {
        let debounce = Duration::from_millis(config.debounce_ms);
        let echo_window = Duration::from_secs(config.echo_window_secs);

        let debouncer = MessageDebouncer::new(debounce, move |_peer_key, batch| {
            let state = state.clone();
            tokio::spawn(async move {
                dispatch_batch(state, batch).await;
            });
        });

        Self {
            channel: channel.to_owned(),
            config,
            echo: EchoTracker::new(echo_window),
            debouncer,
        }
    }

    /// Record an outbound message id for echo suppression.
    pub fn mark_outbound(&self, message_id: &str) {
        self.echo.mark_outbound(message_id);
    }

    /// Feed one inbound message through the pipeline.
    pub fn handle(&self, msg: InboundMsg) {
        // 1. Our own message echoing back?
        if self.echo.is_echo(&msg.message_id) {
            tracing::debug!(channel = %self.channel, message_id = %msg.message_id, "echo dropped");
            TraceEvent::ChannelInbound {
                channel: self.channel.clone(),
                peer_kind: msg.peer.kind.as_str().to_owned(),
                accepted: false,
            }
            .emit();
            return;
        }

        // 2. Group gating.
        if msg.peer.kind == PeerKind::Group
            && !group_message_triggers(
                &self.config,
                &msg.text,
                &msg.sender_id,
                msg.sender_name.as_deref(),
            )
        {
            tracing::debug!(channel = %self.channel, peer = %msg.peer.id, "group message gated");
            TraceEvent::ChannelInbound {
                channel: self.channel.clone(),
                peer_kind: msg.peer.kind.as_str().to_owned(),
                accepted: false,
            }
            .emit();
            return;
        }

        TraceEvent::ChannelInbound {
            channel: self.channel.clone(),
            peer_kind: msg.peer.kind.as_str().to_owned(),
            accepted: true,
        }
        .emit();

        // 3. Debounce per (kind, peer) so a DM and a group with the same
        //    id never share a batch.
        let key = format!("{}:{}", msg.peer.kind.as_str(), msg.peer.id.to_lowercase());
        self.debouncer.add(&key, msg);
    }

    /// Deliver pending batches immediately (shutdown).
    pub fn flush_all(&self) {
        self.debouncer.flush_all();
    }
}

/// Turn one debounce batch into a chat run on the routed session.
async fn dispatch_batch(state: AppState, batch: Vec<InboundMsg>) {
    let Some(first) = batch.first() else {
        return;
    };

    let route = resolve_agent_route(
        &state.config,
        &state.identity,
        &RouteInput {
            channel: first.channel.clone(),
            account_id: first.account_id.clone(),
            peer: first.peer.clone(),
            thread_id: first.thread_id.clone(),
        },
    );

    let last = batch.last().expect("batch is non-empty");
    let delivery_context = DeliveryContext {
        channel: Some(first.channel.clone()),
        to: Some(first.peer.id.clone()),
        account_id: Some(first.account_id.clone()),
        thread_id: first.thread_id.clone(),
        reply_to: Some(last.message_id.clone()),
    };

    let agent_config = state.config.agent.clone();
    let channel = first.channel.clone();
    let chat_type = first.peer.kind.as_str().to_owned();

    let ensured = state.store.ensure(&route.session_key, || {
        SessionEntry::new(&agent_config.model_provider, &agent_config.model)
    });
    let entry = match ensured {
        Ok((entry, _is_new)) => entry,
        Err(e) => {
            tracing::error!(session_key = %route.session_key, error = %e, "session create failed");
            return;
        }
    };

    // Stale sessions reset before the turn (daily boundary, idle timeout).
    if let Some(reason) =
        state
            .lifecycle
            .should_reset(&entry, &first.channel, first.peer.kind, chrono::Utc::now())
    {
        tracing::info!(session_key = %route.session_key, reason = %reason, "resetting session");
        state.agents.evict(&entry.session_id);
        if let Err(e) = state.store.reset(&route.session_key, &reason.to_string()) {
            tracing::warn!(session_key = %route.session_key, error = %e, "session reset failed");
        }
    }
    let updated = state.store.update_entry(&route.session_key, |entry| {
        entry.chat_type = Some(chat_type.clone());
        entry.channel = Some(channel.clone());
        entry.last_channel = Some(channel.clone());
        entry.last_to = Some(first.peer.id.clone());
        entry.last_account_id = Some(first.account_id.clone());
        entry.last_thread_id = first.thread_id.clone();
        entry.delivery_context = Some(delivery_context.clone());
    });
    if let Err(e) = updated {
        tracing::warn!(session_key = %route.session_key, error = %e, "session hint update failed");
    }

    let text = batch
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    match chat_queue::submit(&state, SubmitParams {
        session_key: route.session_key.clone(),
        message: text,
        ..Default::default()
    }) {
        Ok(run_id) => {
            tracing::debug!(
                session_key = %route.session_key,
                run_id = %run_id,
                batch = batch.len(),
                "inbound batch enqueued"
            );
        }
        Err(e) => {
            tracing::warn!(session_key = %route.session_key, error = %e, "inbound enqueue rejected");
        }
    }
}
