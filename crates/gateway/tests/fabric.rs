//! Fabric-level integration: scope-guarded fan-out, queue policies taken
//! from the session entry, lifecycle resets on inbound traffic, and hook
//! overrides flowing into the turn.

use std::sync::Arc;
use std::time::Duration;

use ag_domain::config::{ChannelConfig, Config, DmScope, Peer, PeerKind};
use ag_llm::mock::{MockClient, Script};
use ag_llm::LlmClient;
use ag_sessions::store::{QueueDrop, QueueMode, SessionEntry};
use ag_sessions::{IdentityResolver, SessionStore};

use ag_gateway::auto_reply::AutoReplyPipeline;
use ag_gateway::channels::InboundMsg;
use ag_gateway::runtime::chat_queue::{self, SubmitParams};
use ag_gateway::state::AppState;

fn test_state_with(
    dir: &tempfile::TempDir,
    llm: Arc<dyn LlmClient>,
    tweak: impl FnOnce(&mut Config),
) -> AppState {
    let mut config = Config::default();
    config.state.state_dir = dir.path().join("state");
    config.agent.workspace_dir = dir.path().join("workspace");
    config.agent.skills_dir = dir.path().join("workspace/skills");
    config.session.dm_scope = DmScope::PerPeer;
    config.channels.insert("tg".into(), ChannelConfig {
        bot_name: "clawd".into(),
        debounce_ms: 20,
        ..Default::default()
    });
    tweak(&mut config);
    let config = Arc::new(config);

    let state_dir = config.state.state_dir.clone();
    std::fs::create_dir_all(&state_dir).unwrap();
    let cron_store =
        ag_gateway::cron::store::CronStore::load(&state_dir, config.cron.run_log_cap).unwrap();

    AppState {
        config: config.clone(),
        store: Arc::new(SessionStore::new(&state_dir).unwrap()),
        identity: Arc::new(IdentityResolver::from_config(&config.session.identity_links)),
        lifecycle: Arc::new(ag_sessions::LifecycleManager::new(
            config.session.lifecycle.clone(),
        )),
        devices: Arc::new(ag_protocol::device::DeviceStore::in_memory()),
        bus: Arc::new(ag_gateway::server::broadcast::EventBus::new()),
        dedupe: Arc::new(ag_gateway::server::dedupe::DedupeCache::new()),
        presence: Arc::new(ag_gateway::server::presence::PresenceRegistry::new()),
        heartbeat: Arc::new(ag_gateway::server::heartbeat::HeartbeatQueue::new()),
        agents: Arc::new(ag_gateway::runtime::agents::AgentSessions::new()),
        chat: Arc::new(ag_gateway::runtime::chat_queue::ChatQueue::new()),
        tools: Arc::new(ag_gateway::runtime::tools::ToolRegistry::new()),
        hooks: Arc::new(ag_gateway::hooks::HookRegistry::new()),
        llm,
        cron: Arc::new(ag_gateway::cron::service::CronService::new(cron_store)),
        channels: Arc::new(ag_gateway::channels::ChannelManager::new()),
        workspace: Arc::new(ag_gateway::workspace::WorkspaceReader::new(
            config.agent.workspace_dir.clone(),
        )),
        seeds: Arc::new(ag_gateway::workspace::SeedTracker::load(&state_dir).unwrap()),
    }
}

#[tokio::test(start_paused = true)]
async fn scoped_connections_see_only_permitted_run_events() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state_with(&dir, Arc::new(MockClient::new([Script::text_chunks(["ok"])])), |_| {});

    let (_reader, mut reader_rx) =
        state
            .bus
            .conns
            .register("reader", "operator", vec!["operator.read".into()]);
    let (_probe, mut probe_rx) = state.bus.conns.register("probe", "watch", vec![]);

    let mut tap = state.bus.subscribe();
    chat_queue::submit(&state, SubmitParams {
        session_key: "agent:main:main".into(),
        message: "hi".into(),
        ..Default::default()
    })
    .unwrap();

    // Drain the internal tap until the run completes.
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(30), tap.recv())
            .await
            .unwrap()
            .unwrap();
        if frame.event == "chat.final" {
            break;
        }
    }

    // The scoped reader saw guarded chat events; the unscoped probe none.
    let mut reader_events = Vec::new();
    while let Ok(frame) = reader_rx.try_recv() {
        if let ag_gateway::server::connection::Outbound::Event(ef) = frame {
            reader_events.push(ef.event);
        }
    }
    assert!(reader_events.iter().any(|e| e == "chat.started"));
    assert!(reader_events.iter().any(|e| e == "chat.final"));

    while let Ok(frame) = probe_rx.try_recv() {
        if let ag_gateway::server::connection::Outbound::Event(ef) = frame {
            assert!(
                !ef.event.starts_with("chat"),
                "unscoped connection received {}",
                ef.event
            );
        }
    }
}

#[tokio::test(start_paused = true)]
async fn queue_cap_drop_new_rejects_excess_runs() {
    let dir = tempfile::tempdir().unwrap();
    // Slow first run keeps the worker busy so later submits stay pending.
    let slow = Script::text_chunks(["busy"]).with_gap(Duration::from_secs(60));
    let state = test_state_with(&dir, Arc::new(MockClient::new([slow])), |_| {});

    state
        .store
        .ensure("agent:main:main", || {
            let mut entry = SessionEntry::new("anthropic", "m1");
            entry.queue_cap = Some(1);
            entry.queue_drop = QueueDrop::New;
            entry
        })
        .unwrap();

    let submit = |msg: &str| {
        chat_queue::submit(&state, SubmitParams {
            session_key: "agent:main:main".into(),
            message: msg.into(),
            ..Default::default()
        })
    };

    submit("one").unwrap();
    // Let the worker pick up the first run so it leaves the pending queue.
    tokio::time::sleep(Duration::from_millis(50)).await;
    submit("two").unwrap();
    // Cap is 1 pending; drop=new rejects the third.
    assert!(submit("three").is_err());
}

#[tokio::test(start_paused = true)]
async fn queue_collect_folds_messages_into_one_run() {
    let dir = tempfile::tempdir().unwrap();
    let slow = Script::text_chunks(["busy"]).with_gap(Duration::from_secs(5));
    let mock = Arc::new(MockClient::new([slow, Script::text_chunks(["folded"])]));
    let state = test_state_with(&dir, mock.clone(), |_| {});

    state
        .store
        .ensure("agent:main:main", || {
            let mut entry = SessionEntry::new("anthropic", "m1");
            entry.queue_mode = QueueMode::Collect;
            entry
        })
        .unwrap();

    let submit = |msg: &str| {
        chat_queue::submit(&state, SubmitParams {
            session_key: "agent:main:main".into(),
            message: msg.into(),
            ..Default::default()
        })
        .unwrap()
    };

    let _first = submit("first");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = submit("second");
    let third = submit("third");
    // Folded into the same pending entry.
    assert_eq!(second, third);

    let mut tap = state.bus.subscribe();
    let mut finals = 0;
    while finals < 2 {
        let frame = tokio::time::timeout(Duration::from_secs(60), tap.recv())
            .await
            .unwrap()
            .unwrap();
        if frame.event == "chat.final" {
            finals += 1;
        }
    }

    // The folded run's request carried both texts in one user message.
    let requests = mock.requests.lock();
    let folded = requests
        .last()
        .unwrap()
        .messages
        .iter()
        .rev()
        .find(|m| m.role == ag_domain::tool::Role::User)
        .unwrap()
        .content
        .extract_all_text();
    assert!(folded.contains("second") && folded.contains("third"));
}

#[tokio::test(start_paused = true)]
async fn idle_session_resets_on_next_inbound() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state_with(
        &dir,
        Arc::new(MockClient::new([Script::text_chunks(["hello"])])),
        |config| {
            config.session.lifecycle.idle_minutes = Some(30);
        },
    );

    // A session last touched an hour ago.
    let stale_ts = (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp_millis();
    state
        .store
        .ensure("agent:main:dm:u42", || {
            let mut entry = SessionEntry::new("anthropic", "m1");
            entry.updated_at = stale_ts;
            entry
        })
        .unwrap();
    let old_id = state.store.get("agent:main:dm:u42").unwrap().session_id;

    let pipeline = AutoReplyPipeline::new(
        state.clone(),
        "tg",
        state.config.channels["tg"].clone(),
    );
    pipeline.handle(InboundMsg {
        channel: "tg".into(),
        account_id: "default".into(),
        peer: Peer { kind: PeerKind::Dm, id: "u42".into() },
        peer_name: None,
        message_id: "m1".into(),
        text: "back again".into(),
        attachments: Vec::new(),
        sender_id: "u42".into(),
        sender_name: None,
        thread_id: None,
    });

    let mut tap = state.bus.subscribe();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(30), tap.recv())
            .await
            .unwrap()
            .unwrap();
        if frame.event == "chat.final" {
            break;
        }
    }

    let new_id = state.store.get("agent:main:dm:u42").unwrap().session_id;
    assert_ne!(old_id, new_id, "stale session must get a fresh session id");
}

#[tokio::test(start_paused = true)]
async fn before_agent_start_overrides_reach_the_model() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("workspace")).unwrap();
    std::fs::write(dir.path().join("workspace/SOUL.md"), "base prompt").unwrap();

    let mock = Arc::new(MockClient::new([Script::text_chunks(["done"])]));
    let state = test_state_with(&dir, mock.clone(), |_| {});

    state.hooks.register_fn("before_agent_start", |_, _| {
        Ok(Some(serde_json::json!({
            "prependContext": "remember: the user prefers brevity",
            "systemPrompt": "overridden prompt",
        })))
    });

    chat_queue::submit(&state, SubmitParams {
        session_key: "agent:main:main".into(),
        message: "hi".into(),
        ..Default::default()
    })
    .unwrap();

    let mut tap = state.bus.subscribe();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(30), tap.recv())
            .await
            .unwrap()
            .unwrap();
        if frame.event == "chat.final" {
            break;
        }
    }

    let requests = mock.requests.lock();
    let system = requests[0]
        .messages
        .iter()
        .find(|m| m.role == ag_domain::tool::Role::System)
        .unwrap()
        .content
        .extract_all_text();
    assert!(system.contains("overridden prompt"));
    assert!(system.starts_with("remember: the user prefers brevity"));
    assert!(!system.contains("base prompt"), "systemPrompt override replaces assembly");
}
