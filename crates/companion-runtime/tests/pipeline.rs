//! End-to-end pipeline scenarios against the in-memory collaborators and a
//! scripted model.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use companion_chat::{
    InMemoryAttachmentStore, InMemoryChatStore, MessageStore, Persona, Stream, StreamType,
};
use companion_core::{
    InMemorySessionStore, ObserverBus, SessionStatus, SessionStore, StepStore, TraceEvent,
    TraceObserver,
};
use companion_llm::{
    GenerateRequest, Generation, LlmError, LlmProvider, ScriptedProvider, ScriptedTurn,
};
use companion_outbox::{
    CompanionDispatcher, EventLog, EventRecord, InMemoryEventLog, InMemoryJobQueue,
    InMemoryOutbox, JobHandler, MentionDispatcher, OutboxHandler, RetryPolicy,
    MESSAGE_CREATED, PERSONA_AGENT_QUEUE,
};
use companion_runtime::{
    AgentLoop, ContextBuilder, LifecycleDeps, LoopConfig, MetricsObserver, OrphanReaper,
    PersonaJobHandler, SessionTraceObserver,
};
use companion_tools::{
    FetchUrlTool, KeepResponseTool, SendMessageTool, StaticSearchProvider, ToolRegistry,
    WebSearchTool,
};

/// Collects every trace event for assertions.
#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingObserver {
    fn kinds(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| {
                serde_json::to_value(e).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }
}

#[async_trait]
impl TraceObserver for RecordingObserver {
    fn name(&self) -> &str {
        "recording"
    }

    async fn on_event(&self, event: &TraceEvent) -> Result<(), String> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct Fixture {
    chat: Arc<InMemoryChatStore>,
    attachments: Arc<InMemoryAttachmentStore>,
    sessions: Arc<InMemorySessionStore>,
    event_log: Arc<InMemoryEventLog>,
    outbox: Arc<InMemoryOutbox>,
    queue: Arc<InMemoryJobQueue>,
    registry: Arc<ToolRegistry>,
    recorder: Arc<RecordingObserver>,
    metrics: Arc<MetricsObserver>,
    bus: ObserverBus,
    persona: Persona,
    shutdown: CancellationToken,
}

impl Fixture {
    fn new() -> Self {
        let chat = Arc::new(InMemoryChatStore::new());
        let attachments = Arc::new(InMemoryAttachmentStore::new());
        let sessions = Arc::new(InMemorySessionStore::new());

        let mut persona = Persona::new("ws", "sage", "Sage");
        persona.id = "persona-sage".to_string();
        persona.instructions = "You are Sage, the workspace companion.".to_string();
        chat.insert_persona(persona.clone());

        let mut stream = Stream::new("ws", "general", StreamType::Channel);
        stream.id = "stream-1".to_string();
        chat.insert_stream(stream.with_companion(persona.id.clone()));

        let registry = Arc::new(ToolRegistry::new());
        registry.register(SendMessageTool::new()).unwrap();
        registry.register(KeepResponseTool::new()).unwrap();

        let recorder = Arc::new(RecordingObserver::default());
        let metrics = Arc::new(MetricsObserver::new());
        let trace = Arc::new(SessionTraceObserver::new(
            Arc::clone(&sessions) as Arc<dyn StepStore>,
            Arc::new(companion_chat::NullRealtimeBus),
            Arc::clone(&chat) as _,
        ));
        let bus = ObserverBus::new()
            .with(Arc::clone(&recorder) as _)
            .with(Arc::clone(&metrics) as _)
            .with(trace as _);

        Self {
            chat,
            attachments,
            sessions,
            event_log: Arc::new(InMemoryEventLog::new()),
            outbox: Arc::new(InMemoryOutbox::new()),
            queue: Arc::new(InMemoryJobQueue::new()),
            registry,
            recorder,
            metrics,
            bus,
            persona,
            shutdown: CancellationToken::new(),
        }
    }

    fn lifecycle(&self) -> LifecycleDeps {
        LifecycleDeps {
            sessions: Arc::clone(&self.sessions) as _,
            event_log: Arc::clone(&self.event_log) as _,
            outbox: Arc::clone(&self.outbox) as _,
            bus: self.bus.clone(),
            server_id: "server-a".to_string(),
            heartbeat_interval: Duration::from_millis(50),
        }
    }

    fn handler(&self, llm: Arc<dyn LlmProvider>, config: LoopConfig) -> PersonaJobHandler {
        let builder = Arc::new(ContextBuilder::new(
            Arc::clone(&self.chat) as _,
            Arc::clone(&self.attachments) as _,
            None,
        ));
        let agent_loop = Arc::new(AgentLoop::new(
            llm,
            Arc::clone(&self.registry),
            Arc::clone(&self.sessions) as _,
            self.bus.clone(),
            config,
        ));
        PersonaJobHandler::new(
            Arc::clone(&self.chat) as _,
            Arc::clone(&self.chat) as _,
            Arc::clone(&self.attachments) as _,
            self.lifecycle(),
            builder,
            agent_loop,
            None,
            self.shutdown.clone(),
        )
    }

    fn companion_dispatcher(&self) -> CompanionDispatcher {
        CompanionDispatcher::new(
            Arc::clone(&self.chat) as _,
            Arc::clone(&self.sessions) as _,
            Arc::clone(&self.queue) as _,
        )
    }

    async fn emit_message_created(&self, message: &companion_chat::ChatMessage) -> i64 {
        self.outbox
            .append(
                MESSAGE_CREATED,
                json!({
                    "workspace_id": message.workspace_id,
                    "stream_id": message.stream_id,
                    "message_id": message.id,
                    "author_id": message.author_id,
                    "author_type": message.author_type,
                    "sequence": message.sequence,
                }),
            )
            .await
            .unwrap()
    }

    async fn outbox_batch(&self) -> Vec<EventRecord> {
        self.outbox.fetch_after(0, 100).await.unwrap()
    }
}

/// Scenario 1: user says "hi" in a companion-mode stream; the pipeline
/// produces exactly one job, one completed session, one persona message,
/// and a thinking-then-message_sent step trail.
#[tokio::test]
async fn simple_reply_end_to_end() {
    let fixture = Fixture::new();
    let trigger = fixture.chat.push_human_message("ws", "stream-1", "user-1", "hi");
    fixture.emit_message_created(&trigger).await;

    // Dispatch.
    let dispatcher = fixture.companion_dispatcher();
    let batch: Vec<EventRecord> = fixture
        .outbox_batch()
        .await
        .into_iter()
        .filter(|r| r.kind == MESSAGE_CREATED)
        .collect();
    dispatcher.process(&batch, 0).await;

    // Consume the one job.
    let llm = Arc::new(ScriptedProvider::new([ScriptedTurn::send_message(
        "Hello! How can I help?",
    )]));
    let handler = Arc::new(fixture.handler(llm, LoopConfig::default()));
    let cancel = CancellationToken::new();
    let queue = Arc::clone(&fixture.queue);
    let worker = tokio::spawn({
        let handler = Arc::clone(&handler) as Arc<dyn JobHandler>;
        let cancel = cancel.clone();
        async move {
            queue
                .run_worker(PERSONA_AGENT_QUEUE, handler, RetryPolicy::default(), cancel)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    worker.await.unwrap().unwrap();

    // One completed session.
    let session = fixture
        .sessions
        .find_by_trigger(&trigger.id)
        .await
        .unwrap()
        .expect("session exists");
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.sent_message_ids.len(), 1);

    // One persona message with the scripted content.
    let replies = fixture
        .chat
        .list_since("stream-1", trigger.sequence, None)
        .await
        .unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].text(), "Hello! How can I help?");
    assert_eq!(replies[0].session_id.as_deref(), Some(session.id.as_str()));

    // Steps include thinking then message_sent, gapless.
    let steps = fixture.sessions.list_steps(&session.id).await.unwrap();
    let types: Vec<&str> = steps.iter().map(|s| s.step_type.as_str()).collect();
    assert!(types.contains(&"thinking"));
    assert!(types.contains(&"message_sent"));
    let numbers: Vec<u32> = steps.iter().map(|s| s.step_number).collect();
    assert_eq!(numbers, (1..=numbers.len() as u32).collect::<Vec<_>>());

    // Metrics span closed as completed.
    let snapshot = fixture.metrics.snapshot();
    assert_eq!(snapshot.active_sessions, 0);
    assert_eq!(snapshot.finished.len(), 1);
}

/// An LLM that stages "A" on its first turn and slips a new user message
/// into the stream while doing so, then answers the reconsideration prompt.
struct RacingProvider {
    chat: Arc<InMemoryChatStore>,
    inner: ScriptedProvider,
    injected: Mutex<bool>,
}

#[async_trait]
impl LlmProvider for RacingProvider {
    async fn generate_with_tools(
        &self,
        request: GenerateRequest,
    ) -> Result<Generation, LlmError> {
        let first = {
            let mut injected = self.injected.lock().unwrap();
            let first = !*injected;
            *injected = true;
            first
        };
        let generation = self.inner.generate_with_tools(request).await?;
        if first {
            // "wait" lands after the draft is staged but before commit.
            self.chat.push_human_message("ws", "stream-1", "user-1", "wait, one more thing");
        }
        Ok(generation)
    }

    async fn generate_object(
        &self,
        model: &str,
        schema: &serde_json::Value,
        prompt: &str,
        temperature: f32,
    ) -> Result<serde_json::Value, LlmError> {
        self.inner
            .generate_object(model, schema, prompt, temperature)
            .await
    }
}

/// Scenario 2: prep-then-send with reconsideration. A message arriving
/// between staging and commit yields a reconsidering event and a single
/// committed reply; `last_seen_sequence` covers the late message.
#[tokio::test]
async fn reconsideration_on_racing_user_message() {
    let fixture = Fixture::new();
    let trigger = fixture.chat.push_human_message("ws", "stream-1", "user-1", "question?");

    let llm = Arc::new(RacingProvider {
        chat: Arc::clone(&fixture.chat),
        inner: ScriptedProvider::new([
            ScriptedTurn::send_message("A"),
            ScriptedTurn::send_message("A, and about your follow-up: noted."),
        ]),
        injected: Mutex::new(false),
    });

    let handler = fixture.handler(llm, LoopConfig::default());
    let outcome = handler
        .run_job(companion_outbox::PersonaAgentJob {
            workspace_id: "ws".to_string(),
            stream_id: "stream-1".to_string(),
            message_id: trigger.id.clone(),
            persona_id: fixture.persona.id.clone(),
            triggered_by: companion_core::TriggeredBy::Companion,
        })
        .await
        .unwrap();

    let companion_runtime::RunOutcome::Completed { session_id, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };

    let kinds = fixture.recorder.kinds();
    assert!(kinds.contains(&"reconsidering".to_string()), "{kinds:?}");

    // Exactly one committed persona reply; no duplicate messages.
    let replies: Vec<_> = fixture
        .chat
        .list_since("stream-1", 0, Some(&fixture.persona.id))
        .await
        .unwrap();
    let persona_messages = fixture
        .chat
        .list_since("stream-1", 0, None)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.author_id == fixture.persona.id)
        .count();
    assert_eq!(persona_messages, 1);
    assert_eq!(replies.len(), 2, "both user messages present");

    // The session absorbed the late message.
    let session = fixture.sessions.find_by_id(&session_id).await.unwrap().unwrap();
    let late = fixture
        .chat
        .list_since("stream-1", trigger.sequence, Some(&fixture.persona.id))
        .await
        .unwrap();
    assert_eq!(late.len(), 1);
    assert!(session.last_seen_sequence >= late[0].sequence);
}

/// Scenario 3: crash during work. The session stays running with a frozen
/// heartbeat until the reaper fails it; a retry for the same trigger
/// resumes and completes exactly once.
#[tokio::test]
async fn crash_recovery_via_reaper_and_retry() {
    let fixture = Fixture::new();
    let trigger = fixture.chat.push_human_message("ws", "stream-1", "user-1", "hello?");

    // "Crash": a session acquired, then the process dies (no completion).
    let outcome = fixture
        .sessions
        .acquire_for_trigger(companion_core::NewSession {
            workspace_id: "ws".to_string(),
            stream_id: "stream-1".to_string(),
            persona_id: fixture.persona.id.clone(),
            trigger_message_id: trigger.id.clone(),
            triggered_by: companion_core::TriggeredBy::Companion,
            server_id: "server-dead".to_string(),
            initial_sequence: trigger.sequence,
        })
        .await
        .unwrap();
    let companion_core::AcquireOutcome::Started(dead) = outcome else {
        panic!("expected start");
    };

    // Heartbeat frozen past the threshold.
    fixture.sessions.age_heartbeat(&dead.id, 120);
    let reaper = OrphanReaper::new(
        Arc::clone(&fixture.sessions) as _,
        Arc::clone(&fixture.event_log) as _,
        Arc::clone(&fixture.outbox) as _,
        fixture.bus.clone(),
    );
    assert_eq!(reaper.sweep_once().await, 1);
    let failed = fixture.sessions.find_by_id(&dead.id).await.unwrap().unwrap();
    assert_eq!(failed.status, SessionStatus::Failed);

    // Retry of the same trigger resumes the failed session and completes.
    let llm = Arc::new(ScriptedProvider::new([ScriptedTurn::send_message(
        "sorry for the delay!",
    )]));
    let handler = fixture.handler(llm, LoopConfig::default());
    let outcome = handler
        .run_job(companion_outbox::PersonaAgentJob {
            workspace_id: "ws".to_string(),
            stream_id: "stream-1".to_string(),
            message_id: trigger.id.clone(),
            persona_id: fixture.persona.id.clone(),
            triggered_by: companion_core::TriggeredBy::Companion,
        })
        .await
        .unwrap();
    assert!(matches!(outcome, companion_runtime::RunOutcome::Completed { .. }));

    // Still exactly one session for the trigger, now completed.
    let session = fixture
        .sessions
        .find_by_trigger(&trigger.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.id, dead.id);
    assert_eq!(session.status, SessionStatus::Completed);

    // A second run of the same job is a skip, not a duplicate.
    let llm = Arc::new(ScriptedProvider::new([ScriptedTurn::send_message("again?")]));
    let handler = fixture.handler(llm, LoopConfig::default());
    let rerun = handler
        .run_job(companion_outbox::PersonaAgentJob {
            workspace_id: "ws".to_string(),
            stream_id: "stream-1".to_string(),
            message_id: trigger.id.clone(),
            persona_id: fixture.persona.id.clone(),
            triggered_by: companion_core::TriggeredBy::Companion,
        })
        .await
        .unwrap();
    assert!(matches!(rerun, companion_runtime::RunOutcome::Skipped { .. }));
}

/// Scenario 4: two user messages with no active session. The first creates
/// the running session; the second's dispatch pass sees it running and
/// skips.
#[tokio::test]
async fn concurrent_dispatch_skips_while_running() {
    let fixture = Fixture::new();
    let first = fixture.chat.push_human_message("ws", "stream-1", "user-1", "first");
    let second = fixture.chat.push_human_message("ws", "stream-1", "user-1", "second");
    fixture.emit_message_created(&first).await;

    // First message dispatches and the session starts running.
    let dispatcher = fixture.companion_dispatcher();
    let batch = fixture.outbox_batch().await;
    dispatcher.process(&batch, 0).await;

    let outcome = fixture
        .sessions
        .acquire_for_trigger(companion_core::NewSession {
            workspace_id: "ws".to_string(),
            stream_id: "stream-1".to_string(),
            persona_id: fixture.persona.id.clone(),
            trigger_message_id: first.id.clone(),
            triggered_by: companion_core::TriggeredBy::Companion,
            server_id: "server-a".to_string(),
            initial_sequence: first.sequence,
        })
        .await
        .unwrap();
    let companion_core::AcquireOutcome::Started(running) = outcome else {
        panic!("expected start");
    };

    // The second message's outbox entry arrives while the session runs.
    let cursor = fixture.emit_message_created(&second).await;
    let batch: Vec<EventRecord> = fixture
        .outbox_batch()
        .await
        .into_iter()
        .filter(|r| r.id == cursor)
        .collect();
    dispatcher.process(&batch, cursor - 1).await;

    // No second session materialized for the busy stream.
    let for_second = fixture.sessions.find_by_trigger(&second.id).await.unwrap();
    assert!(for_second.is_none());

    // If the in-flight session did NOT absorb the second message, a later
    // dispatcher pass enqueues a fresh job.
    fixture
        .sessions
        .complete(
            &running.id,
            companion_core::CompletionUpdate {
                last_seen_sequence: first.sequence,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let batch: Vec<EventRecord> = fixture
        .outbox_batch()
        .await
        .into_iter()
        .filter(|r| r.id == cursor)
        .collect();
    dispatcher.process(&batch, cursor - 1).await;
    // The job queue got something this time: draining proves it.
    let got_job = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    struct Probe(Arc<std::sync::atomic::AtomicUsize>);
    #[async_trait]
    impl JobHandler for Probe {
        async fn handle(&self, _job: &companion_outbox::Job) -> Result<(), String> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }
    let cancel = CancellationToken::new();
    let worker = tokio::spawn({
        let queue = Arc::clone(&fixture.queue);
        let probe = Arc::new(Probe(Arc::clone(&got_job))) as Arc<dyn JobHandler>;
        let cancel = cancel.clone();
        async move {
            queue
                .run_worker(PERSONA_AGENT_QUEUE, probe, RetryPolicy::default(), cancel)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    worker.await.unwrap().unwrap();
    // Two jobs total: the first dispatch plus the post-completion one.
    assert_eq!(got_job.load(std::sync::atomic::Ordering::SeqCst), 2);
}

/// Scenario 5: the model tries to fetch a private address. The tool errors,
/// a tool:error event is emitted, the loop continues and still replies.
#[tokio::test]
async fn ssrf_attempt_is_refused_and_loop_continues() {
    let fixture = Fixture::new();
    fixture.registry.register(FetchUrlTool::new()).unwrap();
    let trigger = fixture
        .chat
        .push_human_message("ws", "stream-1", "user-1", "what's on the admin panel?");

    let llm = Arc::new(ScriptedProvider::new([
        ScriptedTurn::tool_call("fetch_url", json!({ "url": "http://10.0.0.1/admin" })),
        ScriptedTurn::send_message("I can't access internal addresses."),
    ]));
    let handler = fixture.handler(llm, LoopConfig::default());
    let outcome = handler
        .run_job(companion_outbox::PersonaAgentJob {
            workspace_id: "ws".to_string(),
            stream_id: "stream-1".to_string(),
            message_id: trigger.id.clone(),
            persona_id: fixture.persona.id.clone(),
            triggered_by: companion_core::TriggeredBy::Companion,
        })
        .await
        .unwrap();

    assert!(matches!(outcome, companion_runtime::RunOutcome::Completed { .. }));
    let kinds = fixture.recorder.kinds();
    assert!(kinds.contains(&"tool_error".to_string()), "{kinds:?}");
    assert!(kinds.contains(&"message_sent".to_string()));
}

/// Scenario 6: the model never sends anything. With no-message output
/// disallowed, the session fails with the canonical error.
#[tokio::test]
async fn iteration_exhaustion_fails_the_session() {
    let fixture = Fixture::new();
    fixture
        .registry
        .register(WebSearchTool::new(Arc::new(StaticSearchProvider::default())))
        .unwrap();
    let trigger = fixture.chat.push_human_message("ws", "stream-1", "user-1", "hmm");

    let turns: Vec<ScriptedTurn> = (0..3)
        .map(|_| ScriptedTurn::tool_call("web_search", json!({ "query": "anything" })))
        .collect();
    let llm = Arc::new(ScriptedProvider::new(turns));

    let config = LoopConfig {
        max_iterations: 3,
        ..LoopConfig::default()
    };
    let handler = fixture.handler(llm, config);
    let result = handler
        .run_job(companion_outbox::PersonaAgentJob {
            workspace_id: "ws".to_string(),
            stream_id: "stream-1".to_string(),
            message_id: trigger.id.clone(),
            persona_id: fixture.persona.id.clone(),
            triggered_by: companion_core::TriggeredBy::Companion,
        })
        .await;

    let error = result.unwrap_err();
    assert!(error
        .to_string()
        .contains("loop completed without sending a message"));

    let session = fixture
        .sessions
        .find_by_trigger(&trigger.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session
        .error
        .as_deref()
        .unwrap()
        .contains("loop completed without sending a message"));
    // No partial message was committed.
    let persona_messages = fixture
        .chat
        .list_since("stream-1", 0, None)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.author_id == fixture.persona.id)
        .count();
    assert_eq!(persona_messages, 0);
}

/// Mention dispatch end-to-end: an @mention of an active persona produces a
/// job; inactive or unknown slugs produce none.
#[tokio::test]
async fn mention_pipeline_produces_single_job() {
    let fixture = Fixture::new();
    let message = fixture
        .chat
        .push_human_message("ws", "stream-1", "user-1", "@sage can you check @nobody?");
    fixture.emit_message_created(&message).await;

    let dispatcher = MentionDispatcher::new(
        Arc::clone(&fixture.chat) as _,
        Arc::clone(&fixture.chat) as _,
        Arc::clone(&fixture.queue) as _,
    );
    let batch = fixture.outbox_batch().await;
    dispatcher.process(&batch, 0).await;

    let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    struct Probe(Arc<std::sync::atomic::AtomicUsize>);
    #[async_trait]
    impl JobHandler for Probe {
        async fn handle(&self, job: &companion_outbox::Job) -> Result<(), String> {
            let parsed: companion_outbox::PersonaAgentJob =
                serde_json::from_value(job.payload.clone()).unwrap();
            assert_eq!(parsed.triggered_by, companion_core::TriggeredBy::Mention);
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }
    let cancel = CancellationToken::new();
    let worker = tokio::spawn({
        let queue = Arc::clone(&fixture.queue);
        let probe = Arc::new(Probe(Arc::clone(&count))) as Arc<dyn JobHandler>;
        let cancel = cancel.clone();
        async move {
            queue
                .run_worker(PERSONA_AGENT_QUEUE, probe, RetryPolicy::default(), cancel)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    worker.await.unwrap().unwrap();

    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
}
