//! Worker wiring.
//!
//! Builds the object graph: in-memory collaborators (the reference
//! storage), the LLM provider, the tool registry, observers, lifecycle
//! deps, and the job handler. Production deployments swap the in-memory
//! stores for database-backed implementations of the same traits.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use companion_chat::{
    InMemoryAttachmentStore, InMemoryChatStore, NullRealtimeBus, Persona, Stream, StreamType,
};
use companion_core::{
    InMemorySessionStore, ObserverBus, RollingSummaryService, SummaryConfig, InMemorySummaryStore,
};
use companion_llm::{LlmProvider, OpenAiProvider};
use companion_outbox::{
    CompanionDispatcher, InMemoryEventLog, InMemoryJobQueue, InMemoryOutbox, MentionDispatcher,
    RetryPolicy,
};
use companion_runtime::{
    AgentLoop, ContextBuilder, LifecycleDeps, LlmSummarizer, LoopConfig, MetricsObserver,
    OrphanReaper, PersonaJobHandler, SessionTraceObserver,
};
use companion_tools::{
    FetchUrlTool, KeepResponseTool, LoadAttachmentTool, SendMessageTool, StaticSearchProvider,
    ToolRegistry, WebSearchTool, WorkspaceSearchTool,
};

use crate::Cli;

pub struct AppState {
    pub chat: Arc<InMemoryChatStore>,
    pub outbox: Arc<InMemoryOutbox>,
    pub queue: Arc<InMemoryJobQueue>,
    pub metrics: Arc<MetricsObserver>,
    pub handler: Arc<PersonaJobHandler>,
    pub companion_dispatcher: Arc<CompanionDispatcher>,
    pub mention_dispatcher: Arc<MentionDispatcher>,
    pub reaper: Arc<OrphanReaper>,
    pub retry_policy: RetryPolicy,
    /// Demo fixtures so stdin input lands somewhere sensible.
    pub demo_stream_id: String,
    pub demo_workspace_id: String,
}

impl AppState {
    pub fn new(cli: &Cli, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let chat = Arc::new(InMemoryChatStore::new());
        let attachments = Arc::new(InMemoryAttachmentStore::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let event_log = Arc::new(InMemoryEventLog::new());
        let outbox = Arc::new(InMemoryOutbox::new());
        let queue = Arc::new(InMemoryJobQueue::new());

        // Demo workspace: one companion stream with one persona.
        let mut persona = Persona::new("ws-demo", &cli.persona_slug, &cli.persona_name);
        persona.instructions = format!(
            "You are {}, the workspace companion. Be concise and helpful.",
            cli.persona_name
        );
        let persona_id = persona.id.clone();
        chat.insert_persona(persona);
        let stream =
            Stream::new("ws-demo", "demo", StreamType::Dm).with_companion(persona_id.clone());
        let demo_stream_id = stream.id.clone();
        chat.insert_stream(stream);

        let llm: Arc<dyn LlmProvider> = Arc::new(
            OpenAiProvider::new(cli.api_key.clone()).with_base_url(cli.llm_base_url.clone()),
        );

        let registry = Arc::new(ToolRegistry::new());
        registry.register(SendMessageTool::new())?;
        registry.register(KeepResponseTool::new())?;
        registry.register(WebSearchTool::new(Arc::new(StaticSearchProvider::default())))?;
        registry.register(FetchUrlTool::new())?;
        registry.register(WorkspaceSearchTool::new())?;
        registry.register(LoadAttachmentTool::new())?;

        let metrics = Arc::new(MetricsObserver::new());
        let trace = Arc::new(SessionTraceObserver::new(
            Arc::clone(&sessions) as _,
            Arc::new(NullRealtimeBus),
            Arc::clone(&chat) as _,
        ));
        let bus = ObserverBus::new()
            .with(Arc::clone(&metrics) as _)
            .with(trace as _);

        let lifecycle = LifecycleDeps {
            sessions: Arc::clone(&sessions) as _,
            event_log: Arc::clone(&event_log) as _,
            outbox: Arc::clone(&outbox) as _,
            bus: bus.clone(),
            server_id: format!("worker-{}", uuid::Uuid::new_v4()),
            heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
        };

        let summaries = Arc::new(RollingSummaryService::new(
            Arc::new(InMemorySummaryStore::new()),
            Arc::clone(&chat) as _,
            Arc::new(LlmSummarizer::new(Arc::clone(&llm), cli.model.clone())),
            SummaryConfig::default(),
        ));
        let builder = Arc::new(
            ContextBuilder::new(
                Arc::clone(&chat) as _,
                Arc::clone(&attachments) as _,
                Some(summaries),
            )
            .with_history_limit(cli.history_limit),
        );

        let loop_config = LoopConfig {
            model: cli.model.clone(),
            temperature: cli.temperature,
            max_iterations: cli.max_iterations,
            allow_no_message_output: false,
            truncation: companion_core::TruncationLimits {
                max_single_message_chars: cli.max_single_message_chars,
                max_message_chars: cli.max_message_chars,
            },
            max_output_tokens: None,
        };
        let agent_loop = Arc::new(AgentLoop::new(
            llm,
            Arc::clone(&registry),
            Arc::clone(&sessions) as _,
            bus.clone(),
            loop_config,
        ));

        let handler = Arc::new(PersonaJobHandler::new(
            Arc::clone(&chat) as _,
            Arc::clone(&chat) as _,
            Arc::clone(&attachments) as _,
            lifecycle,
            builder,
            agent_loop,
            None,
            shutdown,
        ));

        let companion_dispatcher = Arc::new(CompanionDispatcher::new(
            Arc::clone(&chat) as _,
            Arc::clone(&sessions) as _,
            Arc::clone(&queue) as _,
        ));
        let mention_dispatcher = Arc::new(MentionDispatcher::new(
            Arc::clone(&chat) as _,
            Arc::clone(&chat) as _,
            Arc::clone(&queue) as _,
        ));

        let reaper = Arc::new(
            OrphanReaper::new(
                Arc::clone(&sessions) as _,
                Arc::clone(&event_log) as _,
                Arc::clone(&outbox) as _,
                bus,
            )
            .with_timing(
                Duration::from_secs(cli.reaper_interval_secs),
                Duration::from_secs(cli.orphan_threshold_secs),
            ),
        );

        Ok(Self {
            chat,
            outbox,
            queue,
            metrics,
            handler,
            companion_dispatcher,
            mention_dispatcher,
            reaper,
            retry_policy: RetryPolicy {
                max_attempts: cli.job_max_attempts,
                base_backoff: Duration::from_millis(cli.job_base_backoff_ms),
            },
            demo_stream_id,
            demo_workspace_id: "ws-demo".to_string(),
        })
    }
}
