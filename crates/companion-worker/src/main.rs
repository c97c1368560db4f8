//! companion-worker: the queue-consumer process.
//!
//! Runs the two outbox listeners (companion + mention dispatch), the
//! persona-agent queue worker, and the orphan reaper, then waits for
//! ctrl-c and tears everything down through one cancellation token.
//!
//! Lines typed on stdin become human messages in a demo companion stream,
//! which exercises the full pipeline against a live LLM endpoint.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

use companion_chat::MessageStore;
use companion_outbox::{
    CursorLockedListener, DebounceWithMaxWait, EventLog, ListenerConfig, JobHandler,
    MESSAGE_CREATED, PERSONA_AGENT_QUEUE,
};

mod state;

use state::AppState;

#[derive(Parser, Debug, Clone)]
#[command(name = "companion-worker")]
#[command(about = "Companion agent worker")]
#[command(version)]
pub struct Cli {
    /// LLM model id
    #[arg(long, env = "COMPANION_MODEL", default_value = "gpt-4o-mini")]
    pub model: String,

    /// Sampling temperature
    #[arg(long, env = "COMPANION_TEMPERATURE", default_value = "0.7")]
    pub temperature: f32,

    /// LLM API base URL
    #[arg(long, env = "LLM_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub llm_base_url: String,

    /// LLM API key
    #[arg(long, env = "LLM_API_KEY", default_value = "sk-test")]
    pub api_key: String,

    /// Iteration ceiling per session
    #[arg(long, env = "COMPANION_MAX_ITERATIONS", default_value = "20")]
    pub max_iterations: usize,

    /// Per-message character cap
    #[arg(long, env = "COMPANION_MAX_SINGLE_MESSAGE_CHARS", default_value = "50000")]
    pub max_single_message_chars: usize,

    /// Aggregate history character cap
    #[arg(long, env = "COMPANION_MAX_MESSAGE_CHARS", default_value = "400000")]
    pub max_message_chars: usize,

    /// Messages kept in the active window
    #[arg(long, env = "COMPANION_HISTORY_LIMIT", default_value = "50")]
    pub history_limit: usize,

    /// Listener lease duration (ms)
    #[arg(long, env = "COMPANION_LEASE_MS", default_value = "30000")]
    pub lease_ms: u64,

    /// Listener lease refresh interval (ms); must be < lease/2
    #[arg(long, env = "COMPANION_LEASE_REFRESH_MS", default_value = "10000")]
    pub lease_refresh_ms: u64,

    /// Lease acquisition retries before giving up
    #[arg(long, env = "COMPANION_LEASE_RETRIES", default_value = "5")]
    pub lease_retries: u32,

    /// Base backoff between lease attempts (ms)
    #[arg(long, env = "COMPANION_LEASE_BACKOFF_MS", default_value = "250")]
    pub lease_backoff_ms: u64,

    /// Dispatch debounce quiet period (ms)
    #[arg(long, env = "COMPANION_DEBOUNCE_MS", default_value = "150")]
    pub debounce_ms: u64,

    /// Dispatch debounce forced deadline (ms)
    #[arg(long, env = "COMPANION_DEBOUNCE_MAX_WAIT_MS", default_value = "2000")]
    pub debounce_max_wait_ms: u64,

    /// Session heartbeat cadence (seconds)
    #[arg(long, env = "COMPANION_HEARTBEAT_SECS", default_value = "15")]
    pub heartbeat_interval_secs: u64,

    /// Orphan sweep cadence (seconds)
    #[arg(long, env = "COMPANION_REAPER_INTERVAL_SECS", default_value = "15")]
    pub reaper_interval_secs: u64,

    /// Heartbeats older than this are orphans (seconds)
    #[arg(long, env = "COMPANION_ORPHAN_THRESHOLD_SECS", default_value = "60")]
    pub orphan_threshold_secs: u64,

    /// Job delivery attempts before dropping
    #[arg(long, env = "COMPANION_JOB_ATTEMPTS", default_value = "3")]
    pub job_max_attempts: u32,

    /// Base backoff between job retries (ms)
    #[arg(long, env = "COMPANION_JOB_BACKOFF_MS", default_value = "500")]
    pub job_base_backoff_ms: u64,

    /// Demo persona slug
    #[arg(long, env = "COMPANION_PERSONA_SLUG", default_value = "sage")]
    pub persona_slug: String,

    /// Demo persona display name
    #[arg(long, env = "COMPANION_PERSONA_NAME", default_value = "Sage")]
    pub persona_name: String,
}

fn listener_config(cli: &Cli, listener_id: &str) -> ListenerConfig {
    let mut config = ListenerConfig::new(listener_id);
    config.lock_duration = Duration::from_millis(cli.lease_ms);
    config.refresh_interval = Duration::from_millis(cli.lease_refresh_ms);
    config.max_retries = cli.lease_retries;
    config.base_backoff = Duration::from_millis(cli.lease_backoff_ms);
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("starting companion worker");
    log::info!("  model: {}", cli.model);
    log::info!("  llm base url: {}", cli.llm_base_url);
    log::info!("  max iterations: {}", cli.max_iterations);

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::new(&cli, shutdown.clone())?);
    let mut tasks = tokio::task::JoinSet::new();

    // Companion dispatch listener.
    let companion_listener = Arc::new(CursorLockedListener::new(
        Arc::clone(&state.outbox) as _,
        Arc::clone(&state.companion_dispatcher) as _,
        listener_config(&cli, "companion-dispatcher"),
    ));
    let companion_wake = companion_listener.handle();
    tasks.spawn({
        let listener = Arc::clone(&companion_listener);
        let cancel = shutdown.clone();
        async move {
            if let Err(error) = listener.run(cancel).await {
                log::error!("companion listener exited: {error}");
            }
        }
    });

    // Mention dispatch listener.
    let mention_listener = Arc::new(CursorLockedListener::new(
        Arc::clone(&state.outbox) as _,
        Arc::clone(&state.mention_dispatcher) as _,
        listener_config(&cli, "mention-dispatcher"),
    ));
    let mention_wake = mention_listener.handle();
    tasks.spawn({
        let listener = Arc::clone(&mention_listener);
        let cancel = shutdown.clone();
        async move {
            if let Err(error) = listener.run(cancel).await {
                log::error!("mention listener exited: {error}");
            }
        }
    });

    // Debounced wakeup shared by both listeners.
    let debounce = Arc::new(DebounceWithMaxWait::spawn(
        Duration::from_millis(cli.debounce_ms),
        Duration::from_millis(cli.debounce_max_wait_ms),
        shutdown.clone(),
        move || {
            let companion_wake = companion_wake.clone();
            let mention_wake = mention_wake.clone();
            async move {
                companion_wake.wake();
                mention_wake.wake();
            }
        },
    ));

    // Persona-agent queue worker.
    tasks.spawn({
        let queue = Arc::clone(&state.queue);
        let handler = Arc::clone(&state.handler) as Arc<dyn JobHandler>;
        let policy = state.retry_policy;
        let cancel = shutdown.clone();
        async move {
            if let Err(error) = queue
                .run_worker(PERSONA_AGENT_QUEUE, handler, policy, cancel)
                .await
            {
                log::error!("queue worker exited: {error}");
            }
        }
    });

    // Orphan reaper.
    tasks.spawn({
        let reaper = Arc::clone(&state.reaper);
        let cancel = shutdown.clone();
        async move {
            reaper.run(cancel).await;
        }
    });

    // Stdin demo: each line becomes a human message in the demo stream.
    tasks.spawn({
        let state = Arc::clone(&state);
        let debounce = Arc::clone(&debounce);
        let cancel = shutdown.clone();
        async move {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            log::info!("type a message and press enter (demo stream)");
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                let Ok(Some(line)) = line else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                let message = state.chat.push_human_message(
                    &state.demo_workspace_id,
                    &state.demo_stream_id,
                    "demo-user",
                    text,
                );
                if let Err(error) = state
                    .outbox
                    .append(
                        MESSAGE_CREATED,
                        serde_json::json!({
                            "workspace_id": message.workspace_id,
                            "stream_id": message.stream_id,
                            "message_id": message.id,
                            "author_id": message.author_id,
                            "author_type": message.author_type,
                            "sequence": message.sequence,
                        }),
                    )
                    .await
                {
                    log::error!("outbox append failed: {error}");
                    continue;
                }
                debounce.trigger();
            }
        }
    });

    // Demo echo: print persona replies as they land.
    tasks.spawn({
        let state = Arc::clone(&state);
        let cancel = shutdown.clone();
        async move {
            let mut seen = 0i64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(300)) => {}
                }
                let Ok(messages) = state
                    .chat
                    .list_since(&state.demo_stream_id, seen, Some("demo-user"))
                    .await
                else {
                    continue;
                };
                for message in messages {
                    seen = seen.max(message.sequence);
                    println!("{}", message.text());
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    let snapshot = state.metrics.snapshot();
    log::info!(
        "shutdown complete: {} session(s) finished, {} still active",
        snapshot.finished.len(),
        snapshot.active_sessions
    );
    Ok(())
}
