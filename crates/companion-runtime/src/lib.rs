//! companion-runtime - Session lifecycle and the agent loop
//!
//! The back half of the pipeline. A persona-agent job enters through
//! `PersonaJobHandler`, which:
//! 1. acquires the session under the single-running-per-stream invariant
//!    (`lifecycle`), with a heartbeat keeping the orphan reaper at bay,
//! 2. assembles prompt and history (`context`),
//! 3. runs the iterative loop (`runner`) with its prep-then-send
//!    reconsideration protocol,
//! 4. commits messages and completes the session.
//!
//! `reaper` recovers sessions lost to crashes; `trace` and `metrics` are
//! the two standard observers on the event bus.

pub mod config;
pub mod context;
pub mod handler;
pub mod hooks;
pub mod lifecycle;
pub mod metrics;
pub mod reaper;
pub mod runner;
pub mod summarizer;
pub mod trace;

pub use config::LoopConfig;
pub use context::{BuiltContext, ContextBuilder};
pub use handler::PersonaJobHandler;
pub use hooks::{CommitMessage, CommittedMessage, ResponseValidator, StoreCommitter};
pub use lifecycle::{with_companion_session, LifecycleDeps, RunOutcome};
pub use metrics::{MetricsObserver, MetricsSnapshot};
pub use reaper::OrphanReaper;
pub use runner::{AgentLoop, LoopRequest, LoopResult, RuntimeError};
pub use summarizer::LlmSummarizer;
pub use trace::SessionTraceObserver;
