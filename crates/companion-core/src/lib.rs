//! companion-core - Session lifecycle model, trace events and context shaping
//!
//! The pieces every other crate builds on:
//! - `session` - Agent session rows, steps, and the store contracts with
//!   their conditional single-running semantics
//! - `message` - The generic LLM-facing chat message shape
//! - `events` - The strongly-typed trace event stream and observer bus
//! - `truncation` - Deterministic per-message and aggregate budget reduction
//! - `summary` - The rolling summary service for out-of-window history

pub mod events;
pub mod message;
pub mod observer;
pub mod session;
pub mod summary;
pub mod truncation;

pub use events::{ReconsideredDraft, ToolErrorInfo, TraceEvent};
pub use message::{Message, Role, ToolCallRequest, ToolSchema};
pub use observer::{ObserverBus, TraceObserver};
pub use session::{
    AcquireOutcome, AgentSession, AgentStep, CompletionUpdate, InMemorySessionStore, NewSession,
    SessionError, SessionStatus, SessionStore, StepStore, TriggeredBy,
};
pub use summary::{
    InMemorySummaryStore, RollingSummary, RollingSummaryService, SummaryConfig, SummaryError,
    SummaryStore, Summarizer,
};
pub use truncation::{truncate_history, truncate_message, TruncationLimits};
