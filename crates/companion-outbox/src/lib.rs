//! companion-outbox - Durable event fanout and dispatch
//!
//! The front half of the pipeline: an append-only event log and outbox, a
//! time-leased cursor-locked listener with debounced wakeups, a FIFO job
//! queue with retry, and the two dispatchers that turn `message_created`
//! outbox entries into persona-agent jobs.

pub mod debounce;
pub mod dispatch;
pub mod listener;
pub mod memory;
pub mod queue;
pub mod record;

pub use debounce::DebounceWithMaxWait;
pub use dispatch::{
    CompanionDispatcher, MentionDispatcher, MessageCreatedPayload, PersonaAgentJob,
    MESSAGE_CREATED, PERSONA_AGENT_QUEUE,
};
pub use listener::{
    CursorLockedListener, ListenerConfig, ListenerError, ListenerHandle, OutboxHandler,
    ProcessResult,
};
pub use memory::{InMemoryEventLog, InMemoryOutbox};
pub use queue::{InMemoryJobQueue, Job, JobHandler, JobQueue, QueueError, RetryPolicy};
pub use record::{EventLog, EventRecord, OutboxError, OutboxStore};
