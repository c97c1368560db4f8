//! Agent sessions, steps, and their store contracts.

mod memory;
mod step;
mod store;
mod types;

pub use memory::InMemorySessionStore;
pub use step::AgentStep;
pub use store::{AcquireOutcome, CompletionUpdate, NewSession, SessionStore, StepStore};
pub use types::{AgentSession, SessionError, SessionStatus, TriggeredBy};
