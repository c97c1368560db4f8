//! companion-llm - LLM provider contract and implementations
//!
//! The runtime talks to models through `LlmProvider`: a tool-calling text
//! generation call plus a schema-constrained object call used by the
//! rolling summary service. `OpenAiProvider` speaks the OpenAI-compatible
//! chat-completions dialect; `ScriptedProvider` replays canned turns for
//! tests.

pub mod openai;
pub mod provider;
pub mod scripted;

pub use openai::OpenAiProvider;
pub use provider::{GenerateRequest, Generation, LlmError, LlmProvider};
pub use scripted::{ScriptedProvider, ScriptedTurn};
