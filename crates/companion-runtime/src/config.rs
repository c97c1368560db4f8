//! Loop configuration.

use companion_core::TruncationLimits;

pub const DEFAULT_MAX_ITERATIONS: usize = 20;

/// Knobs for one agent loop run. Integrators set these at the boundary;
/// nothing here is read from the environment directly.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub model: String,
    pub temperature: f32,
    /// Hard ceiling on LLM iterations.
    pub max_iterations: usize,
    /// Enables the keep_response path: the loop may legitimately finish
    /// without committing a message (supersede reruns).
    pub allow_no_message_output: bool,
    pub truncation: TruncationLimits,
    pub max_output_tokens: Option<u32>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            allow_no_message_output: false,
            truncation: TruncationLimits::default(),
            max_output_tokens: None,
        }
    }
}
