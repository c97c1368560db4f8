//! Scripted provider for tests.
//!
//! Pops pre-programmed turns in order. Scenario tests script the exact
//! sequence of text/tool-call turns the loop should see.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use companion_core::{Message, ToolCallRequest};

use crate::provider::{GenerateRequest, Generation, LlmError, LlmProvider, Result};

/// One canned model turn.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        let name = name.into();
        Self {
            text: String::new(),
            tool_calls: vec![ToolCallRequest {
                id: format!("call-{name}"),
                name,
                arguments,
            }],
        }
    }

    pub fn and_tool_call(mut self, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        let name = name.into();
        self.tool_calls.push(ToolCallRequest {
            id: format!("call-{name}-{}", self.tool_calls.len()),
            name,
            arguments,
        });
        self
    }

    /// Shorthand for the common "stage a reply" turn.
    pub fn send_message(content: impl Into<String>) -> Self {
        Self::tool_call("send_message", json!({ "content": content.into() }))
    }
}

#[derive(Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    objects: Mutex<VecDeque<serde_json::Value>>,
    /// Every request the loop made, for assertions.
    pub requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            objects: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        self.turns.lock().unwrap().push_back(turn);
    }

    pub fn push_object(&self, object: serde_json::Value) {
        self.objects.lock().unwrap().push_back(object);
    }

    pub fn remaining_turns(&self) -> usize {
        self.turns.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate_with_tools(&self, request: GenerateRequest) -> Result<Generation> {
        self.requests.lock().unwrap().push(request);
        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Api("scripted provider ran out of turns".to_string()))?;

        let assistant = Message::assistant(
            turn.text.clone(),
            (!turn.tool_calls.is_empty()).then(|| turn.tool_calls.clone()),
        );
        Ok(Generation {
            text: turn.text,
            tool_calls: turn.tool_calls,
            messages: vec![assistant],
        })
    }

    async fn generate_object(
        &self,
        _model: &str,
        _schema: &serde_json::Value,
        _prompt: &str,
        _temperature: f32,
    ) -> Result<serde_json::Value> {
        self.objects
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Api("scripted provider ran out of objects".to_string()))
    }
}
