//! Deterministic chat backend for tests.

use super::client::{ChatBackend, FunctionCallMessage, Message, ResponseMessage, ToolCallMessage};
use super::tools::ToolDefinition;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

enum Step {
    Reply(ResponseMessage),
    Fail(String),
}

/// What the backend was asked on one turn.
#[derive(Debug, Clone)]
pub struct RecordedTurn {
    pub messages: Vec<Message>,
    pub tools_offered: usize,
}

/// Replays a fixed sequence of replies, one per `complete` call.
#[derive(Default)]
pub struct ScriptedBackend {
    steps: Mutex<VecDeque<Step>>,
    turns: Mutex<Vec<RecordedTurn>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, content: &str) -> Self {
        self.push(Step::Reply(ResponseMessage::text(content)))
    }

    /// A turn that requests one tool call.
    pub fn tool_call(self, id: &str, name: &str, arguments: &str) -> Self {
        self.push(Step::Reply(ResponseMessage {
            content: None,
            tool_calls: Some(vec![ToolCallMessage {
                id: id.to_string(),
                call_type: "function".to_string(),
                function: FunctionCallMessage {
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                },
            }]),
        }))
    }

    pub fn fail(self, message: &str) -> Self {
        self.push(Step::Fail(message.to_string()))
    }

    fn push(self, step: Step) -> Self {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back(step);
        }
        self
    }

    pub fn turns(&self) -> Vec<RecordedTurn> {
        self.turns.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> anyhow::Result<ResponseMessage> {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push(RecordedTurn {
                messages: messages.to_vec(),
                tools_offered: tools.len(),
            });
        }

        let step = self.steps.lock().ok().and_then(|mut s| s.pop_front());
        match step {
            Some(Step::Reply(reply)) => Ok(reply),
            Some(Step::Fail(message)) => Err(anyhow::anyhow!("{}", message)),
            None => Err(anyhow::anyhow!("scripted backend has no more replies")),
        }
    }
}
