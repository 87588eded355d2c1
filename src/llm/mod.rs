pub mod agentic;
pub mod client;
pub mod parse;
pub mod prompts;
#[cfg(test)]
pub(crate) mod scripted;
pub mod tools;

pub use agentic::{run_tool_loop, AgenticOutcome};
pub use client::{ChatBackend, Message, OpenRouterClient, ResponseMessage, ToolCallMessage};
pub use parse::repair_proposal_json;
pub use tools::{execute_tool, tool_definitions, ToolDefinition};
