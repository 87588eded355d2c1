//! Bounded tool-calling loop.
//!
//! The model explores the repository through the read-only tools until it
//! answers with plain text or runs out of turns. The last allowed turn is
//! made without tools and with an explicit request for the final answer; a
//! model that still asks for tools then is reported as incomplete.

use super::client::{ChatBackend, Message};
use super::prompts::FINAL_ANSWER_NUDGE;
use super::tools::{execute_tool, tool_definitions};
use crate::gateway::RepositoryGateway;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum AgenticOutcome {
    /// The model produced a final text answer.
    Completed { content: String, turns: usize },
    /// The turn budget ran out while the model was still exploring.
    Incomplete {
        turns: usize,
        last_content: Option<String>,
    },
}

/// Drive the model until it answers or `max_turns` model calls have been made.
///
/// Errors are backend failures only; tool failures are fed back to the model.
pub async fn run_tool_loop(
    backend: &dyn ChatBackend,
    gateway: &dyn RepositoryGateway,
    system: &str,
    user: &str,
    max_turns: usize,
) -> anyhow::Result<AgenticOutcome> {
    let max_turns = max_turns.max(1);
    let tools = tool_definitions();
    let mut messages = vec![Message::system(system), Message::user(user)];

    for turn in 1..=max_turns {
        let last = turn == max_turns;
        if last && turn > 1 {
            messages.push(Message::user(FINAL_ANSWER_NUDGE));
        }
        let offered = if last { &[][..] } else { &tools[..] };

        let response = backend.complete(&messages, offered).await?;
        let calls = response.requested_tools().to_vec();

        if calls.is_empty() {
            info!(turn, "model returned final answer");
            return Ok(AgenticOutcome::Completed {
                content: response.content.unwrap_or_default(),
                turns: turn,
            });
        }

        if last {
            warn!(turn, "model still requesting tools after the turn limit");
            return Ok(AgenticOutcome::Incomplete {
                turns: turn,
                last_content: response.content,
            });
        }

        debug!(turn, tool_calls = calls.len(), "model requested tools");
        messages.push(Message::assistant_tool_calls(response.content, calls.clone()));
        for call in &calls {
            let result = execute_tool(gateway, call).await;
            messages.push(Message::tool_result(&result.tool_call_id, result.content));
        }
    }

    // Unreachable: the final iteration always returns.
    Ok(AgenticOutcome::Incomplete {
        turns: max_turns,
        last_content: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use crate::llm::scripted::ScriptedBackend;

    fn repo() -> MemoryGateway {
        MemoryGateway::new("main").with_file("index.html", "<h1>Hi</h1>\n")
    }

    #[tokio::test]
    async fn test_immediate_answer_completes_in_one_turn() {
        let backend = ScriptedBackend::new().reply("{\"ok\": true}");
        let outcome = run_tool_loop(&backend, &repo(), "sys", "user", 12)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AgenticOutcome::Completed {
                content: "{\"ok\": true}".to_string(),
                turns: 1
            }
        );
        assert_eq!(backend.turns()[0].tools_offered, 3);
    }

    #[tokio::test]
    async fn test_tool_results_are_fed_back() {
        let backend = ScriptedBackend::new()
            .tool_call("c1", "read_file", r#"{"path": "index.html"}"#)
            .reply("done");
        let outcome = run_tool_loop(&backend, &repo(), "sys", "user", 12)
            .await
            .unwrap();
        assert!(matches!(outcome, AgenticOutcome::Completed { turns: 2, .. }));

        let second = &backend.turns()[1].messages;
        assert_eq!(second.len(), 4);
        assert_eq!(second[2].role, "assistant");
        assert_eq!(second[3].role, "tool");
        assert_eq!(second[3].tool_call_id.as_deref(), Some("c1"));
        assert!(second[3]
            .content
            .as_deref()
            .unwrap()
            .contains("   1│ <h1>Hi</h1>"));
    }

    #[tokio::test]
    async fn test_last_turn_offers_no_tools_and_nudges() {
        let backend = ScriptedBackend::new()
            .tool_call("c1", "list_files", "{}")
            .tool_call("c2", "list_files", "{}")
            .reply("final");
        let outcome = run_tool_loop(&backend, &repo(), "sys", "user", 3)
            .await
            .unwrap();
        assert!(matches!(outcome, AgenticOutcome::Completed { turns: 3, .. }));

        let turns = backend.turns();
        assert_eq!(turns[1].tools_offered, 3);
        assert_eq!(turns[2].tools_offered, 0);
        let nudge = turns[2].messages.last().unwrap();
        assert_eq!(nudge.content.as_deref(), Some(FINAL_ANSWER_NUDGE));
    }

    #[tokio::test]
    async fn test_exceeding_turn_limit_is_incomplete() {
        let backend = ScriptedBackend::new()
            .tool_call("c1", "list_files", "{}")
            .tool_call("c2", "list_files", "{}");
        let outcome = run_tool_loop(&backend, &repo(), "sys", "user", 2)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AgenticOutcome::Incomplete {
                turns: 2,
                last_content: None
            }
        );
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let backend = ScriptedBackend::new().fail("Invalid API key");
        let err = run_tool_loop(&backend, &repo(), "sys", "user", 12)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid API key");
    }
}
