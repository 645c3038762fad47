//! Whole-session tests: scripted model, in-memory terminal, real commands.

use std::io::Cursor;

use llmsh::conversation::RenderError;
use llmsh::engine::{EngineError, ScriptedEngine};
use llmsh::template::ChatTemplate;
use llmsh::{Agent, AgentError, AgentSettings, AgentState, SessionSummary};
use pretty_assertions::assert_eq;

type TestAgent = Agent<ScriptedEngine, Cursor<Vec<u8>>, Vec<u8>>;

fn session(engine: ScriptedEngine, input: &str) -> TestAgent {
    Agent::new(
        engine,
        AgentSettings::default(),
        Cursor::new(input.as_bytes().to_vec()),
        Vec::new(),
    )
}

fn scripted(replies: &[&str]) -> ScriptedEngine {
    ScriptedEngine::new(ChatTemplate::ChatMl, replies.iter().copied())
}

fn output_of(agent: TestAgent) -> String {
    String::from_utf8(agent.into_output()).expect("utf8 output")
}

#[cfg(unix)]
#[tokio::test]
async fn declined_first_command_still_runs_the_second() {
    let reply = "Two things:\n```exec\necho one\n```\nand\n```exec\necho two\n```\n";
    let mut agent = session(scripted(&["Hello!", reply]), "go\u{1a}\nNO\nYES\nNO\n");

    agent.start("system").await.expect("start");
    let summary = agent.run().await.expect("run");

    assert_eq!(
        summary,
        SessionSummary {
            turns: 1,
            commands_run: 1,
            commands_declined: 1,
            results_shared: 0,
        }
    );
    let output = output_of(agent);
    assert_eq!(output.matches("About to execute").count(), 2);
    assert!(output.contains("stdout:\n```\ntwo\n"));
    assert!(!output.contains("stdout:\n```\none\n"));
}

#[cfg(unix)]
#[tokio::test]
async fn shared_result_leads_the_next_prompt() {
    let replies = ["Hello!", "Let's see:\n```exec\necho hi\n```", "Got it."];
    let mut agent = session(scripted(&replies), "list\u{1a}\nyes\nyes\nand more\u{1a}\n");

    agent.start("system").await.expect("start");
    let summary = agent.run().await.expect("run");
    assert_eq!(summary.turns, 2);
    assert_eq!(summary.results_shared, 1);
    assert_eq!(agent.pending_prefix(), None);

    let prompts = agent.engine().prompts();
    assert_eq!(prompts.len(), 3);
    let follow_up = &prompts[2];
    assert!(follow_up.starts_with("<|im_start|>user\nI executed the command:\n```\necho hi\n\n```"));
    assert!(follow_up.contains("exit code: `0`"));
    assert!(follow_up.contains("stdout:\n```\nhi\n\n```\nand more<|im_end|>"));
    // Earlier turns were already consumed by the engine.
    assert!(!follow_up.contains("Let's see"));
    assert!(!follow_up.contains("list"));
}

#[cfg(unix)]
#[tokio::test]
async fn shared_result_is_sent_even_when_input_has_ended() {
    let replies = ["Hello!", "```exec\necho hi\n```", "Thanks."];
    let mut agent = session(scripted(&replies), "go\u{1a}\nyes\nyes\n");

    agent.start("system").await.expect("start");
    let summary = agent.run().await.expect("run");

    assert_eq!(summary.turns, 2);
    let prompts = agent.engine().prompts();
    assert!(prompts[2].starts_with("<|im_start|>user\nI executed the command:"));
    assert_eq!(agent.engine().remaining_replies(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn failing_command_reports_exit_code_and_stderr() {
    let reply = "```exec\necho not found >&2; exit 2\n```";
    let mut agent = session(scripted(&["Hello!", reply]), "go\u{1a}\nYES\nNO\n");

    agent.start("system").await.expect("start");
    agent.run().await.expect("run");

    let output = output_of(agent);
    assert!(output.contains("exit code: `2`"));
    assert!(output.contains("stderr:\n```\nnot found\n\n```"));
    assert!(output.contains("stdout:\n```\n\n```"));
}

#[tokio::test]
async fn end_of_input_finishes_the_session() {
    let mut agent = session(scripted(&["Hello!"]), "");

    agent.start("system").await.expect("start");
    let summary = agent.run().await.expect("run");

    assert_eq!(summary, SessionSummary::default());
    assert_eq!(agent.state(), AgentState::Finished);
    assert_eq!(agent.engine().prompts().len(), 1);
}

#[tokio::test]
async fn closed_input_at_the_gate_ends_after_committing_the_turn() {
    let reply = "```exec\necho never\n```";
    let mut agent = session(scripted(&["Hello!", reply]), "go\u{1a}");

    agent.start("system").await.expect("start");
    let summary = agent.run().await.expect("run");

    assert_eq!(summary.commands_run, 0);
    assert_eq!(agent.state(), AgentState::Finished);
    // system prompt, opening reply, user turn, reply
    assert_eq!(agent.store().len(), 4);
    let output = output_of(agent);
    assert_eq!(output.matches("Invalid input. Please enter YES or NO.").count(), 3);
}

#[tokio::test]
async fn template_failure_is_fatal() {
    let engine = scripted(&["Hello!"]).with_failing_template();
    let mut agent = session(engine, "");

    let err = agent.start("system").await.expect_err("template");
    assert!(matches!(
        err,
        AgentError::Render(RenderError::Engine(EngineError::Template(_)))
    ));
}

#[tokio::test]
async fn context_exhaustion_is_fatal() {
    let engine = scripted(&["Hello!", "This reply does not fit."]).with_context_limit(200);
    let mut agent = session(engine, &format!("{}\u{1a}", "x".repeat(150)));

    agent.start("system").await.expect("start");
    let err = agent.run().await.expect_err("exhausted");
    assert!(matches!(err, AgentError::Engine(EngineError::ContextExhausted(_))));
}

#[tokio::test]
async fn prompts_concatenate_to_the_engine_context() {
    let replies = ["Hello!", "First answer.", "Second answer."];
    let mut agent = session(scripted(&replies), "one\u{1a}\ntwo\u{1a}\n");

    agent.start("system").await.expect("start");
    agent.run().await.expect("run");

    let engine = agent.engine();
    let mut rebuilt = String::new();
    for (prompt, reply) in engine.prompts().iter().zip(replies) {
        rebuilt.push_str(prompt);
        rebuilt.push_str(reply);
        rebuilt.push_str(ChatTemplate::ChatMl.turn_suffix());
    }
    assert_eq!(rebuilt, engine.context());
    assert_eq!(agent.store().baseline(), engine.context().len());
}
