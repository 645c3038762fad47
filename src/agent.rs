//! Interactive agent loop.
//!
//! One [`Agent`] owns a whole session: the engine, the transcript, the render
//! buffer, the terminal handles and any command results waiting to be sent
//! with the next user message. Each [`Agent::step`] is one user turn.

use std::fmt;
use std::io::{self, BufRead, Write};

use colored::Colorize;

use crate::config::Config;
use crate::confirm::{self, ConfirmError};
use crate::conversation::ConversationStore;
use crate::engine::InferenceEngine;
use crate::error::AgentError;
use crate::extract::extract_all;
use crate::format::format_result;
use crate::input::{self, InputEnd};
use crate::logging;
use crate::models::Role;
use crate::runner::ProcessRunner;
use crate::template::RenderBuffer;
use crate::utils::format_bytes;

const PROCEED_PROMPT: &str = "Proceed?";
const SHARE_PROMPT: &str = "🤖 Share result with LLM?";

/// Session knobs resolved from configuration.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub render_capacity: usize,
    pub max_input_bytes: usize,
    /// Cap per captured stream in a formatted result.
    pub max_result_bytes: usize,
    pub terminator: u8,
    pub runner: ProcessRunner,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl AgentSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let runner = match config.shell() {
            Some((program, args)) => ProcessRunner::with_shell(program, args),
            None => ProcessRunner::platform_default(),
        };
        Self {
            render_capacity: config.render_capacity(),
            max_input_bytes: config.max_input_bytes(),
            max_result_bytes: config.max_result_bytes(),
            terminator: config.input_terminator(),
            runner,
        }
    }
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    AwaitingUserInput,
    Rendering,
    AwaitingModelReply,
    ScanningForCommands,
    AwaitingConfirmation,
    Executing,
    AwaitingShareDecision,
    CommittingAssistantTurn,
    Finished,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::AwaitingUserInput => "awaiting_user_input",
            AgentState::Rendering => "rendering",
            AgentState::AwaitingModelReply => "awaiting_model_reply",
            AgentState::ScanningForCommands => "scanning_for_commands",
            AgentState::AwaitingConfirmation => "awaiting_confirmation",
            AgentState::Executing => "executing",
            AgentState::AwaitingShareDecision => "awaiting_share_decision",
            AgentState::CommittingAssistantTurn => "committing_assistant_turn",
            AgentState::Finished => "finished",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Finished,
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// User turns sent to the model, not counting the system prompt.
    pub turns: usize,
    pub commands_run: usize,
    pub commands_declined: usize,
    pub results_shared: usize,
}

/// What the scan should do after one command block.
enum CommandFlow {
    Continue,
    InputClosed,
}

pub struct Agent<E, R, W> {
    engine: E,
    store: ConversationStore,
    buffer: RenderBuffer,
    settings: AgentSettings,
    input: R,
    output: W,
    pending_prefix: Option<String>,
    state: AgentState,
    summary: SessionSummary,
}

impl<E, R, W> Agent<E, R, W>
where
    E: InferenceEngine,
    R: BufRead,
    W: Write + Send,
{
    pub fn new(engine: E, settings: AgentSettings, input: R, output: W) -> Self {
        let buffer = RenderBuffer::with_capacity(settings.render_capacity);
        logging::debug(format!(
            "session using the {} engine, commands run through {}",
            engine.name(),
            settings.runner.program()
        ));
        Self {
            engine,
            store: ConversationStore::new(),
            buffer,
            settings,
            input,
            output,
            pending_prefix: None,
            state: AgentState::AwaitingUserInput,
            summary: SessionSummary::default(),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    #[must_use]
    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    #[must_use]
    pub fn state(&self) -> AgentState {
        self.state
    }

    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        self.summary
    }

    /// Formatted results waiting to lead the next user message.
    #[must_use]
    pub fn pending_prefix(&self) -> Option<&str> {
        self.pending_prefix.as_deref()
    }

    pub fn into_output(self) -> W {
        self.output
    }

    /// Send the system prompt and stream the model's opening reply.
    ///
    /// The opening reply is shown but never scanned for commands.
    pub async fn start(&mut self, system_prompt: &str) -> Result<(), AgentError> {
        self.store.append(Role::User, system_prompt);
        self.transition(AgentState::Rendering);
        let prompt = self.store.render_delta(&self.engine, &mut self.buffer, true)?;
        self.transition(AgentState::AwaitingModelReply);
        let reply = self.generate(&prompt).await?;
        self.commit_reply(&reply)?;
        self.transition(AgentState::AwaitingUserInput);
        Ok(())
    }

    /// Run one user turn.
    pub async fn step(&mut self) -> Result<StepOutcome, AgentError> {
        if self.state == AgentState::Finished {
            return Ok(StepOutcome::Finished);
        }

        self.transition(AgentState::AwaitingUserInput);
        write!(self.output, "{}", "> ".green())?;
        self.output.flush()?;

        let block = input::read_block(
            &mut self.input,
            self.settings.terminator,
            self.settings.max_input_bytes,
        )?;
        if block.end == InputEnd::EndOfInput {
            writeln!(self.output)?;
        }
        if block.truncated {
            let limit = format_bytes(self.settings.max_input_bytes);
            logging::warn(format!("input truncated to {limit}"));
            writeln!(self.output, "{}", format!("Input truncated to {limit}.").yellow())?;
        }

        let mut text = self.pending_prefix.take().unwrap_or_default();
        text.push_str(&block.text);
        if text.is_empty() {
            self.finish("no input");
            return Ok(StepOutcome::Finished);
        }

        self.store.append(Role::User, &text);
        self.summary.turns += 1;
        self.transition(AgentState::Rendering);
        let prompt = self.store.render_delta(&self.engine, &mut self.buffer, true)?;

        self.transition(AgentState::AwaitingModelReply);
        let reply = self.generate(&prompt).await?;

        let input_closed = self.scan_reply(&reply)?;
        self.commit_reply(&reply)?;

        if input_closed {
            self.finish("input closed during confirmation");
            return Ok(StepOutcome::Finished);
        }
        Ok(StepOutcome::Continue)
    }

    /// Step until the session ends.
    pub async fn run(&mut self) -> Result<SessionSummary, AgentError> {
        while self.step().await? == StepOutcome::Continue {}
        Ok(self.summary)
    }

    async fn generate(&mut self, prompt: &str) -> Result<String, AgentError> {
        let Self { engine, output, .. } = self;
        let mut write_error: Option<io::Error> = None;
        let mut on_piece = |piece: &str| {
            if write_error.is_some() {
                return;
            }
            if let Err(err) = write!(output, "{}", piece.yellow()).and_then(|()| output.flush()) {
                write_error = Some(err);
            }
        };
        let reply = engine.generate(prompt, &mut on_piece).await?;
        if let Some(err) = write_error {
            return Err(err.into());
        }
        writeln!(output)?;
        Ok(reply)
    }

    /// Offer every command block in `reply`. Returns true when the operator's
    /// input closed while a gate was waiting.
    fn scan_reply(&mut self, reply: &str) -> Result<bool, AgentError> {
        self.transition(AgentState::ScanningForCommands);
        for found in extract_all(reply) {
            match self.offer_command(&found.command)? {
                CommandFlow::Continue => self.transition(AgentState::ScanningForCommands),
                CommandFlow::InputClosed => return Ok(true),
            }
        }
        Ok(false)
    }

    fn offer_command(&mut self, command: &str) -> Result<CommandFlow, AgentError> {
        self.transition(AgentState::AwaitingConfirmation);
        writeln!(self.output)?;
        writeln!(self.output, "{}", "🔴 About to execute:".red().bold())?;
        writeln!(self.output)?;
        writeln!(self.output, "  {command}")?;
        writeln!(self.output)?;

        let Some(proceed) = self.ask(PROCEED_PROMPT)? else {
            return Ok(CommandFlow::InputClosed);
        };
        if !proceed {
            logging::info("command declined");
            self.summary.commands_declined += 1;
            return Ok(CommandFlow::Continue);
        }

        self.transition(AgentState::Executing);
        let outcome = match self.settings.runner.run(command) {
            Ok(outcome) => outcome,
            Err(err) => {
                logging::warn(format!("command failed to run: {err}"));
                writeln!(self.output, "{}", format!("exec error: {err}").red())?;
                return Ok(CommandFlow::Continue);
            }
        };
        self.summary.commands_run += 1;

        let formatted = format_result(command, &outcome, self.settings.max_result_bytes);
        write!(self.output, "{formatted}")?;

        self.transition(AgentState::AwaitingShareDecision);
        let Some(share) = self.ask(SHARE_PROMPT)? else {
            return Ok(CommandFlow::InputClosed);
        };
        if share {
            self.pending_prefix
                .get_or_insert_with(String::new)
                .push_str(&formatted);
            self.summary.results_shared += 1;
        }
        Ok(CommandFlow::Continue)
    }

    /// `None` means the operator's input is gone.
    fn ask(&mut self, prompt: &str) -> Result<Option<bool>, AgentError> {
        match confirm::ask(&mut self.input, &mut self.output, prompt) {
            Ok(answer) => Ok(Some(answer)),
            Err(ConfirmError::InputClosed) => Ok(None),
            Err(ConfirmError::Io(err)) => Err(err.into()),
        }
    }

    fn commit_reply(&mut self, reply: &str) -> Result<(), AgentError> {
        self.transition(AgentState::CommittingAssistantTurn);
        self.store.append(Role::Assistant, reply);
        self.store.render_delta(&self.engine, &mut self.buffer, false)?;
        Ok(())
    }

    fn finish(&mut self, reason: &str) {
        logging::info(format!("session finished: {reason}"));
        self.transition(AgentState::Finished);
    }

    fn transition(&mut self, next: AgentState) {
        if self.state != next {
            logging::debug(format!("agent state {} -> {}", self.state, next));
            self.state = next;
        }
    }
}
