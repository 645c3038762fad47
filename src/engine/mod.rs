//! Inference engine boundary.
//!
//! The agent loop only needs two capabilities from a model backend: render a
//! transcript through its chat template, and stream a reply to a prompt. The
//! engine is stateful: each prompt continues the context built by earlier
//! prompts and replies, so callers send only the new suffix.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Message;
use crate::template::RenderBuffer;

pub mod llama_server;
pub mod scripted;

pub use llama_server::{LlamaServerEngine, LlamaServerSettings};
pub use scripted::ScriptedEngine;

/// Errors raised by an inference engine. All of them end the session.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("chat template rendering failed: {0}")]
    Template(String),
    #[error("context window exhausted: {0}")]
    ContextExhausted(String),
    #[error("inference server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("inference request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response from inference server: {0}")]
    Protocol(String),
}

/// A model backend the agent can converse with.
#[async_trait]
pub trait InferenceEngine: Send {
    /// Short human readable backend name.
    fn name(&self) -> &str;

    /// Render `messages` into `out` and return the length the full rendering
    /// requires. A result larger than `out.capacity()` means the buffer holds
    /// a prefix only and the caller should grow it and render again.
    fn render_template(
        &self,
        messages: &[Message],
        add_assistant: bool,
        out: &mut RenderBuffer,
    ) -> Result<usize, EngineError>;

    /// Feed `prompt` to the model and stream the reply.
    ///
    /// `on_piece` receives text as it is produced. Returns the full reply once
    /// the model emits its end-of-generation token.
    async fn generate(
        &mut self,
        prompt: &str,
        on_piece: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String, EngineError>;
}
