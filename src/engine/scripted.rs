//! Offline engine that replays canned replies.
//!
//! Used by tests and dry runs. Every prompt it receives is recorded so the
//! incremental prompt contract can be checked from the outside.

use std::cell::Cell;
use std::collections::VecDeque;

use async_trait::async_trait;

use super::{EngineError, InferenceEngine};
use crate::models::Message;
use crate::template::{ChatTemplate, RenderBuffer};

#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    template: ChatTemplate,
    replies: VecDeque<String>,
    prompts: Vec<String>,
    context: String,
    context_limit: Option<usize>,
    piece_len: usize,
    fail_template: bool,
    render_drift: usize,
    renders: Cell<usize>,
}

impl ScriptedEngine {
    pub fn new<I, S>(template: ChatTemplate, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            template,
            replies: replies.into_iter().map(Into::into).collect(),
            prompts: Vec::new(),
            context: String::new(),
            context_limit: None,
            piece_len: 4,
            fail_template: false,
            render_drift: 0,
            renders: Cell::new(0),
        }
    }

    /// Fail generation once the context would exceed `bytes`.
    #[must_use]
    pub fn with_context_limit(mut self, bytes: usize) -> Self {
        self.context_limit = Some(bytes);
        self
    }

    /// Make every template render fail.
    #[must_use]
    pub fn with_failing_template(mut self) -> Self {
        self.fail_template = true;
        self
    }

    /// Over-report the rendered length by `bytes` more on every render, so
    /// the required length never settles.
    #[must_use]
    pub fn with_render_drift(mut self, bytes: usize) -> Self {
        self.render_drift = bytes;
        self
    }

    /// Template renders performed so far.
    #[must_use]
    pub fn render_count(&self) -> usize {
        self.renders.get()
    }

    /// Prompts received so far, in order.
    #[must_use]
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    /// Everything the engine has consumed or produced.
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    #[must_use]
    pub fn remaining_replies(&self) -> usize {
        self.replies.len()
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn render_template(
        &self,
        messages: &[Message],
        add_assistant: bool,
        out: &mut RenderBuffer,
    ) -> Result<usize, EngineError> {
        if self.fail_template {
            return Err(EngineError::Template(format!(
                "{} template refused {} messages",
                self.template,
                messages.len()
            )));
        }
        let renders = self.renders.get() + 1;
        self.renders.set(renders);
        let required = self.template.render(messages, add_assistant, out);
        Ok(required + self.render_drift * renders)
    }

    async fn generate(
        &mut self,
        prompt: &str,
        on_piece: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String, EngineError> {
        self.prompts.push(prompt.to_string());
        self.context.push_str(prompt);

        let reply = self
            .replies
            .pop_front()
            .ok_or_else(|| EngineError::Protocol("no scripted reply left".to_string()))?;

        if let Some(limit) = self.context_limit {
            let needed = self.context.len() + reply.len();
            if needed > limit {
                return Err(EngineError::ContextExhausted(format!(
                    "{needed} bytes needed, {limit} available"
                )));
            }
        }

        let chars: Vec<char> = reply.chars().collect();
        for piece in chars.chunks(self.piece_len.max(1)) {
            let piece: String = piece.iter().collect();
            on_piece(&piece);
        }

        self.context.push_str(&reply);
        self.context.push_str(self.template.turn_suffix());
        Ok(reply)
    }
}
