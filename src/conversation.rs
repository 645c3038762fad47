//! Conversation transcript and incremental prompt deltas.
//!
//! The engine keeps its own context across turns, so each turn only sends
//! the part of the rendered transcript it has not seen. The store tracks the
//! rendered length committed after the last completed turn and hands out the
//! text past that point.

use thiserror::Error;

use crate::engine::{EngineError, InferenceEngine};
use crate::logging;
use crate::models::{Message, Role};
use crate::template::RenderBuffer;

/// Fatal failures while computing a prompt delta.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("rendered transcript needs {required} bytes but only {capacity} fit after growing")]
    Overflow { required: usize, capacity: usize },
    #[error("rendered transcript ({rendered} bytes) is shorter than the committed baseline ({baseline} bytes)")]
    BaselineAhead { baseline: usize, rendered: usize },
    #[error("committed baseline {baseline} does not fall on a character boundary of the new rendering")]
    NotCharBoundary { baseline: usize },
}

/// Ordered transcript plus the committed render baseline.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    messages: Vec<Message>,
    baseline: usize,
}

impl ConversationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, role: Role, content: &str) {
        self.messages.push(Message::new(role, content));
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Rendered length committed by the last completed turn.
    #[must_use]
    pub fn baseline(&self) -> usize {
        self.baseline
    }

    /// Render the transcript and return the text added since the baseline.
    ///
    /// With `partial` set the assistant header is appended so the model
    /// continues with its reply, and the baseline stays put. Without it the
    /// rendering is the closed transcript and its length becomes the new
    /// baseline.
    pub fn render_delta<E>(
        &mut self,
        engine: &E,
        buffer: &mut RenderBuffer,
        partial: bool,
    ) -> Result<String, RenderError>
    where
        E: InferenceEngine + ?Sized,
    {
        let mut required = engine.render_template(&self.messages, partial, buffer)?;
        if required > buffer.capacity() {
            logging::debug(format!(
                "growing render buffer from {} to {} bytes",
                buffer.capacity(),
                required
            ));
            buffer.grow_to(required);
            required = engine.render_template(&self.messages, partial, buffer)?;
            if required > buffer.capacity() {
                return Err(RenderError::Overflow {
                    required,
                    capacity: buffer.capacity(),
                });
            }
        }

        let rendered = buffer.as_str();
        if rendered.len() < self.baseline {
            return Err(RenderError::BaselineAhead {
                baseline: self.baseline,
                rendered: rendered.len(),
            });
        }
        if !rendered.is_char_boundary(self.baseline) {
            return Err(RenderError::NotCharBoundary {
                baseline: self.baseline,
            });
        }

        let delta = rendered[self.baseline..].to_string();
        if !partial {
            self.baseline = rendered.len();
        }
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScriptedEngine;
    use crate::template::ChatTemplate;
    use pretty_assertions::assert_eq;

    fn engine() -> ScriptedEngine {
        ScriptedEngine::new(ChatTemplate::ChatMl, Vec::<String>::new())
    }

    fn full_render(store: &ConversationStore, add_assistant: bool) -> String {
        let mut buffer = RenderBuffer::with_capacity(1 << 16);
        ChatTemplate::ChatMl.render(store.messages(), add_assistant, &mut buffer);
        buffer.as_str().to_string()
    }

    #[test]
    fn first_delta_is_the_whole_rendering() {
        let engine = engine();
        let mut store = ConversationStore::new();
        let mut buffer = RenderBuffer::with_capacity(256);
        assert!(store.is_empty());
        store.append(Role::User, "hello");

        assert!(!store.is_empty());
        assert_eq!(store.baseline(), 0);
        let delta = store.render_delta(&engine, &mut buffer, true).expect("delta");
        assert_eq!(delta, full_render(&store, true));
        assert_eq!(delta, "<|im_start|>user\nhello<|im_end|>\n<|im_start|>assistant\n");
        assert_eq!(store.baseline(), 0);
    }

    #[test]
    fn deltas_concatenate_to_the_engine_context() {
        let engine = engine();
        let mut store = ConversationStore::new();
        let mut buffer = RenderBuffer::with_capacity(64);
        let mut sent = String::new();

        let turns = [("hi", "hello there"), ("run ls", "sure"), ("thanks", "ok ✓")];
        for (user, reply) in turns {
            store.append(Role::User, user);
            let prompt = store.render_delta(&engine, &mut buffer, true).expect("prompt");
            sent.push_str(&prompt);
            // The engine echoes the reply and the turn suffix into its context.
            sent.push_str(reply);
            sent.push_str(ChatTemplate::ChatMl.turn_suffix());

            store.append(Role::Assistant, reply);
            let closing = store.render_delta(&engine, &mut buffer, false).expect("commit");
            assert_eq!(store.baseline(), full_render(&store, false).len());
            assert!(full_render(&store, false).ends_with(&closing));
        }

        assert_eq!(sent, full_render(&store, false));
    }

    #[test]
    fn committed_delta_never_repeats_earlier_text() {
        let engine = engine();
        let mut store = ConversationStore::new();
        let mut buffer = RenderBuffer::with_capacity(16);

        store.append(Role::User, "first");
        let first = store.render_delta(&engine, &mut buffer, false).expect("first");
        store.append(Role::User, "second");
        let second = store.render_delta(&engine, &mut buffer, false).expect("second");

        assert!(!second.contains("first"));
        assert_eq!(format!("{first}{second}"), full_render(&store, false));
    }

    #[test]
    fn buffer_grows_once_and_never_shrinks() {
        let engine = engine();
        let mut store = ConversationStore::new();
        let mut buffer = RenderBuffer::with_capacity(8);
        store.append(Role::User, &"x".repeat(100));

        let delta = store.render_delta(&engine, &mut buffer, true).expect("delta");
        assert_eq!(delta, full_render(&store, true));
        let grown = buffer.capacity();
        assert_eq!(grown, delta.len());

        let mut small = ConversationStore::new();
        small.append(Role::User, "y");
        small.render_delta(&engine, &mut buffer, true).expect("small");
        assert_eq!(buffer.capacity(), grown);
    }

    #[test]
    fn unsettled_length_overflows_after_one_growth() {
        let engine = engine().with_render_drift(1);
        let mut store = ConversationStore::new();
        let mut buffer = RenderBuffer::with_capacity(8);
        store.append(Role::User, "hello");
        let rendered = full_render(&store, true).len();

        let err = store.render_delta(&engine, &mut buffer, true).expect_err("overflow");
        match err {
            RenderError::Overflow { required, capacity } => {
                assert_eq!(capacity, rendered + 1);
                assert_eq!(required, rendered + 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.render_count(), 2);
        assert_eq!(buffer.capacity(), rendered + 1);
        assert_eq!(store.baseline(), 0);
    }

    #[test]
    fn template_failure_is_reported() {
        let engine = engine().with_failing_template();
        let mut store = ConversationStore::new();
        let mut buffer = RenderBuffer::with_capacity(64);
        store.append(Role::User, "hello");

        let err = store.render_delta(&engine, &mut buffer, true).expect_err("fails");
        assert!(matches!(err, RenderError::Engine(EngineError::Template(_))));
    }

    #[test]
    fn baseline_past_rendering_is_fatal() {
        let engine = engine();
        let mut store = ConversationStore::new();
        let mut buffer = RenderBuffer::with_capacity(64);
        store.append(Role::User, "hello");
        store.render_delta(&engine, &mut buffer, false).expect("commit");

        let mut shorter = ConversationStore {
            messages: vec![Message::user("h")],
            baseline: store.baseline(),
        };
        let err = shorter
            .render_delta(&engine, &mut buffer, false)
            .expect_err("shorter");
        assert!(matches!(err, RenderError::BaselineAhead { .. }));
    }

    #[test]
    fn baseline_inside_a_character_is_fatal() {
        let engine = engine();
        let mut store = ConversationStore {
            messages: vec![Message::user("é")],
            // "<|im_start|>user\n" is 17 bytes; 18 lands inside 'é'.
            baseline: 18,
        };
        let mut buffer = RenderBuffer::with_capacity(64);
        let err = store.render_delta(&engine, &mut buffer, true).expect_err("boundary");
        assert!(matches!(err, RenderError::NotCharBoundary { baseline: 18 }));
    }
}
