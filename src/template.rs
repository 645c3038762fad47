//! Built-in chat templates and the reusable rendering buffer.
//!
//! Rendering follows the fixed-capacity contract of native template
//! renderers: the output is written into a [`RenderBuffer`] up to its
//! capacity and the full required length is always reported, so callers can
//! grow the buffer and render again when the result did not fit.

use std::fmt;
use std::str::FromStr;

use crate::models::{Message, Role};
use crate::utils::char_boundary_at_or_before;

pub const DEFAULT_TEMPLATE: ChatTemplate = ChatTemplate::Llama3;
pub const KNOWN_TEMPLATES: &[&str] = &["llama3", "chatml", "gemma"];

// === RenderBuffer ===

/// Growable text buffer with explicit capacity tracking.
///
/// Capacity only ever grows. The contents are overwritten by every render.
#[derive(Debug, Clone)]
pub struct RenderBuffer {
    text: String,
    capacity: usize,
}

impl RenderBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            text: String::with_capacity(capacity),
            capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Raise capacity to at least `required` bytes. Never shrinks.
    pub fn grow_to(&mut self, required: usize) {
        if required <= self.capacity {
            return;
        }
        self.text.reserve(required.saturating_sub(self.text.len()));
        self.capacity = required;
    }

    /// Replace the contents with as much of `rendered` as fits and return the
    /// length the full rendering needs.
    pub fn fill(&mut self, rendered: &str) -> usize {
        self.text.clear();
        let end = char_boundary_at_or_before(rendered, self.capacity);
        self.text.push_str(&rendered[..end]);
        rendered.len()
    }
}

// === ChatTemplate ===

/// Chat formats understood by the built-in renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    Llama3,
    ChatMl,
    Gemma,
}

impl ChatTemplate {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ChatTemplate::Llama3 => "llama3",
            ChatTemplate::ChatMl => "chatml",
            ChatTemplate::Gemma => "gemma",
        }
    }

    /// Text the template places after a completed assistant turn.
    ///
    /// Generation stops on the end-of-turn token without emitting it, so an
    /// engine that mirrors the rendered transcript appends this itself.
    #[must_use]
    pub fn turn_suffix(self) -> &'static str {
        match self {
            ChatTemplate::Llama3 => "<|eot_id|>",
            ChatTemplate::ChatMl => "<|im_end|>\n",
            ChatTemplate::Gemma => "<end_of_turn>\n",
        }
    }

    /// Render `messages` into `out`, returning the required length.
    ///
    /// `add_assistant` appends the assistant header so the model continues
    /// with its reply.
    pub fn render(self, messages: &[Message], add_assistant: bool, out: &mut RenderBuffer) -> usize {
        let rendered = self.render_to_string(messages, add_assistant);
        out.fill(&rendered)
    }

    fn render_to_string(self, messages: &[Message], add_assistant: bool) -> String {
        let mut text = String::new();
        match self {
            ChatTemplate::Llama3 => {
                for message in messages {
                    text.push_str("<|start_header_id|>");
                    text.push_str(message.role.as_str());
                    text.push_str("<|end_header_id|>\n\n");
                    text.push_str(message.content.trim());
                    text.push_str("<|eot_id|>");
                }
                if add_assistant {
                    text.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
                }
            }
            ChatTemplate::ChatMl => {
                for message in messages {
                    text.push_str("<|im_start|>");
                    text.push_str(message.role.as_str());
                    text.push('\n');
                    text.push_str(&message.content);
                    text.push_str("<|im_end|>\n");
                }
                if add_assistant {
                    text.push_str("<|im_start|>assistant\n");
                }
            }
            ChatTemplate::Gemma => {
                for message in messages {
                    let role = match message.role {
                        Role::User => "user",
                        Role::Assistant => "model",
                    };
                    text.push_str("<start_of_turn>");
                    text.push_str(role);
                    text.push('\n');
                    text.push_str(message.content.trim());
                    text.push_str("<end_of_turn>\n");
                }
                if add_assistant {
                    text.push_str("<start_of_turn>model\n");
                }
            }
        }
        text
    }
}

impl fmt::Display for ChatTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChatTemplate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "llama3" | "llama-3" | "llama3.1" => Ok(ChatTemplate::Llama3),
            "chatml" | "smollm" => Ok(ChatTemplate::ChatMl),
            "gemma" | "gemma2" | "gemma3" => Ok(ChatTemplate::Gemma),
            other => Err(format!(
                "unknown chat template '{other}': expected one of {}",
                KNOWN_TEMPLATES.join(", ")
            )),
        }
    }
}
