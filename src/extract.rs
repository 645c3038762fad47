//! Fenced command extraction from model replies.
//!
//! A command block opens with three backticks followed by an optional, loosely
//! matched `exec` tag (any in-order subset of its letters, followed by
//! whitespace) and ends at the next three backticks. Matching is not nesting aware: a literal fence inside
//! the intended command ends the block early, and an unrelated language tag
//! such as `bash` stays part of the command text.

use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;

/// A command block found in a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// Text strictly between the opening marker and the closing fence.
    pub command: String,
    /// Byte span of the whole block, fences included.
    pub span: Range<usize>,
}

impl Extraction {
    /// Offset to resume scanning from.
    #[must_use]
    pub fn end(&self) -> usize {
        self.span.end
    }
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Tag letters count only when whitespace follows them, so an untagged
        // block keeps the leading letters of its command.
        Regex::new(r"(?s)```(?:[ \t]*e?x?e?c?\s)?\s*(.*?)```").expect("fence regex should compile")
    })
}

/// Find the first command block at or after `start_offset`.
///
/// Returns `None` when no further block exists, which is the normal end of a
/// scan rather than an error.
#[must_use]
pub fn extract(text: &str, start_offset: usize) -> Option<Extraction> {
    if start_offset > text.len() || !text.is_char_boundary(start_offset) {
        return None;
    }
    let caps = fence_regex().captures_at(text, start_offset)?;
    let whole = caps.get(0)?;
    let command = caps.get(1).map_or("", |m| m.as_str());
    Some(Extraction {
        command: command.to_string(),
        span: whole.range(),
    })
}

/// Iterate every command block in `text`, left to right.
#[must_use]
pub fn extract_all(text: &str) -> Extractions<'_> {
    Extractions { text, offset: 0 }
}

/// Iterator returned by [`extract_all`].
#[derive(Debug, Clone)]
pub struct Extractions<'a> {
    text: &'a str,
    offset: usize,
}

impl Iterator for Extractions<'_> {
    type Item = Extraction;

    fn next(&mut self) -> Option<Self::Item> {
        let found = extract(self.text, self.offset)?;
        self.offset = found.end();
        Some(found)
    }
}
