//! Rendering an executed command and its outcome as one text block.
//!
//! The block is shown to the operator and, when they agree, handed back to
//! the model as part of the next user message.

use crate::models::ExecutionOutcome;
use crate::utils::char_boundary_at_or_before;

/// Default cap per captured stream, in bytes.
pub const DEFAULT_MAX_STREAM_BYTES: usize = 10 * 1024;

/// Format `command` and `outcome`. Streams longer than `max_stream_bytes`
/// are cut with a visible note rather than silently.
#[must_use]
pub fn format_result(command: &str, outcome: &ExecutionOutcome, max_stream_bytes: usize) -> String {
    let stderr = truncate_with_note(&outcome.stderr, max_stream_bytes);
    let stdout = truncate_with_note(&outcome.stdout, max_stream_bytes);
    format!(
        "I executed the command:\n\
         ```\n{command}\n```\n\n\
         The result was:\n\
         exit code: `{code}`\n\
         stderr:\n\
         ```\n{stderr}\n```\n\n\
         stdout:\n\
         ```\n{stdout}\n```\n",
        code = outcome.exit_code,
    )
}

fn truncate_with_note(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let end = char_boundary_at_or_before(text, max_bytes);
    let omitted = text.len() - end;
    format!("{}\n[... {omitted} bytes omitted ...]", &text[..end])
}
