//! Synchronous YES/NO confirmation prompt.
//!
//! Only the exact words `YES` and `NO` (any case) are accepted. Everything
//! else re-prompts, including answers that are merely prefixed by a valid
//! word.

use std::io::{self, BufRead, Read, Write};

use thiserror::Error;

/// Longest answer line kept, in bytes. Longer lines are discarded whole.
pub const GATE_CAPACITY: usize = 8;
/// Consecutive end-of-input reads tolerated before giving up.
pub const MAX_CLOSED_READS: usize = 3;

const INVALID_INPUT: &str = "Invalid input. Please enter YES or NO.";

#[derive(Debug, Error)]
pub enum ConfirmError {
    #[error("input closed while waiting for confirmation")]
    InputClosed,
    #[error("failed to read confirmation: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line(String),
    Overlong,
    Closed,
}

/// Ask `prompt` until the operator answers YES or NO.
pub fn ask<R, W>(input: &mut R, output: &mut W, prompt: &str) -> Result<bool, ConfirmError>
where
    R: BufRead,
    W: Write,
{
    let mut closed_reads = 0;
    loop {
        write!(output, "{prompt} [YES/NO]: ")?;
        output.flush()?;

        let answer = match read_bounded_line(input, GATE_CAPACITY)? {
            LineRead::Line(line) => {
                closed_reads = 0;
                line.to_ascii_uppercase()
            }
            LineRead::Overlong => {
                closed_reads = 0;
                writeln!(output, "{INVALID_INPUT}")?;
                continue;
            }
            LineRead::Closed => {
                closed_reads += 1;
                writeln!(output)?;
                writeln!(output, "{INVALID_INPUT}")?;
                if closed_reads >= MAX_CLOSED_READS {
                    return Err(ConfirmError::InputClosed);
                }
                continue;
            }
        };

        let decision = match answer.as_str() {
            "YES" => true,
            "NO" => false,
            _ => {
                writeln!(output, "{INVALID_INPUT}")?;
                continue;
            }
        };

        writeln!(output, "Received: {answer}")?;
        writeln!(output)?;
        return Ok(decision);
    }
}

fn read_bounded_line<R: BufRead>(input: &mut R, capacity: usize) -> io::Result<LineRead> {
    let mut line = Vec::with_capacity(capacity + 1);
    let limit = u64::try_from(capacity + 1).unwrap_or(u64::MAX);
    let read = input.by_ref().take(limit).read_until(b'\n', &mut line)?;
    if read == 0 {
        return Ok(LineRead::Closed);
    }

    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    } else if line.len() > capacity {
        input.skip_until(b'\n')?;
        return Ok(LineRead::Overlong);
    }

    Ok(LineRead::Line(String::from_utf8_lossy(&line).into_owned()))
}
