//! Reading multi-line user input blocks.

use std::io::{self, BufRead};

/// Ctrl+Z, the default end-of-block code point.
pub const CTRL_Z: u8 = 0x1A;

/// What ended an input block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEnd {
    Terminator,
    EndOfInput,
}

/// One block of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInput {
    pub text: String,
    pub end: InputEnd,
    /// Bytes beyond the size limit were dropped.
    pub truncated: bool,
}

impl UserInput {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Read until `terminator`, or end of input, keeping at most `max_bytes`.
///
/// Bytes past the limit are discarded up to the end of the block so they
/// cannot leak into the next read. A line ending typed right after the
/// terminator is swallowed when it is already buffered.
pub fn read_block<R: BufRead>(input: &mut R, terminator: u8, max_bytes: usize) -> io::Result<UserInput> {
    let mut bytes = Vec::new();
    let mut truncated = false;

    let end = loop {
        let buf = match input.fill_buf() {
            Ok(buf) => buf,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if buf.is_empty() {
            break InputEnd::EndOfInput;
        }

        let (chunk, consumed, done) = match buf.iter().position(|&b| b == terminator) {
            Some(pos) => {
                let rest = &buf[pos + 1..];
                let trailing = if rest.starts_with(b"\r\n") {
                    2
                } else if rest.starts_with(b"\n") {
                    1
                } else {
                    0
                };
                (&buf[..pos], pos + 1 + trailing, true)
            }
            None => (buf, buf.len(), false),
        };

        let room = max_bytes.saturating_sub(bytes.len());
        if chunk.len() > room {
            truncated = true;
        }
        bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
        input.consume(consumed);

        if done {
            break InputEnd::Terminator;
        }
    };

    if truncated {
        trim_partial_char(&mut bytes);
    }

    Ok(UserInput {
        text: String::from_utf8_lossy(&bytes).into_owned(),
        end,
        truncated,
    })
}

/// Drop a multibyte character cut in half by the size limit.
fn trim_partial_char(bytes: &mut Vec<u8>) {
    let valid = match std::str::from_utf8(bytes) {
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        _ => return,
    };
    bytes.truncate(valid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor, Read};

    #[test]
    fn reads_until_terminator_and_keeps_rest() {
        let mut input = Cursor::new(b"hello\nworld\n\x1a\r\nnext".to_vec());
        let block = read_block(&mut input, CTRL_Z, 1024).expect("read");
        assert_eq!(block.text, "hello\nworld\n");
        assert_eq!(block.end, InputEnd::Terminator);
        assert!(!block.truncated);

        let mut rest = String::new();
        input.read_to_string(&mut rest).expect("rest");
        assert_eq!(rest, "next");
    }

    #[test]
    fn end_of_input_ends_block() {
        let mut input = Cursor::new(b"list files\n".to_vec());
        let block = read_block(&mut input, CTRL_Z, 1024).expect("read");
        assert_eq!(block.text, "list files\n");
        assert_eq!(block.end, InputEnd::EndOfInput);

        let empty = read_block(&mut input, CTRL_Z, 1024).expect("read");
        assert!(empty.is_empty());
        assert_eq!(empty.end, InputEnd::EndOfInput);
    }

    #[test]
    fn immediate_terminator_is_empty() {
        let mut input = Cursor::new(vec![CTRL_Z]);
        let block = read_block(&mut input, CTRL_Z, 1024).expect("read");
        assert!(block.is_empty());
        assert_eq!(block.end, InputEnd::Terminator);
    }

    #[test]
    fn truncation_does_not_split_a_character() {
        let mut input = Cursor::new("ééé\u{1a}".as_bytes().to_vec());
        let block = read_block(&mut input, CTRL_Z, 3).expect("read");
        assert_eq!(block.text, "é");
        assert!(block.truncated);
        assert_eq!(block.end, InputEnd::Terminator);
    }

    #[test]
    fn oversized_block_is_truncated_and_drained() {
        let data = b"abcdefghij\x1asecond\x1a".to_vec();
        // Tiny buffer forces the terminator search across several fills.
        let mut input = BufReader::with_capacity(3, Cursor::new(data));
        let block = read_block(&mut input, CTRL_Z, 4).expect("read");
        assert_eq!(block.text, "abcd");
        assert!(block.truncated);

        let next = read_block(&mut input, CTRL_Z, 4).expect("read");
        assert_eq!(next.text, "seco");
        assert_eq!(next.end, InputEnd::Terminator);
    }
}
