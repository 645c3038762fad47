//! System prompt that opens every session.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{Config, DEFAULT_SYSTEM_PROMPT_PATH};
use crate::logging;

// Compiled in so the binary works outside a checkout.
pub const SYSTEM_PROMPT: &str = include_str!("prompts/system.md");

/// Where the session's system prompt came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource {
    File(PathBuf),
    BuiltIn,
}

impl fmt::Display for PromptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptSource::File(path) => write!(f, "{}", path.display()),
            PromptSource::BuiltIn => f.write_str("built-in"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemPrompt {
    pub text: String,
    pub source: PromptSource,
}

/// Load the system prompt named by `config`.
///
/// An explicitly configured path must be readable. Otherwise
/// `prompts/system.md` in the working directory is used when present, and
/// the built-in prompt when not.
pub fn load_system_prompt(config: &Config) -> Result<SystemPrompt> {
    load_from(
        config.system_prompt_path().as_deref(),
        Path::new(DEFAULT_SYSTEM_PROMPT_PATH),
    )
}

fn load_from(explicit: Option<&Path>, fallback: &Path) -> Result<SystemPrompt> {
    if let Some(path) = explicit {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read system prompt at {}", path.display()))?;
        return Ok(SystemPrompt {
            text,
            source: PromptSource::File(path.to_path_buf()),
        });
    }

    match std::fs::read_to_string(fallback) {
        Ok(text) => Ok(SystemPrompt {
            text,
            source: PromptSource::File(fallback.to_path_buf()),
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            logging::debug(format!(
                "{} not found, using the built-in system prompt",
                fallback.display()
            ));
            Ok(SystemPrompt {
                text: SYSTEM_PROMPT.to_string(),
                source: PromptSource::BuiltIn,
            })
        }
        Err(err) => Err(err).with_context(|| format!("Failed to read {}", fallback.display())),
    }
}
