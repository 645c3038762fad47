//! Terminal agent that chats with a local language model and runs the shell
//! commands it proposes, each one only after the operator approves it.

pub mod agent;
pub mod config;
pub mod confirm;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod extract;
pub mod format;
pub mod input;
pub mod logging;
pub mod models;
pub mod prompts;
pub mod runner;
pub mod template;
pub mod utils;

pub use agent::{Agent, AgentSettings, AgentState, SessionSummary, StepOutcome};
pub use config::Config;
pub use error::AgentError;
