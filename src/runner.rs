//! Command execution through the platform command interpreter.
//!
//! The command line is handed whole to the interpreter, so operators,
//! redirections and multiple statements are honored. The operator's approval
//! is the only safeguard.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

use thiserror::Error;

use crate::logging;
use crate::models::ExecutionOutcome;

/// Failures that happen before a command produced an outcome.
///
/// These never describe program output and must not be formatted as such.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to capture {0} of the child process")]
    Pipe(&'static str),
    #[error("failed to wait for the child process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Interpreter used to run command lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl ProcessRunner {
    /// `sh -c` on Unix, `cmd.exe /C` on Windows.
    #[must_use]
    pub fn platform_default() -> Self {
        #[cfg(windows)]
        {
            Self::with_shell("cmd.exe", vec!["/C".to_string()])
        }
        #[cfg(not(windows))]
        {
            Self::with_shell("sh", vec!["-c".to_string()])
        }
    }

    /// Use `program args... <command line>` instead of the platform default.
    pub fn with_shell(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run `command_line` to completion, draining stdout and stderr
    /// concurrently so a chatty child cannot stall on a full pipe.
    pub fn run(&self, command_line: &str) -> Result<ExecutionOutcome, RunnerError> {
        let mut cmd = self.build_command(command_line);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        logging::debug(format!("spawning {} for: {}", self.program, command_line.trim_end()));
        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RunnerError::Pipe("stdout"));
        };
        let Some(stderr) = child.stderr.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RunnerError::Pipe("stderr"));
        };

        let stdout_thread = spawn_drain(stdout);
        let stderr_thread = spawn_drain(stderr);

        let status = child.wait().map_err(RunnerError::Wait)?;
        let stdout = join_drain(stdout_thread, "stdout");
        let stderr = join_drain(stderr_thread, "stderr");

        let outcome = ExecutionOutcome {
            exit_code: exit_code(status),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        };
        logging::debug(format!(
            "command exited with {} ({} bytes stdout, {} bytes stderr)",
            outcome.exit_code,
            outcome.stdout.len(),
            outcome.stderr.len()
        ));
        Ok(outcome)
    }

    fn build_command(&self, command_line: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            // cmd.exe does its own parsing; pass the line through unescaped.
            if self.program.eq_ignore_ascii_case("cmd.exe") || self.program.eq_ignore_ascii_case("cmd") {
                cmd.raw_arg(format!("\"{command_line}\""));
                return cmd;
            }
        }

        cmd.arg(command_line);
        cmd
    }
}

fn spawn_drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<DrainResult> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let error = reader.read_to_end(&mut buf).err();
        DrainResult { bytes: buf, error }
    })
}

struct DrainResult {
    bytes: Vec<u8>,
    error: Option<std::io::Error>,
}

/// Collect a drained stream. Read failures keep the partial output and are
/// logged, since the command itself already ran.
fn join_drain(handle: JoinHandle<DrainResult>, stream: &str) -> Vec<u8> {
    match handle.join() {
        Ok(DrainResult { bytes, error: None }) => bytes,
        Ok(DrainResult {
            bytes,
            error: Some(err),
        }) => {
            logging::warn(format!(
                "reading {stream} failed after {} bytes, output is incomplete: {err}",
                bytes.len()
            ));
            bytes
        }
        Err(_) => {
            logging::warn(format!("{stream} reader thread panicked, output lost"));
            Vec::new()
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
