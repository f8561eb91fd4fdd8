//! Shared subprocess plumbing for the adapters.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::{AdapterError, AdapterResult};

/// Default bound on a single external command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    /// stdout with surrounding whitespace trimmed.
    pub fn stdout_trimmed(&self) -> String {
        self.stdout.trim().to_string()
    }

    /// stdout and stderr concatenated, for build-log excerpts.
    pub fn combined(&self) -> String {
        let mut s = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        s.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            if !s.is_empty() && !s.ends_with('\n') {
                s.push('\n');
            }
            s.push_str(&self.stderr);
        }
        s
    }
}

/// Run `program` with `args`, capturing output.
///
/// Non-zero exits become [`AdapterError::Command`] with the captured
/// stderr (falling back to stdout when stderr is empty); exceeding
/// `timeout` becomes [`AdapterError::Timeout`].
pub async fn run(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> AdapterResult<CmdOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    debug!(program, ?args, "running external command");

    let fut = cmd.output();
    let output = match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(|source| AdapterError::Spawn {
            program: program.to_string(),
            source,
        })?,
        Err(_) => {
            return Err(AdapterError::Timeout {
                program: program.to_string(),
                seconds: timeout.as_secs(),
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(AdapterError::Command {
            program: program.to_string(),
            code: output.status.code(),
            stderr: detail,
        });
    }

    Ok(CmdOutput { stdout, stderr })
}

/// The trailing `max` characters of `text`, on a char boundary.
pub fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}
