//! Spawning of external tools
//!
//! Every system mutation hostprep performs goes through [`run`]: arguments are
//! passed as a vector (no shell), stdout/stderr are captured, and a non-zero
//! exit becomes [`Error::Command`] carrying the tool's exit code so `main`
//! can propagate it.

use crate::core::error::{Error, Result};
use std::process::Stdio;
use tracing::{debug, error};

/// Captured result of a finished tool invocation
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
}

/// Runs `program` with `args` and extra environment `envs`, waiting for it to
/// finish. A non-zero exit is returned as `Ok` with `success == false`.
///
/// # Errors
///
/// Returns `Error::Command` if the process cannot be spawned.
pub async fn output<S: AsRef<str>>(
    program: &str,
    args: &[S],
    envs: &[(&str, &str)],
) -> Result<CommandOutput> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    debug!("exec: {} {}", program, args.join(" "));

    let output = tokio::process::Command::new(program)
        .args(&args)
        .envs(envs.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| {
            error!("Failed to spawn {program}: {e}");
            Error::Command {
                program: program.to_string(),
                message: format!("failed to start: {e}"),
                stderr: Some(e.to_string()),
                exit_code: None,
            }
        })?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code(),
        success: output.status.success(),
    })
}

/// Like [`output`], but a non-zero exit is an error.
///
/// # Errors
///
/// Returns `Error::Command` if the process cannot be spawned or exits
/// unsuccessfully.
pub async fn run<S: AsRef<str>>(
    program: &str,
    args: &[S],
    envs: &[(&str, &str)],
) -> Result<CommandOutput> {
    let out = output(program, args, envs).await?;
    if out.success {
        Ok(out)
    } else {
        Err(failure(program, &out))
    }
}

/// Builds the error for a tool that ran but failed.
pub fn failure(program: &str, out: &CommandOutput) -> Error {
    let stderr = out.stderr.trim().to_string();
    let message = first_error_line(&stderr).map_or_else(
        || match out.exit_code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        },
        str::to_string,
    );
    error!("{program} failed: {message}");
    Error::Command {
        program: program.to_string(),
        message,
        stderr: (!stderr.is_empty()).then_some(stderr),
        exit_code: out.exit_code,
    }
}

/// Picks the most useful line of a tool's stderr.
///
/// apt and pip print warnings before the actual error, so lines that look
/// like errors win over the first line.
fn first_error_line(stderr: &str) -> Option<&str> {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    lines
        .iter()
        .rev()
        .find(|l| {
            let lower = l.to_lowercase();
            l.starts_with("E: ") || lower.starts_with("error") || lower.contains("error:")
        })
        .or_else(|| lines.last())
        .copied()
}
