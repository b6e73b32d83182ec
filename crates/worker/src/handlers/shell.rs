//! Shell handler: `/bin/sh -c <command>` with a deadline.

use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use super::{HandlerFailure, HandlerOutput};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct ShellArgs {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
}

pub(super) async fn run(args: ShellArgs) -> Result<HandlerOutput, HandlerFailure> {
    if args.command.is_empty() {
        return Err(HandlerFailure::terminal("shell: command required"));
    }
    let timeout = args
        .timeout_sec
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT);

    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(&args.command)
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(HandlerFailure::terminal(format!("shell: spawn failed: {e}")));
        }
        Err(_) => {
            return Err(HandlerFailure::terminal(format!(
                "shell: timeout after {}s",
                timeout.as_secs()
            )));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        let detail = if stderr.is_empty() { &stdout } else { &stderr };
        return Err(HandlerFailure::terminal(format!(
            "shell: {}: output={:?}",
            output.status,
            detail.trim_end()
        )));
    }

    Ok(HandlerOutput {
        stdout,
        stderr,
        retryable: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let out = run(ShellArgs {
            command: "echo hello".into(),
            timeout_sec: None,
        })
        .await
        .unwrap();
        assert_eq!(out.stdout.trim_end(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure() {
        let err = run(ShellArgs {
            command: "echo oops >&2; exit 3".into(),
            timeout_sec: None,
        })
        .await
        .unwrap_err();
        assert!(err.message.contains("oops"), "got: {}", err.message);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn deadline_exceeded_is_tagged_timeout() {
        let err = run(ShellArgs {
            command: "sleep 5".into(),
            timeout_sec: Some(1),
        })
        .await
        .unwrap_err();
        assert!(err.message.contains("timeout"), "got: {}", err.message);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let err = run(ShellArgs {
            command: String::new(),
            timeout_sec: None,
        })
        .await
        .unwrap_err();
        assert!(err.message.contains("command required"));
    }
}
