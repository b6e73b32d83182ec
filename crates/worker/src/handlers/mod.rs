//! Executable handlers.
//!
//! The payload's `handler` field selects from a closed set; both variants
//! share one outcome shape so the runner's routing logic stays uniform.

mod http;
mod shell;

pub use http::HttpArgs;
pub use shell::ShellArgs;

use serde_json::Value;

/// Output of a handler invocation that ran to completion successfully.
#[derive(Debug, Default)]
pub struct HandlerOutput {
    pub stdout: String,
    pub stderr: String,
    /// Set by the http handler for configured status codes and network
    /// errors. Currently informational: routing retries all failures alike.
    pub retryable: bool,
}

/// A failed invocation, carrying the error text that lands on the run row
/// and in retry/DLQ payloads.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerFailure {
    pub message: String,
    pub retryable: bool,
}

impl HandlerFailure {
    pub(crate) fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub(crate) fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// The closed handler set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Shell,
    Http,
}

impl Handler {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "shell" => Some(Handler::Shell),
            "http" => Some(Handler::Http),
            _ => None,
        }
    }

    /// Decode `args` for this handler and execute it.
    pub async fn run(&self, args: &Value) -> Result<HandlerOutput, HandlerFailure> {
        match self {
            Handler::Shell => {
                let args: ShellArgs = serde_json::from_value(args.clone())
                    .map_err(|e| HandlerFailure::terminal(format!("shell: bad args: {e}")))?;
                shell::run(args).await
            }
            Handler::Http => {
                let args: HttpArgs = serde_json::from_value(args.clone())
                    .map_err(|e| HandlerFailure::terminal(format!("http: bad args: {e}")))?;
                http::run(args).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_closed_set() {
        assert_eq!(Handler::parse("shell"), Some(Handler::Shell));
        assert_eq!(Handler::parse("http"), Some(Handler::Http));
        assert_eq!(Handler::parse("grpc"), None);
        assert_eq!(Handler::parse(""), None);
    }

    #[tokio::test]
    async fn malformed_args_fail_terminally() {
        let err = Handler::Shell
            .run(&serde_json::json!({"command": 42}))
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("bad args"));
    }
}
