//! HTTP handler: outbound request with a deadline. 2xx is success; codes
//! listed in `retry_on_codes` and network-level errors mark the result
//! retryable.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::{HandlerFailure, HandlerOutput};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct HttpArgs {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_on_codes: Option<Vec<u16>>,
}

pub(super) async fn run(args: HttpArgs) -> Result<HandlerOutput, HandlerFailure> {
    if args.url.is_empty() {
        return Err(HandlerFailure::terminal("http: url required"));
    }
    let method_name = args.method.as_deref().unwrap_or("GET").to_uppercase();
    let method = reqwest::Method::from_bytes(method_name.as_bytes())
        .map_err(|_| HandlerFailure::terminal(format!("http: invalid method: {method_name}")))?;
    let timeout = args
        .timeout_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TIMEOUT);

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| HandlerFailure::terminal(format!("http: client build: {e}")))?;

    let mut request = client.request(method, &args.url);
    if let Some(headers) = &args.headers {
        for (name, value) in headers {
            request = request.header(name, value);
        }
    }
    if let Some(body) = &args.body {
        request = request.json(body);
    }

    let response = match request.send().await {
        Ok(response) => response,
        // Connection refused, DNS, timeout: all worth another attempt.
        Err(e) => return Err(HandlerFailure::retryable(format!("http: {e}"))),
    };

    let status = response.status();
    let body_text = response.text().await.unwrap_or_default();
    let retryable = args
        .retry_on_codes
        .as_deref()
        .unwrap_or(&[])
        .contains(&status.as_u16());

    if status.is_success() {
        return Ok(HandlerOutput {
            stdout: body_text,
            stderr: String::new(),
            retryable,
        });
    }

    Err(HandlerFailure {
        message: format!("http: status {}", status.as_u16()),
        retryable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn args_for(url: String) -> HttpArgs {
        HttpArgs {
            method: None,
            url,
            headers: None,
            body: None,
            timeout_ms: None,
            retry_on_codes: None,
        }
    }

    #[tokio::test]
    async fn two_hundred_is_success() {
        let base = spawn_server(Router::new().route("/", get(|| async { "pong" }))).await;
        let out = run(args_for(base)).await.unwrap();
        assert_eq!(out.stdout, "pong");
        assert!(!out.retryable);
    }

    #[tokio::test]
    async fn configured_code_marks_retryable() {
        let base = spawn_server(Router::new().route(
            "/",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        ))
        .await;

        let mut args = args_for(base);
        args.retry_on_codes = Some(vec![500]);
        let err = run(args).await.unwrap_err();
        assert!(err.retryable);
        assert!(err.message.contains("status 500"));
    }

    #[tokio::test]
    async fn unconfigured_failure_code_is_not_retryable() {
        let base = spawn_server(Router::new().route(
            "/",
            get(|| async { (StatusCode::NOT_FOUND, "nope") }),
        ))
        .await;

        let err = run(args_for(base)).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("status 404"));
    }

    #[tokio::test]
    async fn connection_errors_are_retryable() {
        // Nothing listens on this port.
        let err = run(args_for("http://127.0.0.1:1/".into())).await.unwrap_err();
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn missing_url_is_rejected() {
        let err = run(args_for(String::new())).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("url required"));
    }
}
