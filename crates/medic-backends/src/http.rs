//! Shared request plumbing for the REST adapters

use medic_core::PortError;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Longest response body kept in a `Rejected` error
const MAX_ERROR_BODY: usize = 512;

/// Build a client with a per-request timeout
pub(crate) fn client(timeout: Duration) -> Result<reqwest::Client, PortError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PortError::Transport(format!("cannot build HTTP client: {e}")))
}

pub(crate) fn transport(err: reqwest::Error) -> PortError {
    if err.is_timeout() {
        PortError::Transport(format!("request timed out: {err}"))
    } else {
        PortError::Transport(err.to_string())
    }
}

/// Send and fail on non-2xx, returning the raw response
pub(crate) async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, PortError> {
    let response = request.send().await.map_err(transport)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PortError::Rejected {
        status: status.as_u16(),
        body: truncate(&body, MAX_ERROR_BODY),
    })
}

/// Send and decode a JSON body
pub(crate) async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, PortError> {
    send(request)
        .await?
        .json::<T>()
        .await
        .map_err(|e| PortError::Malformed(e.to_string()))
}

pub(crate) fn require_secret(value: &str, name: &'static str) -> Result<(), PortError> {
    if value.trim().is_empty() {
        Err(PortError::MissingCredential(name))
    } else {
        Ok(())
    }
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
