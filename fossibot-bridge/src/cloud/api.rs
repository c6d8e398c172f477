//! Async signed POST core for the serverless endpoint.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use super::signing;
use super::API_ENDPOINT;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request failed with status code {0}")]
    Status(u16),
    #[error("response carries no data field: {0}")]
    Shape(String),
    #[error("request failed with transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ApiClient {
    pub fn new() -> Result<Self, RequestError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(ApiClient {
            http,
            endpoint: API_ENDPOINT.to_string(),
        })
    }

    /// Sends one signed call and returns the `data` field of the
    /// response. Anything other than HTTP 200 with a `data` field is an
    /// error; callers decide whether it purges cached tokens.
    pub async fn invoke(
        &self,
        method: &str,
        params: &str,
        token: Option<&str>,
    ) -> Result<Value, RequestError> {
        let signed = signing::envelope(method, params, token);

        log::debug!("Calling {method} on {}", self.endpoint);
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-serverless-sign", &signed.signature)
            .json(&signed.body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            log::debug!("Call {method} failed with status {status}");
            return Err(RequestError::Status(status.as_u16()));
        }

        let body: Value = response.json().await?;
        match body.get("data") {
            Some(data) if !data.is_null() => Ok(data.clone()),
            _ => {
                let summary = body.to_string();
                log::debug!("Call {method} returned no data: {summary}");
                Err(RequestError::Shape(truncate(summary, 200)))
            }
        }
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
        s.push_str("...");
    }
    s
}
