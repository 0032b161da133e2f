//! HTTP identity factory
//!
//! Mints identities by POSTing `{"pool": <name>}` to a configured endpoint.
//! Response handling:
//! - 200 with `{"data": <payload>}` or a bare JSON payload → new identity
//! - 204, or a `null` payload → nothing created this time
//! - any other status → `CreateError` carrying the status for classification
//! - transport failures → `CreateError` without a status; the message names
//!   timeouts and refused connections so that pattern classification can
//!   retry them

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use identity_pool::{CreateError, CreateResult, IdentityFactory};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

/// Longest slice of an error body echoed into `CreateError` messages.
const MAX_ERROR_BODY: usize = 256;

pub struct HttpFactory {
    client: reqwest::Client,
    url: String,
    pool: String,
    token: Option<Secret<String>>,
    timeout: Duration,
}

impl HttpFactory {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        pool: impl Into<String>,
        token: Option<Secret<String>>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            pool: pool.into(),
            token,
            timeout,
        }
    }

    async fn request(&self) -> CreateResult {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "pool": self.pool }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose());
        }

        let response = request
            .send()
            .await
            .map_err(|e| CreateError::new(describe_transport_error(&e)))?;
        let status = response.status();
        debug!(pool = %self.pool, status = status.as_u16(), "factory responded");

        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(CreateError::with_status(
                status.as_u16(),
                format!("factory returned {status}: {}", detail.trim()),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CreateError::new(format!("invalid factory response: {e}")))?;
        Ok(extract_payload(body))
    }
}

impl IdentityFactory for HttpFactory {
    fn create(&self) -> Pin<Box<dyn Future<Output = CreateResult> + Send + '_>> {
        Box::pin(self.request())
    }
}

/// Unwrap a `{"data": ..}` envelope (an object whose only key is `data`);
/// anything else is the payload itself. `null` means no identity.
fn extract_payload(body: Value) -> Option<Value> {
    let payload = match body {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };
    (!payload.is_null()).then_some(payload)
}

fn describe_transport_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("factory request timed out: {e}")
    } else if e.is_connect() {
        format!("factory connection refused: {e}")
    } else {
        format!("factory request failed: {e}")
    }
}
