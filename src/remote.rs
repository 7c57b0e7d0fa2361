//! Remote Sink
//!
//! Adapter for the record store's upsert procedure. The record store does
//! its own per-day duplicate check and answers with a return code:
//!
//! ```text
//!  1  applied
//! -1  duplicate for the current day
//!  0  validation failed (tag not yet matched)
//! ```
//!
//! The HTTP gateway exposes the procedure as
//! `POST {base_url}/procedures/{procedure}` taking
//! `{"tagId", "stationId", "sourceAddress", "eventTime", "factoryCode"}` and
//! returning `{"returnValue": <code>}`.

use crate::config::{RemoteConfig, StationIdentity};
use crate::error::RemoteError;
use crate::models::{UpsertOutcome, UpsertRequest};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

/// Executes upserts against the record store
#[async_trait]
pub trait RemoteSink: Send + Sync {
    async fn upsert(&self, request: &UpsertRequest) -> UpsertOutcome;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcedureCall<'a> {
    #[serde(flatten)]
    request: &'a UpsertRequest,
    factory_code: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcedureResult {
    return_value: i32,
}

/// [`RemoteSink`] speaking JSON to the record store gateway.
///
/// The gateway caps concurrent sessions, so every call holds a permit from
/// `sessions` for its whole lifetime. The permit and the response are
/// dropped on every return path.
pub struct HttpRemoteSink {
    client: reqwest::Client,
    endpoint: String,
    factory_code: String,
    sessions: Semaphore,
}

impl HttpRemoteSink {
    pub fn new(config: &RemoteConfig, identity: &StationIdentity) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.request_timeout())
            .pool_max_idle_per_host(config.max_sessions.max(1))
            .build()
            .map_err(|e| RemoteError::Protocol(format!("failed to build HTTP client: {}", e)))?;

        let endpoint = format!(
            "{}/procedures/{}",
            config.base_url.trim_end_matches('/'),
            config.procedure
        );

        Ok(Self {
            client,
            endpoint,
            factory_code: identity.factory_code.clone(),
            sessions: Semaphore::new(config.max_sessions.max(1)),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call(&self, request: &UpsertRequest) -> Result<i32, RemoteError> {
        let _session = self
            .sessions
            .acquire()
            .await
            .map_err(|_| RemoteError::Transient("session pool closed".into()))?;

        let body = ProcedureCall {
            request,
            factory_code: &self.factory_code,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status, message));
        }

        let result: ProcedureResult = response
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        Ok(result.return_value)
    }
}

#[async_trait]
impl RemoteSink for HttpRemoteSink {
    async fn upsert(&self, request: &UpsertRequest) -> UpsertOutcome {
        match self.call(request).await {
            Ok(code) => {
                debug!(tag = %request.tag_id, code, "upsert returned");
                UpsertOutcome::from_return_code(code)
            }
            Err(e) => UpsertOutcome::Error(e),
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_connect() || err.is_timeout() {
        RemoteError::Connectivity(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status, err.to_string())
    } else {
        RemoteError::Transient(err.to_string())
    }
}

fn classify_status(status: StatusCode, message: String) -> RemoteError {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        RemoteError::Transient(format!("{}: {}", status, message))
    } else {
        RemoteError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}
