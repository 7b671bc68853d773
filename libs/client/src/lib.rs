//! Polling HTTP client for the vend resource broker.
//!
//! The broker returns a resource immediately, but the resource usually is
//! not serving yet. [`PoolClient::request_resource`] hides the polling
//! contract:
//!
//! - after a request, poll `GetResource` every 5 s until the state is
//!   `serving`;
//! - a 404 on the poll means the resource went away: restart the request;
//! - transient failures (including the broker's 429 lock-busy reply) retry
//!   with a 1 s backoff until cancelled.
//!
//! The timestamps of the first request and of the first serving observation
//! are stamped into the client's heartbeat meta as `requestAt`/`servedAt`,
//! which the broker's syncer turns into wait metrics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vend_core::{meta_keys, Client, Resource, ResourceState};

/// Poll cadence while waiting for a resource to start serving.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Backoff between retries of a failed endpoint call.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Errors from the polling client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The broker answered 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller's cancellation token fired. Carries the replies collected
    /// from failed attempts, newest last.
    #[error("cancelled{}", render_attempts(.0))]
    Cancelled(Vec<String>),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("unexpected reply payload: {0}")]
    Payload(#[from] serde_json::Error),
}

fn render_attempts(attempts: &[String]) -> String {
    if attempts.is_empty() {
        String::new()
    } else {
        format!(" after: {}", attempts.join(" | "))
    }
}

/// A broker client bound to one client identity.
pub struct PoolClient {
    base_url: String,
    http: reqwest::Client,
    info: Client,
    poll_interval: Duration,
    retry_backoff: Duration,
    request_at: Option<DateTime<Utc>>,
    served_at: Option<DateTime<Utc>>,
}

impl PoolClient {
    pub fn new(base_url: impl Into<String>, info: Client) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            info,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            request_at: None,
            served_at: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    /// Request membership in `pool_id` and block until the backing resource
    /// is serving (or `cancel` fires).
    pub async fn request_resource(
        &mut self,
        pool_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Resource, ClientError> {
        self.request_at = Some(Utc::now());
        loop {
            let body = self
                .post_retry("/RequestResource", pool_id, "", cancel)
                .await?;
            let mut resource: Resource = serde_json::from_slice(&body)?;

            loop {
                if resource.state == ResourceState::Serving {
                    self.served_at = Some(Utc::now());
                    return Ok(resource);
                }
                self.sleep(self.poll_interval, cancel).await?;

                match self
                    .post_retry("/GetResource", &resource.pool_id, &resource.id, cancel)
                    .await
                {
                    Ok(body) => resource = serde_json::from_slice(&body)?,
                    // The resource went away underneath us; start over.
                    Err(ClientError::NotFound(reply)) => {
                        debug!(pool_id, reply, "resource disappeared, re-requesting");
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }

    /// Sustain the claim on a resource.
    pub async fn heartbeat(
        &mut self,
        resource: &Resource,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        if let Some(request_at) = self.request_at {
            self.info
                .meta
                .insert(meta_keys::REQUEST_AT.into(), serde_json::json!(request_at));
        }
        if let Some(served_at) = self.served_at {
            self.info
                .meta
                .insert(meta_keys::SERVED_AT.into(), serde_json::json!(served_at));
        }
        self.post_retry("/Heartbeat", &resource.pool_id, &resource.id, cancel)
            .await?;
        Ok(())
    }

    async fn post_retry(
        &self,
        endpoint: &str,
        pool_id: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ClientError> {
        let url = format!("{}{endpoint}", self.base_url);
        let client_json = serde_json::to_string(&self.info)?;
        let mut attempts: Vec<String> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled(attempts));
            }

            let sent = self
                .http
                .post(&url)
                .form(&[("poolID", pool_id), ("id", id), ("client", &client_json)])
                .send()
                .await?;
            let status = sent.status();
            let body = sent.bytes().await?.to_vec();

            if status.is_success() {
                return Ok(body);
            }
            let reply = String::from_utf8_lossy(&body).into_owned();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(ClientError::NotFound(reply));
            }

            debug!(endpoint, %status, reply, "retrying");
            if !reply.is_empty() {
                attempts.push(reply);
            }
            if let Err(mut cancelled) = self.sleep(self.retry_backoff, cancel).await {
                if let ClientError::Cancelled(list) = &mut cancelled {
                    list.extend(attempts);
                }
                return Err(cancelled);
            }
        }
    }

    async fn sleep(&self, wait: Duration, cancel: &CancellationToken) -> Result<(), ClientError> {
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = cancel.cancelled() => Err(ClientError::Cancelled(Vec::new())),
        }
    }
}
