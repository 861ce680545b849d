//! [`CloudApi`] on top of a raw transport and the token manager.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use kraftsync_core::{CommandAck, DeviceEvent, Error, Result, RetryPolicy, TelemetrySample};

use crate::api::{BatchOutcome, CloudApi, CloudTransport, CommandPage, DeviceUpsert};
use crate::token::TokenManager;

/// Authenticated cloud access.
///
/// Each call gets a valid token, retries transient failures with backoff and
/// on a 401-equivalent refreshes the token exactly once before retrying. A
/// second rejection is returned as `Error::Auth` and the token manager is
/// moved into the needs-reauth state.
pub struct AuthedCloud<T> {
    transport: Arc<T>,
    tokens: Arc<TokenManager>,
    retry: RetryPolicy,
}

impl<T: CloudTransport> AuthedCloud<T> {
    pub fn new(transport: Arc<T>, tokens: Arc<TokenManager>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            tokens,
            retry,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    async fn call<R, F, Fut>(&self, op: &str, f: F) -> Result<R>
    where
        F: Fn(String) -> Fut + Send + Sync,
        Fut: Future<Output = Result<R>> + Send,
        R: Send,
    {
        let token = self.tokens.get_valid_token().await?;
        match self.retry.run(op, || f(token.clone())).await {
            Err(Error::Auth(first)) => {
                warn!(op, error = %first, "Cloud rejected token, refreshing once");
                let fresh = self.tokens.refresh_after_rejection(&token).await?;
                match self.retry.run(op, || f(fresh.clone())).await {
                    Err(Error::Auth(second)) => {
                        self.tokens.mark_needs_reauth();
                        Err(Error::Auth(second))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }
}

#[async_trait]
impl<T: CloudTransport + 'static> CloudApi for AuthedCloud<T> {
    async fn upsert_device(&self, device: &DeviceUpsert) -> Result<()> {
        let transport = &self.transport;
        self.call("upsert_device", |token| async move {
            transport.upsert_device(&token, device).await
        })
        .await
    }

    async fn remove_device(&self, cloud_id: &str) -> Result<()> {
        let transport = &self.transport;
        self.call("remove_device", |token| async move {
            transport.remove_device(&token, cloud_id).await
        })
        .await
    }

    async fn push_telemetry(&self, samples: &[TelemetrySample]) -> Result<BatchOutcome> {
        let transport = &self.transport;
        self.call("push_telemetry", |token| async move {
            transport.push_telemetry(&token, samples).await
        })
        .await
    }

    async fn push_device_telemetry(&self, sample: &TelemetrySample) -> Result<()> {
        let transport = &self.transport;
        self.call("push_device_telemetry", |token| async move {
            transport.push_device_telemetry(&token, sample).await
        })
        .await
    }

    async fn fetch_commands(&self, since: Option<&str>) -> Result<CommandPage> {
        let transport = &self.transport;
        self.call("fetch_commands", |token| async move {
            transport.fetch_commands(&token, since).await
        })
        .await
    }

    async fn ack_command(&self, ack: &CommandAck) -> Result<()> {
        let transport = &self.transport;
        self.call("ack_command", |token| async move {
            transport.ack_command(&token, ack).await
        })
        .await
    }

    async fn report_event(&self, event: &DeviceEvent) -> Result<()> {
        let transport = &self.transport;
        self.call("report_event", |token| async move {
            transport.report_event(&token, event).await
        })
        .await
    }
}
