//! REST client for the cloud platform.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, trace};

use kraftsync_core::{CloudCommand, CommandAck, Credential, DeviceEvent, Result, TelemetrySample};

use crate::api::{BatchOutcome, CloudTransport, CommandPage, DeviceUpsert, TokenRefresher};
use crate::error::CloudError;

const USER_AGENT: &str = concat!("kraftsync/", env!("CARGO_PKG_VERSION"));

/// Cloud REST client. Every request carries its own timeout.
#[derive(Clone)]
pub struct CloudClient {
    base_url: String,
    site_id: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandsBody {
    List(Vec<CloudCommand>),
    Page(CommandPage),
}

impl CloudClient {
    pub fn new(base_url: &str, site_id: &str, timeout: Duration) -> std::result::Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CloudError::Setup(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            site_id: site_id.to_string(),
            http,
        })
    }

    pub fn from_config(config: &kraftsync_core::BridgeConfig) -> Result<Self> {
        Ok(Self::new(
            &config.cloud.api_url,
            &config.cloud.site_id,
            config.request_timeout(),
        )?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authed(&self, request: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        request.bearer_auth(token).header("X-Site-Id", &self.site_id)
    }

    /// Turn a non-success status into an error carrying the body.
    async fn check(response: reqwest::Response) -> std::result::Result<reqwest::Response, CloudError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CloudError::Status {
            status: status.as_u16(),
            body: truncate(&body, 200),
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// `POST /telemetry` takes the bare sample array.
fn batch_body(samples: &[TelemetrySample]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(samples)?)
}

fn is_unsupported(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
    )
}

#[async_trait]
impl CloudTransport for CloudClient {
    async fn upsert_device(&self, token: &str, device: &DeviceUpsert) -> Result<()> {
        debug!(cloud_id = %device.cloud_id, role = %device.role, "Upserting cloud device");
        let response = self
            .authed(self.http.post(self.url("/devices")), token)
            .json(device)
            .send()
            .await
            .map_err(CloudError::from)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn remove_device(&self, token: &str, cloud_id: &str) -> Result<()> {
        let response = self
            .authed(self.http.delete(self.url(&format!("/devices/{}", cloud_id))), token)
            .send()
            .await
            .map_err(CloudError::from)?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(cloud_id, "Cloud device already removed");
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn push_telemetry(&self, token: &str, samples: &[TelemetrySample]) -> Result<BatchOutcome> {
        let response = self
            .authed(self.http.post(self.url("/telemetry")), token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(batch_body(samples)?)
            .send()
            .await
            .map_err(CloudError::from)?;
        if is_unsupported(response.status()) {
            return Err(CloudError::NotSupported("POST /telemetry".into()).into());
        }
        let response = Self::check(response).await?;
        let text = response.text().await.map_err(CloudError::from)?;
        if text.trim().is_empty() {
            return Ok(BatchOutcome::all_accepted(samples));
        }
        let outcome: BatchOutcome = serde_json::from_str(&text)?;
        trace!(items = outcome.results.len(), "Telemetry batch answered");
        Ok(outcome)
    }

    async fn push_device_telemetry(&self, token: &str, sample: &TelemetrySample) -> Result<()> {
        let url = self.url(&format!("/devices/{}/telemetry", sample.cloud_id));
        let response = self
            .authed(self.http.post(url), token)
            .json(sample)
            .send()
            .await
            .map_err(CloudError::from)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn fetch_commands(&self, token: &str, since: Option<&str>) -> Result<CommandPage> {
        let mut request = self.authed(self.http.get(self.url("/commands")), token);
        if let Some(cursor) = since {
            request = request.query(&[("since", cursor)]);
        }
        let response = request.send().await.map_err(CloudError::from)?;
        let response = Self::check(response).await?;
        let body: CommandsBody = response.json().await.map_err(CloudError::from)?;
        Ok(match body {
            CommandsBody::Page(page) => page,
            CommandsBody::List(commands) => CommandPage {
                commands,
                cursor: None,
            },
        })
    }

    async fn ack_command(&self, token: &str, ack: &CommandAck) -> Result<()> {
        let url = self.url(&format!("/commands/{}/ack", ack.command_id));
        let response = self
            .authed(self.http.post(url), token)
            .json(ack)
            .send()
            .await
            .map_err(CloudError::from)?;
        // already cleared on the server
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::CONFLICT) {
            debug!(command_id = %ack.command_id, "Command already acknowledged");
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn report_event(&self, token: &str, event: &DeviceEvent) -> Result<()> {
        let response = self
            .authed(self.http.post(self.url("/events")), token)
            .json(event)
            .send()
            .await
            .map_err(CloudError::from)?;
        if is_unsupported(response.status()) {
            return Err(CloudError::NotSupported("POST /events".into()).into());
        }
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl TokenRefresher for CloudClient {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential> {
        let response = self
            .http
            .post(self.url("/oauth/token"))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(CloudError::from)?;
        // invalid_grant comes back as 400
        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(kraftsync_core::Error::Auth(format!(
                "refresh rejected: {}",
                truncate(&body, 200)
            )));
        }
        let response = Self::check(response).await?;
        let token: TokenResponse = response.json().await.map_err(CloudError::from)?;
        Ok(Credential {
            access_token: token.access_token,
            refresh_token: token
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
            expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in),
        })
    }
}
