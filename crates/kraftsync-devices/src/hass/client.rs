//! Home Assistant REST API client.

use super::entities::{HassConnectionConfig, HassEntityState, HassRegistryEntry, HassServiceCall};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur when interacting with Home Assistant.
#[derive(Debug, Error)]
pub enum HassClientError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Service call failed: {0}")]
    ServiceCallFailed(String),

    #[error("Invalid response from Home Assistant: {0}")]
    InvalidResponse(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Result type for HASS client operations.
pub type HassResult<T> = Result<T, HassClientError>;

impl From<HassClientError> for kraftsync_core::Error {
    fn from(e: HassClientError) -> Self {
        use kraftsync_core::Error;
        match e {
            HassClientError::HttpError(err) if err.is_timeout() || err.is_connect() => {
                Error::NetworkTransient(format!("home assistant: {}", err))
            }
            HassClientError::HttpError(err) if err.is_decode() => {
                Error::Serialization(err.to_string())
            }
            HassClientError::HttpError(err) => Error::Host(err.to_string()),
            HassClientError::AuthenticationFailed => {
                Error::Host("home assistant rejected the access token".into())
            }
            HassClientError::EntityNotFound(id) => Error::EntityUnavailable(id),
            HassClientError::ConnectionError(s) => Error::NetworkTransient(s),
            other => Error::Host(other.to_string()),
        }
    }
}

/// Renders `{entity_id: registry entry}` for every entity that belongs to a device.
const REGISTRY_TEMPLATE: &str = r#"{% set ns = namespace(out={}) %}{% for s in states %}{% set d = device_id(s.entity_id) %}{% if d %}{% set ids = device_attr(d, 'identifiers') | list %}{% set ns.out = dict(ns.out, **{s.entity_id: {'device_id': d, 'name': device_attr(d, 'name_by_user') or device_attr(d, 'name'), 'integration': (ids[0][0] if ids else none), 'manufacturer': device_attr(d, 'manufacturer'), 'model': device_attr(d, 'model')}}) %}{% endif %}{% endfor %}{{ ns.out | tojson }}"#;

/// Home Assistant REST API client.
pub struct HassClient {
    config: HassConnectionConfig,
    http_client: reqwest::Client,
}

impl HassClient {
    /// Create a new Home Assistant client.
    pub fn new(config: HassConnectionConfig) -> HassResult<Self> {
        let builder =
            reqwest::Client::builder().timeout(std::time::Duration::from_secs(config.timeout));

        let http_client = if !config.verify_ssl {
            builder
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| HassClientError::ConnectionError(e.to_string()))?
        } else {
            builder
                .build()
                .map_err(|e| HassClientError::ConnectionError(e.to_string()))?
        };

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Get the base API URL.
    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.api_base(),
            path.trim_start_matches('/')
        )
    }

    /// Add authorization headers to a request.
    fn add_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header("Authorization", self.config.auth_header())
    }

    /// Get all entity states.
    pub async fn get_states(&self) -> HassResult<Vec<HassEntityState>> {
        let response = self
            .add_auth(self.http_client.get(self.api_url("/states")))
            .send()
            .await?;

        if !response.status().is_success() {
            if response.status() == reqwest::StatusCode::UNAUTHORIZED {
                return Err(HassClientError::AuthenticationFailed);
            }
            return Err(HassClientError::InvalidResponse(format!(
                "Status: {}",
                response.status()
            )));
        }

        let states: Vec<HassEntityState> = response.json().await?;
        Ok(states)
    }

    /// Get state for a specific entity.
    pub async fn get_state(&self, entity_id: &str) -> HassResult<HassEntityState> {
        let url = self.api_url(&format!("/states/{}", entity_id));
        let response = self.add_auth(self.http_client.get(&url)).send().await?;

        match response.status() {
            reqwest::StatusCode::OK => {
                let state: HassEntityState = response.json().await?;
                Ok(state)
            }
            reqwest::StatusCode::NOT_FOUND => {
                Err(HassClientError::EntityNotFound(entity_id.to_string()))
            }
            reqwest::StatusCode::UNAUTHORIZED => Err(HassClientError::AuthenticationFailed),
            _ => Err(HassClientError::InvalidResponse(format!(
                "Status: {}",
                response.status()
            ))),
        }
    }

    /// Call a service. Returns the states changed by the call.
    pub async fn call_service(&self, call: HassServiceCall) -> HassResult<JsonValue> {
        let url = self.api_url(&format!("/services/{}/{}", call.domain, call.service));

        let response = self
            .add_auth(self.http_client.post(&url))
            .json(&call.service_data)
            .send()
            .await?;

        match response.status() {
            reqwest::StatusCode::OK => Ok(response.json().await.unwrap_or(JsonValue::Null)),
            reqwest::StatusCode::UNAUTHORIZED => Err(HassClientError::AuthenticationFailed),
            reqwest::StatusCode::BAD_REQUEST | reqwest::StatusCode::NOT_FOUND => {
                let body = response.text().await.unwrap_or_default();
                Err(HassClientError::ServiceCallFailed(format!(
                    "{}.{} rejected: {}",
                    call.domain, call.service, body
                )))
            }
            status => Err(HassClientError::ServiceCallFailed(format!(
                "Status: {}",
                status
            ))),
        }
    }

    /// Render a template on the server.
    pub async fn render_template(&self, template: &str) -> HassResult<String> {
        let response = self
            .add_auth(self.http_client.post(self.api_url("/template")))
            .json(&serde_json::json!({ "template": template }))
            .send()
            .await?;

        match response.status() {
            reqwest::StatusCode::OK => Ok(response.text().await?),
            reqwest::StatusCode::UNAUTHORIZED => Err(HassClientError::AuthenticationFailed),
            status => Err(HassClientError::InvalidResponse(format!(
                "Template status: {}",
                status
            ))),
        }
    }

    /// Device registry information keyed by entity id.
    pub async fn get_registry(&self) -> HassResult<HashMap<String, HassRegistryEntry>> {
        let rendered = self.render_template(REGISTRY_TEMPLATE).await?;
        serde_json::from_str(&rendered)
            .map_err(|e| HassClientError::InvalidResponse(format!("registry template: {}", e)))
    }

    /// Get the connection config.
    pub fn config(&self) -> &HassConnectionConfig {
        &self.config
    }
}
