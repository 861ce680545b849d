//! [`HostPlatform`] backed by the Home Assistant REST API.

use std::collections::HashMap;

use async_trait::async_trait;
use kraftsync_core::{EntitySnapshot, HostAction, HostPlatform, LocalDevice, Result};
use tracing::{debug, warn};

use super::client::HassClient;
use super::entities::{HassConnectionConfig, HassServiceCall};
use super::grouping::{group_states, snapshot_any};

/// Home Assistant as the local device platform.
pub struct HassHost {
    client: HassClient,
}

impl HassHost {
    pub fn new(config: HassConnectionConfig) -> Result<Self> {
        Ok(Self {
            client: HassClient::new(config)?,
        })
    }

    pub fn client(&self) -> &HassClient {
        &self.client
    }
}

#[async_trait]
impl HostPlatform for HassHost {
    fn name(&self) -> &str {
        "home_assistant"
    }

    async fn discover(&self) -> Result<Vec<LocalDevice>> {
        let states = self.client.get_states().await?;
        let registry = match self.client.get_registry().await {
            Ok(registry) => registry,
            Err(e) => {
                warn!(error = %e, "Device registry unavailable, grouping per entity");
                HashMap::new()
            }
        };
        let devices = group_states(&states, &registry);
        debug!(
            entities = states.len(),
            devices = devices.len(),
            "Home Assistant discovery finished"
        );
        Ok(devices)
    }

    async fn read_entities(&self, entity_ids: &[String]) -> Result<Vec<EntitySnapshot>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        if entity_ids.len() == 1 {
            return match self.client.get_state(&entity_ids[0]).await {
                Ok(state) => Ok(vec![snapshot_any(&state)]),
                Err(super::client::HassClientError::EntityNotFound(_)) => Ok(Vec::new()),
                Err(e) => Err(e.into()),
            };
        }
        let states = self.client.get_states().await?;
        Ok(states
            .iter()
            .filter(|s| entity_ids.contains(&s.entity_id))
            .map(snapshot_any)
            .collect())
    }

    async fn invoke(&self, action: &HostAction) -> Result<()> {
        debug!(
            domain = %action.domain,
            service = %action.service,
            entity_id = %action.entity_id,
            "Calling Home Assistant service"
        );
        self.client.call_service(HassServiceCall::from(action)).await?;
        Ok(())
    }
}
