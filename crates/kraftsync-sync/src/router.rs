//! Command router
//!
//! Moves a cloud command through
//! `Received -> Resolving -> Dispatched -> {Acknowledged, Failed}`.
//!
//! Resolution only ever considers a mapping entry's control entities, so a
//! write command can never land on a read-only sensor. Dispatch to any one
//! entity is serialized.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use kraftsync_core::{
    Capability, ChildEntity, CloudCommand, CommandAck, CommandKind, DeviceRole, DynHost, Error,
    FailureReason, HostAction, MappingEntry,
};

use crate::mapper::MappingSnapshot;

/// Lifecycle of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Received,
    Resolving,
    Dispatched,
    Acknowledged,
    Failed,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Acknowledged | CommandState::Failed)
    }
}

/// A command resolved to one local action.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub entry: MappingEntry,
    pub entity: ChildEntity,
    pub action: HostAction,
}

/// Why resolution failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Unresolved {
    pub reason: FailureReason,
    pub message: String,
}

impl Unresolved {
    fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Capabilities of control entities that can carry a command, best first.
fn preferred_capabilities(kind: &CommandKind) -> &'static [Capability] {
    match kind {
        CommandKind::TurnOn | CommandKind::TurnOff => &[Capability::OnOff, Capability::Mode],
        CommandKind::StartCharge | CommandKind::StopCharge => &[Capability::OnOff],
        CommandKind::SetTemperature | CommandKind::SetMode => &[Capability::Mode],
        CommandKind::SetChargeLimit => &[Capability::ChargeLimit],
        CommandKind::Other(_) => &[],
    }
}

fn target_temperature(command: &CloudCommand) -> Result<f64, Unresolved> {
    command
        .param_f64("target_temperature_c")
        .or_else(|| command.param_f64("temperature"))
        .filter(|t| t.is_finite() && (0.0..=100.0).contains(t))
        .ok_or_else(|| {
            Unresolved::new(
                FailureReason::InvalidParameters,
                "set_temperature needs target_temperature_c between 0 and 100",
            )
        })
}

fn requested_mode(command: &CloudCommand) -> Result<String, Unresolved> {
    command
        .param_str("mode")
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Unresolved::new(FailureReason::InvalidParameters, "set_mode needs a mode"))
}

fn charge_current(command: &CloudCommand) -> Result<f64, Unresolved> {
    command
        .param_f64("current_a")
        .or_else(|| command.param_f64("current"))
        .or_else(|| command.param_f64("value"))
        .filter(|a| a.is_finite() && *a > 0.0)
        .ok_or_else(|| {
            Unresolved::new(
                FailureReason::InvalidParameters,
                "set_charge_limit needs a positive current_a",
            )
        })
}

/// Host action carrying `command` on `entity`, or `None` when the entity's
/// domain has no service for it.
pub fn action_for(command: &CloudCommand, entity: &ChildEntity) -> Result<Option<HostAction>, Unresolved> {
    let domain = entity.domain();
    let id = entity.entity_id.as_str();
    let action = |service: &str| HostAction::new(domain, service, id);

    let switchable = matches!(
        domain,
        "switch" | "input_boolean" | "light" | "water_heater" | "climate"
    );
    Ok(match &command.command_kind {
        CommandKind::TurnOn | CommandKind::StartCharge if switchable => Some(action("turn_on")),
        CommandKind::TurnOff | CommandKind::StopCharge if switchable => Some(action("turn_off")),
        CommandKind::SetTemperature if matches!(domain, "water_heater" | "climate") => {
            Some(action("set_temperature").with_param("temperature", target_temperature(command)?))
        }
        CommandKind::SetMode => match domain {
            "water_heater" => Some(action("set_operation_mode").with_param("operation_mode", requested_mode(command)?)),
            "climate" => Some(action("set_hvac_mode").with_param("hvac_mode", requested_mode(command)?)),
            "select" | "input_select" => Some(action("select_option").with_param("option", requested_mode(command)?)),
            _ => None,
        },
        CommandKind::SetChargeLimit if matches!(domain, "number" | "input_number") => {
            Some(action("set_value").with_param("value", charge_current(command)?))
        }
        _ => None,
    })
}

/// Resolve a command against a mapping snapshot.
pub fn resolve(snapshot: &MappingSnapshot, command: &CloudCommand) -> Result<Resolution, Unresolved> {
    let entry = snapshot.by_cloud_id(&command.target_cloud_id).ok_or_else(|| {
        Unresolved::new(
            FailureReason::UnmappedTarget,
            format!("no mapping for device {}", command.target_cloud_id),
        )
    })?;

    let kind = &command.command_kind;
    if let CommandKind::Other(other) = kind {
        return Err(Unresolved::new(
            FailureReason::UnsupportedCommand,
            format!("unknown command '{}'", other),
        ));
    }
    let charging = matches!(
        kind,
        CommandKind::StartCharge | CommandKind::StopCharge | CommandKind::SetChargeLimit
    );
    if charging && entry.role != DeviceRole::EvCharger {
        return Err(Unresolved::new(
            FailureReason::UnsupportedCommand,
            format!("{} is not valid for a {}", kind.as_str(), entry.role),
        ));
    }

    let candidates: Vec<&ChildEntity> = preferred_capabilities(kind)
        .iter()
        .flat_map(|cap| entry.controls().filter(move |c| c.capability == *cap))
        .collect();
    if candidates.is_empty() {
        return Err(Unresolved::new(
            FailureReason::NoControlEntity,
            format!("{} has no control entity for {}", entry.local_id, kind.as_str()),
        ));
    }

    for entity in candidates {
        if let Some(action) = action_for(command, entity)? {
            return Ok(Resolution {
                entry: entry.clone(),
                entity: entity.clone(),
                action,
            });
        }
    }
    Err(Unresolved::new(
        FailureReason::UnsupportedCommand,
        format!("no control of {} accepts {}", entry.local_id, kind.as_str()),
    ))
}

fn failure_reason(error: &Error) -> FailureReason {
    match error {
        Error::EntityUnavailable(_) => FailureReason::EntityUnavailable,
        Error::Validation(_) => FailureReason::InvalidParameters,
        Error::Unsupported(_) => FailureReason::UnsupportedCommand,
        Error::Timeout(_) => FailureReason::Timeout,
        _ => FailureReason::DispatchFailed,
    }
}

pub struct CommandRouter {
    host: DynHost,
    mappings: watch::Receiver<Arc<MappingSnapshot>>,
    entity_locks: DashMap<String, Arc<Mutex<()>>>,
    dispatch_timeout: Duration,
}

impl CommandRouter {
    pub fn new(
        host: DynHost,
        mappings: watch::Receiver<Arc<MappingSnapshot>>,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            host,
            mappings,
            entity_locks: DashMap::new(),
            dispatch_timeout,
        }
    }

    fn entity_lock(&self, entity_id: &str) -> Arc<Mutex<()>> {
        self.entity_locks
            .entry(entity_id.to_string())
            .or_default()
            .clone()
    }

    /// Resolve and dispatch one command, returning its terminal ack.
    pub async fn execute(&self, command: &CloudCommand) -> CommandAck {
        let command_id = command.command_id.as_str();
        debug!(
            command_id,
            kind = command.command_kind.as_str(),
            state = ?CommandState::Received,
            "Command received"
        );

        debug!(command_id, state = ?CommandState::Resolving, "Resolving command target");
        let snapshot = self.mappings.borrow().clone();
        let resolution = match resolve(&snapshot, command) {
            Ok(resolution) => resolution,
            Err(unresolved) => {
                let error = match unresolved.reason {
                    FailureReason::UnmappedTarget => Error::UnmappedTarget(command.target_cloud_id.clone()),
                    _ => Error::UnresolvableCommand {
                        command_id: command.command_id.clone(),
                        reason: unresolved.message.clone(),
                    },
                };
                warn!(command_id, state = ?CommandState::Failed, error = %error, "Command not dispatched");
                return CommandAck::failed(command_id, unresolved.reason, unresolved.message);
            }
        };

        let action = &resolution.action;
        let lock = self.entity_lock(&action.entity_id);
        let _serialized = lock.lock().await;
        debug!(
            command_id,
            state = ?CommandState::Dispatched,
            entity_id = %action.entity_id,
            service = %format!("{}.{}", action.domain, action.service),
            "Dispatching command"
        );

        let dispatch = async {
            self.ensure_available(&action.entity_id).await?;
            self.host.invoke(action).await
        };
        let outcome = match tokio::time::timeout(self.dispatch_timeout, dispatch).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.dispatch_timeout.as_millis() as u64)),
        };
        match outcome {
            Ok(()) => {
                info!(
                    command_id,
                    local_id = %resolution.entry.local_id,
                    entity_id = %action.entity_id,
                    state = ?CommandState::Acknowledged,
                    "Command executed"
                );
                let ack = CommandAck::acknowledged(command_id);
                match self.device_state(&action.entity_id).await {
                    Some(state) => ack.with_device_state(state),
                    None => ack,
                }
            }
            Err(e) => {
                let reason = failure_reason(&e);
                warn!(
                    command_id,
                    entity_id = %action.entity_id,
                    state = ?CommandState::Failed,
                    reason = reason.as_str(),
                    error = %e,
                    "Command failed"
                );
                CommandAck::failed(command_id, reason, e.to_string())
            }
        }
    }

    /// Hosts may accept service calls for entities that cannot act on them,
    /// so availability is checked before dispatch.
    async fn ensure_available(&self, entity_id: &str) -> kraftsync_core::Result<()> {
        let snapshots = self.host.read_entities(&[entity_id.to_string()]).await?;
        match snapshots.iter().find(|s| s.entity_id == entity_id) {
            Some(snapshot) if snapshot.is_available() => Ok(()),
            _ => Err(Error::EntityUnavailable(entity_id.to_string())),
        }
    }

    /// Post-command state of the dispatched entity.
    async fn device_state(&self, entity_id: &str) -> Option<Value> {
        let snapshots = self.host.read_entities(&[entity_id.to_string()]).await.ok()?;
        let snapshot = snapshots.into_iter().next()?;
        Some(json!({
            "entity_id": snapshot.entity_id,
            "state": snapshot.state,
            "attributes": snapshot.attributes,
        }))
    }
}
