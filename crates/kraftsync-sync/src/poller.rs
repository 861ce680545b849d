//! Command poll loop body.
//!
//! Each poll fetches the pending queue, runs new commands through the
//! router and acknowledges the outcome. A bounded ledger of handled
//! command ids keeps redelivered commands from being dispatched twice;
//! their stored ack is simply sent again.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use kraftsync_cloud::DynCloud;
use kraftsync_core::{CommandAck, Result};

use crate::router::CommandRouter;

/// Handled command ids remembered for duplicate detection.
pub const LEDGER_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
struct LedgerEntry {
    ack: CommandAck,
    /// The cloud accepted the ack
    acked: bool,
}

#[derive(Debug, Default)]
struct PollState {
    cursor: Option<String>,
    ledger: HashMap<String, LedgerEntry>,
    order: VecDeque<String>,
}

impl PollState {
    fn remember(&mut self, ack: CommandAck) {
        let id = ack.command_id.clone();
        if self
            .ledger
            .insert(id.clone(), LedgerEntry { ack, acked: false })
            .is_none()
        {
            self.order.push_back(id);
        }
        while self.order.len() > LEDGER_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                if let Some(entry) = self.ledger.remove(&old) {
                    if !entry.acked {
                        warn!(command_id = %old, "Dropping unacknowledged command from ledger");
                    }
                }
            }
        }
    }
}

/// Outcome of one poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollReport {
    pub fetched: usize,
    pub executed: usize,
    pub failed: usize,
    /// Redelivered commands that were re-acknowledged without dispatch
    pub duplicates: usize,
    pub ack_failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandStats {
    pub polls: u64,
    pub executed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub ack_failures: u64,
}

pub struct CommandPoller {
    cloud: DynCloud,
    router: Arc<CommandRouter>,
    /// Held for a whole poll so overlapping polls never interleave.
    state: Mutex<PollState>,
    stats: parking_lot::Mutex<CommandStats>,
}

impl CommandPoller {
    pub fn new(cloud: DynCloud, router: Arc<CommandRouter>) -> Self {
        Self {
            cloud,
            router,
            state: Mutex::new(PollState::default()),
            stats: parking_lot::Mutex::new(CommandStats::default()),
        }
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    pub fn stats(&self) -> CommandStats {
        self.stats.lock().clone()
    }

    /// Whether a command id has been handled and is still remembered.
    pub async fn has_handled(&self, command_id: &str) -> bool {
        self.state.lock().await.ledger.contains_key(command_id)
    }

    async fn send_ack(&self, ack: &CommandAck) -> bool {
        match self.cloud.ack_command(ack).await {
            Ok(()) => true,
            Err(e) => {
                warn!(command_id = %ack.command_id, error = %e, "Failed to acknowledge command");
                false
            }
        }
    }

    /// One poll: retry outstanding acks, fetch, dispatch new commands, ack.
    ///
    /// Fails only when the fetch itself fails.
    pub async fn poll_once(&self) -> Result<PollReport> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut report = PollReport::default();

        let outstanding: Vec<CommandAck> = state
            .ledger
            .values()
            .filter(|e| !e.acked)
            .map(|e| e.ack.clone())
            .collect();
        for ack in outstanding {
            if self.send_ack(&ack).await {
                if let Some(entry) = state.ledger.get_mut(&ack.command_id) {
                    entry.acked = true;
                }
            } else {
                report.ack_failures += 1;
            }
        }

        let page = self.cloud.fetch_commands(state.cursor.as_deref()).await?;
        if let Some(cursor) = page.cursor {
            state.cursor = Some(cursor);
        }
        report.fetched = page.commands.len();

        for command in page.commands {
            if let Some(entry) = state.ledger.get(&command.command_id) {
                debug!(command_id = %command.command_id, "Command already handled, re-acknowledging");
                report.duplicates += 1;
                let ack = entry.ack.clone();
                if self.send_ack(&ack).await {
                    if let Some(entry) = state.ledger.get_mut(&command.command_id) {
                        entry.acked = true;
                    }
                } else {
                    report.ack_failures += 1;
                }
                continue;
            }

            let ack = self.router.execute(&command).await;
            if ack.is_success() {
                report.executed += 1;
            } else {
                report.failed += 1;
            }
            state.remember(ack.clone());
            if self.send_ack(&ack).await {
                if let Some(entry) = state.ledger.get_mut(&ack.command_id) {
                    entry.acked = true;
                }
            } else {
                report.ack_failures += 1;
            }
        }
        drop(guard);

        if report.fetched > 0 {
            info!(
                fetched = report.fetched,
                executed = report.executed,
                failed = report.failed,
                duplicates = report.duplicates,
                "Command poll completed"
            );
        }
        let mut stats = self.stats.lock();
        stats.polls += 1;
        stats.executed += report.executed as u64;
        stats.failed += report.failed as u64;
        stats.duplicates += report.duplicates as u64;
        stats.ack_failures += report.ack_failures as u64;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kraftsync_core::FailureReason;

    #[test]
    fn test_ledger_is_bounded() {
        let mut state = PollState::default();
        for n in 0..LEDGER_CAPACITY + 10 {
            state.remember(CommandAck::acknowledged(format!("cmd-{}", n)));
        }
        assert_eq!(state.ledger.len(), LEDGER_CAPACITY);
        assert!(!state.ledger.contains_key("cmd-0"));
        assert!(state.ledger.contains_key(&format!("cmd-{}", LEDGER_CAPACITY + 9)));
    }

    #[test]
    fn test_remember_twice_keeps_one_slot() {
        let mut state = PollState::default();
        state.remember(CommandAck::failed("cmd-1", FailureReason::Timeout, "slow"));
        state.remember(CommandAck::failed("cmd-1", FailureReason::Timeout, "slow"));
        assert_eq!(state.order.len(), 1);
    }
}
