//! Restart strategies for the replication listener
//!
//! The listener never terminates on errors; after every failed streaming
//! attempt a restart strategy decides how long to wait and whether the
//! replication slot should be (re)created first. The decision keys off the
//! SQLSTATE and routine the server reported.

use crate::core::config::ReplicationListenerSettings;
use crate::core::errors::MessagingError;
use std::time::Duration;
use tracing::{debug, error, trace};

/// SQLSTATE reported when another process holds the replication slot
const OBJECT_IN_USE: &str = "55006";
/// SQLSTATE reported when the replication slot does not exist
const UNDEFINED_OBJECT: &str = "42704";
/// Server routine that owns both of the above
const SLOT_ACQUIRE_ROUTINE: &str = "ReplicationSlotAcquire";

/// What the listener should do before the next streaming attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartDecision {
    pub delay: Duration,
    /// Create the replication slot before reconnecting
    pub create_slot: bool,
}

/// Decides how a failed streaming attempt is retried
pub trait ListenerRestartStrategy: Send + Sync {
    fn decide(
        &self,
        err: &MessagingError,
        settings: &ReplicationListenerSettings,
    ) -> RestartDecision;
}

fn slot_in_use(err: &MessagingError) -> bool {
    err.sqlstate() == Some(OBJECT_IN_USE) && err.routine() == Some(SLOT_ACQUIRE_ROUTINE)
}

fn slot_missing(err: &MessagingError) -> bool {
    err.sqlstate() == Some(UNDEFINED_OBJECT) && err.routine() == Some(SLOT_ACQUIRE_ROUTINE)
}

/// The default restart behavior
///
/// A held slot is routine when multiple instances compete for the stream, so
/// it only gets a trace line and the longer delay. Handling failures were
/// already logged by the dispatch pipeline and restart silently. Everything
/// else is logged as an error before the short delay.
#[derive(Debug, Default)]
pub struct StandardRestartStrategy;

impl ListenerRestartStrategy for StandardRestartStrategy {
    fn decide(
        &self,
        err: &MessagingError,
        settings: &ReplicationListenerSettings,
    ) -> RestartDecision {
        if slot_in_use(err) {
            trace!(
                "Replication slot {} is in use by another process, retrying later",
                settings.replication_slot
            );
            return RestartDecision {
                delay: settings.restart_delay_slot_in_use,
                create_slot: false,
            };
        }
        if slot_missing(err) {
            debug!(
                "Replication slot {} does not exist: {}",
                settings.replication_slot, err
            );
            return RestartDecision {
                delay: settings.restart_delay,
                create_slot: false,
            };
        }
        if err.is_handling() {
            return RestartDecision {
                delay: settings.restart_delay,
                create_slot: false,
            };
        }
        error!(code = %err.code(), "Replication listener error: {err}");
        RestartDecision {
            delay: settings.restart_delay,
            create_slot: false,
        }
    }
}

/// Like [`StandardRestartStrategy`], but creates a missing slot
///
/// Useful for environments where the listener owns its slot instead of the
/// migration tooling.
#[derive(Debug, Default)]
pub struct SlotCreatingRestartStrategy {
    inner: StandardRestartStrategy,
}

impl ListenerRestartStrategy for SlotCreatingRestartStrategy {
    fn decide(
        &self,
        err: &MessagingError,
        settings: &ReplicationListenerSettings,
    ) -> RestartDecision {
        let mut decision = self.inner.decide(err, settings);
        if slot_missing(err) {
            decision.create_slot = true;
        }
        decision
    }
}
