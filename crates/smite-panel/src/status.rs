//! Observable tunnel status.
//!
//! The tracker holds the externally visible state of every tunnel, enforces
//! the tunnel state machine and publishes each transition.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use smite_core::db::unix_timestamp;

use crate::backend::BackendStatus;
use crate::model::TunnelStatus;

/// Externally visible state of one tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelState {
    pub status: TunnelStatus,
    /// Why the tunnel is not (yet) active, if it isn't.
    pub reason: Option<String>,
    pub updated_at: i64,
}

/// A published status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub tunnel_id: String,
    pub from: Option<TunnelStatus>,
    pub to: TunnelStatus,
    pub reason: Option<String>,
}

/// Live health signal for a tunnel whose last operation was an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// State reported by the forwarding engine.
    Engine(BackendStatus),
    /// Node liveness and whether the last push was acknowledged.
    Agent { node_online: bool, acked: bool },
}

/// Status implied by a health signal.
pub const fn aggregate(signal: Signal) -> TunnelStatus {
    match signal {
        Signal::Engine(BackendStatus::Running)
        | Signal::Agent {
            node_online: true,
            acked: true,
        } => TunnelStatus::Active,
        Signal::Engine(BackendStatus::Errored)
        | Signal::Agent {
            node_online: true,
            acked: false,
        } => TunnelStatus::Error,
        Signal::Engine(BackendStatus::Stopped) => TunnelStatus::Stopped,
        Signal::Agent {
            node_online: false, ..
        } => TunnelStatus::Degraded,
    }
}

pub struct StatusTracker {
    states: Mutex<HashMap<String, TunnelState>>,
    events: broadcast::Sender<StatusChange>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            states: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    pub fn get(&self, tunnel_id: &str) -> Option<TunnelState> {
        self.lock().get(tunnel_id).cloned()
    }

    /// All tracked tunnels, sorted by id.
    pub fn snapshot(&self) -> Vec<(String, TunnelState)> {
        let mut all: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Move a tunnel to `status`. A tunnel seen for the first time may start
    /// in any state.
    ///
    /// Returns false, leaving the state untouched, when the state machine
    /// does not allow the move.
    pub fn set(&self, tunnel_id: &str, status: TunnelStatus, reason: Option<String>) -> bool {
        let change = {
            let mut states = self.lock();
            let from = states.get(tunnel_id).map(|s| s.status);
            if let Some(current) = from {
                if !current.can_transition_to(status) {
                    debug!(tunnel_id = %tunnel_id, from = %current, to = %status, "Status transition refused");
                    return false;
                }
            }
            let unchanged = states
                .get(tunnel_id)
                .is_some_and(|s| s.status == status && s.reason == reason);
            states.insert(
                tunnel_id.to_string(),
                TunnelState {
                    status,
                    reason: reason.clone(),
                    updated_at: unix_timestamp(),
                },
            );
            if unchanged {
                return true;
            }
            StatusChange {
                tunnel_id: tunnel_id.to_string(),
                from,
                to: status,
                reason,
            }
        };

        if change.from == Some(change.to) {
            debug!(tunnel_id = %tunnel_id, status = %change.to, reason = ?change.reason, "Status reason updated");
        } else {
            info!(tunnel_id = %tunnel_id, status = %change.to, reason = ?change.reason, "Tunnel status changed");
        }
        // No subscribers is fine.
        let _ = self.events.send(change);
        true
    }

    /// Install a state without checking the state machine. Used when
    /// restoring persisted state.
    pub fn seed(&self, tunnel_id: &str, status: TunnelStatus, reason: Option<String>) {
        self.lock().insert(
            tunnel_id.to_string(),
            TunnelState {
                status,
                reason,
                updated_at: unix_timestamp(),
            },
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TunnelState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_engine_states() {
        assert_eq!(aggregate(Signal::Engine(BackendStatus::Running)), TunnelStatus::Active);
        assert_eq!(aggregate(Signal::Engine(BackendStatus::Errored)), TunnelStatus::Error);
        assert_eq!(aggregate(Signal::Engine(BackendStatus::Stopped)), TunnelStatus::Stopped);
    }

    #[test]
    fn aggregate_agent_states() {
        let active = Signal::Agent {
            node_online: true,
            acked: true,
        };
        assert_eq!(aggregate(active), TunnelStatus::Active);
        for acked in [true, false] {
            let offline = Signal::Agent {
                node_online: false,
                acked,
            };
            assert_eq!(aggregate(offline), TunnelStatus::Degraded);
        }
        let unacked = Signal::Agent {
            node_online: true,
            acked: false,
        };
        assert_eq!(aggregate(unacked), TunnelStatus::Error);
    }

    #[test]
    fn first_status_may_be_anything() {
        let tracker = StatusTracker::new();
        assert!(tracker.set("t1", TunnelStatus::Error, Some("bad port".into())));
        let state = tracker.get("t1").unwrap();
        assert_eq!(state.status, TunnelStatus::Error);
        assert_eq!(state.reason.as_deref(), Some("bad port"));
    }

    #[test]
    fn illegal_transition_is_refused() {
        let tracker = StatusTracker::new();
        tracker.set("t1", TunnelStatus::Pending, None);
        tracker.set("t1", TunnelStatus::Stopped, None);

        assert!(!tracker.set("t1", TunnelStatus::Active, None));
        assert_eq!(tracker.get("t1").unwrap().status, TunnelStatus::Stopped);

        assert!(tracker.set("t1", TunnelStatus::Pending, None));
    }

    #[tokio::test]
    async fn transitions_are_published_once() {
        let tracker = StatusTracker::new();
        let mut rx = tracker.subscribe();

        tracker.set("t1", TunnelStatus::Pending, None);
        tracker.set("t1", TunnelStatus::Active, None);
        tracker.set("t1", TunnelStatus::Active, None);
        tracker.set("t1", TunnelStatus::Degraded, Some("node offline".into()));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.from, None);
        assert_eq!(first.to, TunnelStatus::Pending);
        assert_eq!(rx.recv().await.unwrap().to, TunnelStatus::Active);
        let third = rx.recv().await.unwrap();
        assert_eq!(third.from, Some(TunnelStatus::Active));
        assert_eq!(third.to, TunnelStatus::Degraded);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn seed_bypasses_state_machine() {
        let tracker = StatusTracker::new();
        tracker.set("t1", TunnelStatus::Stopped, None);
        tracker.seed("t1", TunnelStatus::Active, None);
        assert_eq!(tracker.get("t1").unwrap().status, TunnelStatus::Active);
        assert_eq!(tracker.snapshot().len(), 1);
    }
}
