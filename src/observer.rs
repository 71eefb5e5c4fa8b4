//! Status observers: the only channel from the controller to a UI or log.

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use log::info;
use serde::Serialize;

use crate::state_machine::ServiceState;

/// Receives transitions from the controller. Called while the controller
/// holds its state lock: implementations must return quickly and must not
/// call back into the controller.
pub trait StatusObserver: Send + Sync {
    fn on_state_changed(&self, old: &ServiceState, new: &ServiceState);

    fn on_auto_start_changed(&self, _enabled: bool) {}
}

/// Writes transitions to the log.
#[derive(Debug, Clone)]
pub struct LogObserver {
    service: String,
}

impl LogObserver {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl StatusObserver for LogObserver {
    fn on_state_changed(&self, old: &ServiceState, new: &ServiceState) {
        info!("{} → {new} (was {old})", self.service);
    }

    fn on_auto_start_changed(&self, enabled: bool) {
        let word = if enabled { "enabled" } else { "disabled" };
        info!("{} auto-start {word}", self.service);
    }
}

/// Timestamped notification as carried over a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    StateChanged {
        old: ServiceState,
        new: ServiceState,
        ts: DateTime<Utc>,
    },
    AutoStartChanged {
        enabled: bool,
        ts: DateTime<Utc>,
    },
}

/// Forwards notifications to a crossbeam channel. Sends never block; a full
/// or disconnected channel drops the event.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: Sender<StatusEvent>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<StatusEvent>) -> Self {
        Self { tx }
    }
}

impl StatusObserver for ChannelObserver {
    fn on_state_changed(&self, old: &ServiceState, new: &ServiceState) {
        self.tx
            .try_send(StatusEvent::StateChanged {
                old: old.clone(),
                new: new.clone(),
                ts: Utc::now(),
            })
            .ok();
    }

    fn on_auto_start_changed(&self, enabled: bool) {
        self.tx
            .try_send(StatusEvent::AutoStartChanged {
                enabled,
                ts: Utc::now(),
            })
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::bounded;

    use super::*;

    #[test]
    fn channel_observer_forwards_events() {
        let (tx, rx) = bounded(4);
        let obs = ChannelObserver::new(tx);
        obs.on_state_changed(&ServiceState::Unknown, &ServiceState::Running);
        obs.on_auto_start_changed(true);

        match rx.try_recv().unwrap() {
            StatusEvent::StateChanged { old, new, .. } => {
                assert_eq!(old, ServiceState::Unknown);
                assert_eq!(new, ServiceState::Running);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            StatusEvent::AutoStartChanged { enabled: true, .. }
        ));
    }

    #[test]
    fn dropped_receiver_is_ignored() {
        let (tx, rx) = bounded(1);
        drop(rx);
        ChannelObserver::new(tx).on_state_changed(&ServiceState::Stopped, &ServiceState::Running);
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let json = serde_json::to_value(StatusEvent::StateChanged {
            old: ServiceState::Stopped,
            new: ServiceState::Starting,
            ts,
        })
        .unwrap();
        assert_eq!(json["event"], "state_changed");
        assert_eq!(json["new"]["state"], "starting");
    }
}
