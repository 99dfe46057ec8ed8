//! Updater events surfaced to host-side consumers.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::store::BundleInfo;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted while an update cycle progresses.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum UpdaterEvent {
    /// The server announced a newer version.
    UpdateAvailable { version: String },
    /// Incremental download progress, 0-100.
    Download { percent: u8 },
    /// A bundle finished downloading and verifying.
    DownloadComplete { bundle: BundleInfo },
    /// A download failed after cleanup.
    DownloadFailed { version: String },
    /// A promoted bundle failed to confirm and was rolled back.
    UpdateFailed { bundle: BundleInfo },
    /// The device already runs the latest version.
    NoNeedUpdate { bundle: BundleInfo },
    /// The host confirmed the promoted bundle is alive.
    AppReady { bundle: BundleInfo },
    /// The main view was instructed to load a new bundle path.
    AppReloaded,
    /// The available update is flagged breaking; auto-download is skipped.
    BreakingAvailable { version: String },
    /// Compatibility alias emitted alongside `BreakingAvailable`.
    MajorAvailable { version: String },
}

/// Broadcast fan-out for [`UpdaterEvent`]s.
///
/// Emission never blocks and never fails; events sent while no receiver is
/// subscribed are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UpdaterEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdaterEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: UpdaterEvent) {
        debug!(event = ?event, "Emitting updater event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BundleInfo, BundleStatus};

    #[tokio::test]
    async fn test_subscribe_receives_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(UpdaterEvent::UpdateAvailable {
            version: "1.2.3".to_string(),
        });

        match rx.recv().await.unwrap() {
            UpdaterEvent::UpdateAvailable { version } => assert_eq!(version, "1.2.3"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(UpdaterEvent::AppReloaded);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = UpdaterEvent::AppReady {
            bundle: BundleInfo::new("b-1", "1.0.0", "abc", BundleStatus::Success),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "appReady");
        assert_eq!(json["data"]["bundle"]["version"], "1.0.0");
    }
}
