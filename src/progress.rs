//! Status and progress notifications.
//!
//! The orchestrator publishes [`Notification`]s on a tokio broadcast channel.
//! Delivery is at-most-once and never blocks the pipeline: with no
//! subscriber the send result is simply discarded, and a subscriber that
//! falls behind loses the oldest events (it sees `RecvError::Lagged`).
//!
//! # Example
//!
//! ```rust
//! use pagestitch::progress::{Notification, Notifier};
//!
//! let notifier = Notifier::new(16);
//! let mut rx = notifier.subscribe();
//! notifier.progress(3, 0);
//! assert_eq!(rx.try_recv().unwrap(), Notification::Progress { current: 3, total: 0 });
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::PageError;

/// One event on the status channel.
///
/// Serialises with a `type` tag so it can be written straight onto the
/// host-mode protocol stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    /// Free-form human-readable status line.
    #[serde(rename = "statusUpdate")]
    Status { status: String },

    /// A page was stored. `total` is 0 until the end of the document is known.
    #[serde(rename = "progressUpdate")]
    Progress { current: u32, total: u32 },

    /// A single page failed; the run carries on.
    #[serde(rename = "pageFailed")]
    PageFailed { error: PageError },

    /// Navigation reported the last page; the run is idle and can be merged.
    #[serde(rename = "completed")]
    Completed { pages: u32 },

    /// The capture loop gave up. The run stays active until stopped.
    #[serde(rename = "failed")]
    Failed { error: String },

    /// The run was stopped and its pages cleared.
    #[serde(rename = "stopped")]
    Stopped,

    /// A merged document delivered in-band, codec-encoded.
    ///
    /// Written by the host session from a [`crate::adapter::MessageSink`];
    /// never published on the broadcast channel.
    #[serde(rename = "download", rename_all = "camelCase")]
    Download { file_name: String, data: String },
}

/// Non-blocking publisher for [`Notification`]s.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// A receiver for every notification published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publish without waiting. Having no listener is not an error.
    pub fn publish(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }

    pub fn status(&self, status: impl Into<String>) {
        self.publish(Notification::Status {
            status: status.into(),
        });
    }

    pub fn progress(&self, current: u32, total: u32) {
        self.publish(Notification::Progress { current, total });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let notifier = Notifier::new(4);
        notifier.status("nobody listening");
        notifier.progress(1, 0);
    }

    #[test]
    fn subscriber_receives_in_order() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();
        notifier.status("started");
        notifier.progress(1, 0);
        notifier.publish(Notification::Stopped);

        assert_eq!(
            rx.try_recv().unwrap(),
            Notification::Status {
                status: "started".into()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Notification::Progress {
                current: 1,
                total: 0
            }
        );
        assert_eq!(rx.try_recv().unwrap(), Notification::Stopped);
    }

    #[test]
    fn slow_subscriber_lags_instead_of_blocking() {
        let notifier = Notifier::new(2);
        let mut rx = notifier.subscribe();
        for i in 1..=5 {
            notifier.progress(i, 0);
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }

    #[test]
    fn wire_shape_matches_protocol() {
        let json = serde_json::to_value(Notification::Progress {
            current: 2,
            total: 5,
        })
        .unwrap();
        assert_eq!(json["type"], "progressUpdate");
        assert_eq!(json["current"], 2);

        let json = serde_json::to_value(Notification::Download {
            file_name: "a.pdf".into(),
            data: "QQ==".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "download");
        assert_eq!(json["fileName"], "a.pdf");
    }
}
