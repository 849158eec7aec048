//! Server-to-client notification fan-out.
//!
//! Subscribers register per method name and get their own broadcast
//! receiver: delivery is ordered per subscriber and never blocks the
//! reader. A subscriber that falls more than a channel's depth behind
//! loses the oldest items and sees that as a lag error on its receiver.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use tokio::sync::broadcast;
use tracing::debug;

use tether_protocol::message::JsonRpcNotification;

/// Per-subscriber buffer depth before drop-oldest kicks in.
pub const SUBSCRIBER_CHANNEL_DEPTH: usize = 100;

#[derive(Default)]
pub struct NotificationDispatcher {
    channels: StdMutex<HashMap<String, broadcast::Sender<JsonRpcNotification>>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one notification method, e.g.
    /// `notifications/resources/updated`.
    pub fn subscribe(&self, method: &str) -> broadcast::Receiver<JsonRpcNotification> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(method.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_CHANNEL_DEPTH).0)
            .subscribe()
    }

    /// Best-effort delivery; methods nobody subscribed to are dropped.
    pub(crate) fn dispatch(&self, notification: JsonRpcNotification) {
        let sender = {
            let channels = self
                .channels
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            channels.get(&notification.method).cloned()
        };
        match sender {
            Some(sender) => {
                if sender.send(notification).is_err() {
                    debug!("all subscribers gone, dropping notification");
                }
            }
            None => {
                debug!(method = %notification.method, "no subscriber for notification, dropping");
            }
        }
    }
}
