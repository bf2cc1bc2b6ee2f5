//! Per-user delivery channel tracking.
//!
//! Maintains an in-memory map of connected users to the sender half of
//! their push channel. A missed delivery is an observation, not an error:
//! fan-out loops count misses and move on.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use palaver_shared::protocol::PushEvent;
use palaver_shared::types::UserId;

/// Tracks one active delivery channel per online user.
#[derive(Default)]
pub struct DeliveryRegistry {
    channels: Mutex<HashMap<UserId, mpsc::UnboundedSender<PushEvent>>>,
}

impl DeliveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user` as online and return the receiving half of their
    /// channel. A second `connect` for the same user replaces the previous
    /// channel, which closes the old receiver.
    pub fn connect(&self, user: &UserId) -> mpsc::UnboundedReceiver<PushEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let Ok(mut channels) = self.channels.lock() else {
            return rx;
        };
        if channels.insert(*user, tx).is_some() {
            debug!(user = %user.short(), "replaced existing delivery channel");
        } else {
            debug!(user = %user.short(), "delivery channel connected");
        }
        rx
    }

    pub fn disconnect(&self, user: &UserId) {
        let Ok(mut channels) = self.channels.lock() else {
            return;
        };
        if channels.remove(user).is_some() {
            debug!(user = %user.short(), "delivery channel disconnected");
        }
    }

    /// Push one event to `user`. Returns `true` iff a live channel existed
    /// and accepted the event. A channel whose receiver has been dropped is
    /// pruned and reported as a miss.
    pub fn send(&self, user: &UserId, event: PushEvent) -> bool {
        let Ok(mut channels) = self.channels.lock() else {
            return false;
        };
        match channels.get(user) {
            Some(tx) => {
                if tx.send(event).is_ok() {
                    true
                } else {
                    channels.remove(user);
                    debug!(user = %user.short(), "pruned closed delivery channel");
                    false
                }
            }
            None => {
                debug!(
                    user = %user.short(),
                    event = event.event_type(),
                    "no live channel, delivery missed"
                );
                false
            }
        }
    }

    pub fn is_connected(&self, user: &UserId) -> bool {
        self.channels
            .lock()
            .map(|channels| channels.contains_key(user))
            .unwrap_or(false)
    }

    pub fn connected_user_ids(&self) -> HashSet<UserId> {
        self.channels
            .lock()
            .map(|channels| channels.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.channels.lock().map(|channels| channels.len()).unwrap_or(0)
    }
}
