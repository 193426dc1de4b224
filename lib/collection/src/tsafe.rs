//! `TimestampWatcher` — the per-v-channel `tSafe` replica of spec.md §4.1.
//!
//! One map channel -> (timestamp, notifier). `setTSafe` is the only mutator
//! and is strictly monotone per channel (spec.md §5); watchers are woken via
//! `tokio::sync::Notify::notify_waiters`, which wakes every current waiter,
//! matching the "every `setTSafe` wakes all watchers" requirement without
//! needing a raw condition variable.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use segment::{ChannelName, Timestamp};
use tokio::sync::Notify;

use crate::errors::{CollectionError, CollectionResult};

struct ChannelEntry {
    timestamp: Timestamp,
    notify: Arc<Notify>,
}

#[derive(Default)]
pub struct TimestampWatcher {
    channels: RwLock<HashMap<ChannelName, ChannelEntry>>,
}

impl TimestampWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: a second `add_tsafe` on an existing channel is a no-op.
    pub fn add_tsafe(&self, channel: &str) {
        let mut guard = self.channels.write();
        guard.entry(channel.to_string()).or_insert_with(|| ChannelEntry {
            timestamp: 0,
            notify: Arc::new(Notify::new()),
        });
    }

    /// Returns whether the channel existed (and is now removed). Wakes every
    /// registered watcher, which will see the "channel closed" sentinel on
    /// their next poll (spec.md §4.1 "Cancellation").
    pub fn remove_tsafe(&self, channel: &str) -> bool {
        let mut guard = self.channels.write();
        match guard.remove(channel) {
            Some(entry) => {
                entry.notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Fails if `t` would move the watermark backwards. `set_tsafe` for one
    /// channel is only ever called by that channel's single ServiceTimeNode
    /// (spec.md §4.1), so calls on the same channel are already serialized
    /// upstream; the write lock here only guards against concurrent readers.
    pub fn set_tsafe(&self, channel: &str, t: Timestamp) -> CollectionResult<()> {
        let mut guard = self.channels.write();
        let entry = guard
            .get_mut(channel)
            .ok_or_else(|| CollectionError::not_found(format!("tsafe channel {channel}")))?;
        if t < entry.timestamp {
            return Err(CollectionError::fatal(format!(
                "tsafe regression on channel {channel}: {t} < {}",
                entry.timestamp
            )));
        }
        entry.timestamp = t;
        entry.notify.notify_waiters();
        Ok(())
    }

    pub fn get_tsafe(&self, channel: &str) -> CollectionResult<Timestamp> {
        let guard = self.channels.read();
        guard
            .get(channel)
            .map(|e| e.timestamp)
            .ok_or_else(|| CollectionError::not_found(format!("tsafe channel {channel}")))
    }

    /// Returns a clone of the channel's notifier so a caller can
    /// `notified().await` without holding the registry lock across the
    /// await point (spec.md §5 "no lock is held across ... a segcore call").
    pub fn watch(&self, channel: &str) -> Option<Arc<Notify>> {
        self.channels.read().get(channel).map(|e| e.notify.clone())
    }

    pub fn channels(&self) -> Vec<ChannelName> {
        self.channels.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent_and_starts_at_zero() {
        let watcher = TimestampWatcher::new();
        watcher.add_tsafe("c1");
        watcher.add_tsafe("c1");
        assert_eq!(watcher.get_tsafe("c1").unwrap(), 0);
    }

    #[test]
    fn set_tsafe_is_monotone() {
        let watcher = TimestampWatcher::new();
        watcher.add_tsafe("c1");
        watcher.set_tsafe("c1", 10).unwrap();
        assert!(watcher.set_tsafe("c1", 5).is_err());
        watcher.set_tsafe("c1", 10).unwrap();
        watcher.set_tsafe("c1", 20).unwrap();
        assert_eq!(watcher.get_tsafe("c1").unwrap(), 20);
    }

    #[test]
    fn remove_reports_prior_existence() {
        let watcher = TimestampWatcher::new();
        assert!(!watcher.remove_tsafe("missing"));
        watcher.add_tsafe("c1");
        assert!(watcher.remove_tsafe("c1"));
        assert!(watcher.get_tsafe("c1").is_err());
    }

    #[tokio::test]
    async fn watchers_wake_on_every_set() {
        let watcher = Arc::new(TimestampWatcher::new());
        watcher.add_tsafe("c1");
        let notify = watcher.watch("c1").unwrap();

        let waiter = tokio::spawn(async move {
            notify.notified().await;
        });
        // give the spawned task a chance to register interest
        tokio::task::yield_now().await;
        watcher.set_tsafe("c1", 1).unwrap();
        waiter.await.unwrap();
    }
}
