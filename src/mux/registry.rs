//! Name-to-channel tables, one per channel kind

use super::channel::MuxChannel;
use super::MuxError;
use crate::ident::ChannelName;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Channels of one kind, keyed by name. Each operation is atomic under the
/// table lock; the lock is never held across channel disposal or callbacks,
/// so shutdown iterates over a [`drain`](ChannelRegistry::drain) snapshot.
pub struct ChannelRegistry {
    channels: Mutex<HashMap<ChannelName, Arc<MuxChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Register a channel under its name; a name may appear at most once
    /// per kind.
    pub fn insert(&self, channel: Arc<MuxChannel>) -> Result<(), MuxError> {
        let mut channels = self.channels.lock().expect("registry lock poisoned");
        let name = *channel.name();
        if channels.contains_key(&name) {
            return Err(MuxError::DuplicateChannel(name));
        }
        channels.insert(name, channel);
        Ok(())
    }

    pub fn get(&self, name: &ChannelName) -> Option<Arc<MuxChannel>> {
        self.channels
            .lock()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &ChannelName) -> bool {
        self.channels
            .lock()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    pub fn remove(&self, name: &ChannelName) -> Option<Arc<MuxChannel>> {
        self.channels
            .lock()
            .expect("registry lock poisoned")
            .remove(name)
    }

    /// Remove the entry for `name` only if it is `channel` itself. Keeps a
    /// disposed channel that was never registered (duplicate inbound
    /// connect) from evicting the live one under the same name.
    pub(crate) fn remove_entry(&self, name: &ChannelName, channel: &MuxChannel) -> bool {
        let mut channels = self.channels.lock().expect("registry lock poisoned");
        if let Some(existing) = channels.get(name) {
            if std::ptr::eq(Arc::as_ptr(existing), channel) {
                channels.remove(name);
                return true;
            }
        }
        false
    }

    /// Take a snapshot of every channel and clear the table
    pub fn drain(&self) -> Vec<Arc<MuxChannel>> {
        self.channels
            .lock()
            .expect("registry lock poisoned")
            .drain()
            .map(|(_, channel)| channel)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
