//! Host key/value storage capability
//!
//! All persistence is delegated to the embedding host through this
//! synchronous map. The core never touches platform storage directly;
//! it reads and writes the typed keys below and treats everything else
//! as opaque.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// The storage keys the core reads and writes
pub mod keys {
    /// Current SIP username
    pub const SIP_USERNAME: &str = "sipUsername";
    /// Ordered BLF button list, JSON-encoded [`super::BlfButton`] array
    pub const BLF_BUTTONS: &str = "blfButtons";
    /// Selected audio input device identifier
    pub const INPUT_DEVICE: &str = "audioInputDevice";
    /// Selected audio output device identifier
    pub const OUTPUT_DEVICE: &str = "audioOutputDevice";
    /// Busy-light enable flag ("true"/"false")
    pub const BUSYLIGHT_ENABLED: &str = "busylightEnabled";
    /// Busy-light alert sound (1..=7)
    pub const RING_SOUND: &str = "busylightSound";
    /// Busy-light alert volume (0/25/50/75/100)
    pub const RING_VOLUME: &str = "busylightVolume";
    /// Last-known agent state, JSON-encoded
    pub const AGENT_STATE: &str = "agentState";
}

/// One configured BLF button as persisted by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlfButton {
    /// Monitored extension
    pub extension: String,
    /// Label shown on the button
    pub display_name: String,
}

/// Synchronous key/value storage supplied by the host
pub trait HostStorage: Send + Sync {
    /// Read a key
    fn get(&self, key: &str) -> Option<String>;
    /// Write a key
    fn set(&self, key: &str, value: &str);
    /// Delete a key
    fn remove(&self, key: &str);
}

/// Storage helpers layered over the raw map
pub trait HostStorageExt: HostStorage {
    /// The persisted BLF button list, empty when absent or malformed
    fn blf_buttons(&self) -> Vec<BlfButton> {
        self.get(keys::BLF_BUTTONS)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    /// Persist the BLF button list
    fn set_blf_buttons(&self, buttons: &[BlfButton]) {
        if let Ok(raw) = serde_json::to_string(buttons) {
            self.set(keys::BLF_BUTTONS, &raw);
        }
    }

    /// Selected audio devices as (input, output)
    fn selected_devices(&self) -> (Option<String>, Option<String>) {
        (self.get(keys::INPUT_DEVICE), self.get(keys::OUTPUT_DEVICE))
    }
}

impl<T: HostStorage + ?Sized> HostStorageExt for T {}

/// In-memory storage for tests and hosts without persistence
#[derive(Debug, Default)]
pub struct MemoryStorage {
    map: DashMap<String, String>,
}

impl MemoryStorage {
    /// An empty store
    pub fn new() -> Self {
        MemoryStorage { map: DashMap::new() }
    }
}

impl HostStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.map.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blf_buttons_round_trip() {
        let store = MemoryStorage::new();
        let buttons = vec![
            BlfButton { extension: "4001".into(), display_name: "Support".into() },
            BlfButton { extension: "4002".into(), display_name: "Sales".into() },
        ];
        store.set_blf_buttons(&buttons);
        assert_eq!(store.blf_buttons(), buttons);
    }

    #[test]
    fn malformed_button_json_reads_empty() {
        let store = MemoryStorage::new();
        store.set(keys::BLF_BUTTONS, "not-json");
        assert!(store.blf_buttons().is_empty());
    }
}
