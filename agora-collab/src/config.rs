//! Collaboration core configuration.
//!
//! Every field has a default, so a config file only needs the keys it
//! overrides:
//!
//! ```json
//! { "heartbeat_interval_secs": 15, "strategies": { "status": "last_write_wins" } }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::resolver::{default_strategies, Strategy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Room capacity when the room settings don't specify one
    pub default_max_participants: usize,
    /// Upper bound for a single lock grant
    pub lock_max_secs: u64,
    /// Expected client heartbeat period; users are timed out after twice this
    pub heartbeat_interval_secs: u64,
    /// How long an empty session drains before it is closed
    pub drain_grace_secs: u64,
    /// How long a room with no sessions and no members survives
    pub room_idle_timeout_secs: u64,
    /// Max wait for a room's critical section before `Timeout`
    pub room_wait_timeout_ms: u64,
    /// Message history kept per room and per session
    pub message_history_cap: usize,
    /// Change records kept per session
    pub change_log_cap: usize,
    /// Activity entries kept per session
    pub activity_log_cap: usize,
    /// Events queued per offline user before the oldest are dropped
    pub offline_queue_cap: usize,
    /// Delivery attempts per event before it is dropped
    pub max_delivery_attempts: u32,
    /// Delivery diagnostics retained
    pub diagnostics_cap: usize,
    /// Periodic auto-save of dirty sessions
    pub autosave_interval_secs: u64,
    /// Auto-save after this many edits, whichever comes first
    pub autosave_change_threshold: usize,
    /// Background sweep period
    pub sweep_interval_secs: u64,
    /// Content type → conflict resolution strategy
    pub strategies: HashMap<String, Strategy>,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            default_max_participants: 50,
            lock_max_secs: 300,
            heartbeat_interval_secs: 30,
            drain_grace_secs: 300,
            room_idle_timeout_secs: 30 * 60,
            room_wait_timeout_ms: 5_000,
            message_history_cap: 1_000,
            change_log_cap: 1_000,
            activity_log_cap: 10_000,
            offline_queue_cap: 500,
            max_delivery_attempts: 5,
            diagnostics_cap: 256,
            autosave_interval_secs: 30,
            autosave_change_threshold: 50,
            sweep_interval_secs: 5,
            strategies: default_strategies(),
        }
    }
}

impl CollabConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Load a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_json_str(&raw)?)
    }

    pub fn lock_max(&self) -> Duration {
        Duration::from_secs(self.lock_max_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    pub fn room_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.room_idle_timeout_secs)
    }

    pub fn room_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.room_wait_timeout_ms)
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
