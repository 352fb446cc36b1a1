//! Host and overlay callback contracts
//!
//! All callbacks run on the context that drains the player's event queue.

use crate::classifier::PlaybackErrorCode;
use crate::types::{EngineFailure, MediaTime, Timeline};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Playback notifications for the hosting application
#[allow(unused_variables)]
pub trait PlaybackDelegate: Send + Sync {
    /// Asked before every play attempt; returning false cancels it
    fn should_begin(&self) -> bool {
        true
    }

    fn did_begin(&self) {}

    fn will_pause(&self) {}

    fn did_pause(&self) {}

    /// Current item played to its end
    fn did_end(&self) {}

    /// Current item time jumped
    fn did_jump(&self) {}

    /// Periodic position update; skipped while seeking
    fn time_did_change(&self, time: MediaTime) {}

    fn start_buffering(&self) {}

    fn end_buffering(&self) {}

    /// Engine became ready; fires once per engine
    fn player_is_ready(&self) {}

    /// Current item became ready; fires once per attached item
    fn item_is_ready(&self) {}

    /// Engine failed; the player must be abandoned
    fn player_did_fail(&self, error: &EngineFailure) {}

    /// Current item failed; a new item may be supplied
    fn item_did_fail(&self, error: PlaybackErrorCode) {}

    /// Display surface readiness changed
    fn rendering_availability_changed(&self, is_ready: bool) {}
}

/// Why playback stopped with an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum FailureReason {
    Player { error: EngineFailure },
    Item { code: PlaybackErrorCode },
}

/// Notifications for the transport-controls overlay
#[allow(unused_variables)]
pub trait ControlsDelegate: Send + Sync {
    fn on_play(&self) {}

    fn on_pause(&self) {}

    fn on_time_changed(&self, timeline: &Timeline) {}

    fn on_playback_ended(&self) {}

    fn on_playback_failed(&self, reason: &FailureReason) {}

    fn on_start_buffering(&self) {}

    fn on_end_buffering(&self) {}

    fn on_fullscreen_changed(&self, enabled: bool) {}

    fn on_pip_changed(&self, enabled: bool) {}
}

/// Handle to a registered playback delegate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelegateId(pub Uuid);

impl DelegateId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DelegateId {
    fn default() -> Self {
        Self::new()
    }
}

/// Registered delegates, in registration order
#[derive(Default)]
pub struct DelegateRegistry {
    entries: Vec<(DelegateId, Arc<dyn PlaybackDelegate>)>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, delegate: Arc<dyn PlaybackDelegate>) -> DelegateId {
        let id = DelegateId::new();
        self.entries.push((id, delegate));
        id
    }

    /// Remove a delegate; returns false for an unknown id
    pub fn remove(&mut self, id: DelegateId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every delegate must agree; an empty registry allows playback
    pub fn should_begin(&self) -> bool {
        self.entries.iter().all(|(_, delegate)| delegate.should_begin())
    }

    /// Invoke `f` on each delegate
    pub fn notify(&self, f: impl Fn(&dyn PlaybackDelegate)) {
        for (_, delegate) in &self.entries {
            f(delegate.as_ref());
        }
    }
}
