//! Contract with the native media engine
//!
//! The engine is an opaque collaborator. It reports state changes as typed
//! [`PlayerEvent`]s pushed into [`EventSink`]s from whatever thread it runs
//! callbacks on; the sinks feed a single channel that the player drains on
//! the UI context. Every sink is bound to an [`ObserverHandle`] so events that
//! arrive after their registration was removed can be recognised and dropped.

use crate::drm::KeyDeliveryError;
use crate::types::{CaptionStyle, ItemId, ItemProperties, MediaItem, MediaTime, Status};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Registration handle for one observer on the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverHandle(pub u64);

impl std::fmt::Display for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

/// Identifies one seek so its completion can be matched to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeekId(pub u64);

/// What an observer is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserverTarget {
    /// Engine status, seek completion and display readiness
    Player,
    /// Periodic time ticks
    PeriodicTime,
    /// Status, buffering and timeline notifications of one item
    Item(ItemId),
}

/// Observable engine and item transitions
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// Engine status changed
    StatusChanged(Status),
    /// Current item status changed
    ItemStatusChanged(Status),
    /// Item playback buffer emptied (`true`) or refilled (`false`)
    BufferEmpty(bool),
    /// Item playback buffer is full
    BufferFull(bool),
    /// Item is likely to keep up with playback
    LikelyToKeepUp(bool),
    /// Periodic time observation
    PeriodicTime(MediaTime),
    /// Item played to its end
    PlayedToEnd,
    /// Item time jumped discontinuously
    TimeJumped,
    /// The seek issued with this id finished
    SeekCompleted(SeekId),
    /// Display surface can (or can no longer) present frames
    ReadyForDisplay(bool),
}

impl PlayerEvent {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            PlayerEvent::StatusChanged(_) => "status_changed",
            PlayerEvent::ItemStatusChanged(_) => "item_status_changed",
            PlayerEvent::BufferEmpty(_) => "buffer_empty",
            PlayerEvent::BufferFull(_) => "buffer_full",
            PlayerEvent::LikelyToKeepUp(_) => "likely_to_keep_up",
            PlayerEvent::PeriodicTime(_) => "periodic_time",
            PlayerEvent::PlayedToEnd => "played_to_end",
            PlayerEvent::TimeJumped => "time_jumped",
            PlayerEvent::SeekCompleted(_) => "seek_completed",
            PlayerEvent::ReadyForDisplay(_) => "ready_for_display",
        }
    }

    /// Whether this event may be delivered through an observer on `target`
    pub fn belongs_to(&self, target: &ObserverTarget) -> bool {
        match self {
            PlayerEvent::StatusChanged(_)
            | PlayerEvent::SeekCompleted(_)
            | PlayerEvent::ReadyForDisplay(_) => matches!(target, ObserverTarget::Player),
            PlayerEvent::PeriodicTime(_) => matches!(target, ObserverTarget::PeriodicTime),
            PlayerEvent::ItemStatusChanged(_)
            | PlayerEvent::BufferEmpty(_)
            | PlayerEvent::BufferFull(_)
            | PlayerEvent::LikelyToKeepUp(_)
            | PlayerEvent::PlayedToEnd
            | PlayerEvent::TimeJumped => matches!(target, ObserverTarget::Item(_)),
        }
    }
}

/// An event tagged with the registration it was delivered through
#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    pub handle: ObserverHandle,
    pub event: PlayerEvent,
}

/// Sending half handed to the engine for one registration
#[derive(Debug, Clone)]
pub struct EventSink {
    handle: ObserverHandle,
    tx: mpsc::UnboundedSender<Observed>,
}

impl EventSink {
    pub(crate) fn new(handle: ObserverHandle, tx: mpsc::UnboundedSender<Observed>) -> Self {
        Self { handle, tx }
    }

    pub fn handle(&self) -> ObserverHandle {
        self.handle
    }

    /// Queue an event; returns false once the player is gone
    pub fn send(&self, event: PlayerEvent) -> bool {
        self.tx
            .send(Observed {
                handle: self.handle,
                event,
            })
            .is_ok()
    }
}

/// A pending engine request for a decryption key.
///
/// Implemented by the engine. `finish` consumes the request so it can only be
/// completed once.
pub trait KeyLoadingRequest: Send {
    /// Asset the key is requested for
    fn asset(&self) -> ItemId;

    /// Resource URL of the request, if the engine supplied one
    fn url(&self) -> Option<&Url>;

    /// Build the opaque key request payload from certificate and content id
    /// bytes. Errors describe why the engine rejected the inputs.
    fn key_request_data(&self, certificate: &[u8], content_id: &[u8]) -> Result<Bytes, String>;

    /// Hand the key bytes (or the failure) back to the engine
    fn finish(self: Box<Self>, outcome: Result<Bytes, KeyDeliveryError>);
}

/// Hook invoked by the engine when a resource needs custom loading
pub trait ResourceLoader: Send + Sync {
    /// Returns true when the request will be finished asynchronously, false
    /// when it was already finished (successfully or not)
    fn should_wait_for_loading(&self, request: Box<dyn KeyLoadingRequest>) -> bool;
}

/// The native playback engine
pub trait MediaEngine: Send {
    /// Engine status
    fn status(&self) -> Status;

    fn play(&mut self);

    fn pause(&mut self);

    /// Signed playback rate; 0 when paused
    fn rate(&self) -> f32;

    fn set_rate(&mut self, rate: f32);

    /// Current position of the current item
    fn current_time(&self) -> MediaTime;

    /// Start seeking; completion is reported with [`PlayerEvent::SeekCompleted`]
    /// carrying `id`
    fn seek(&mut self, to: MediaTime, id: SeekId);

    /// Replace the current item; the engine starts loading it immediately
    fn replace_current_item(&mut self, item: Option<MediaItem>);

    /// Properties of the current item, `None` without one
    fn current_item_properties(&self) -> Option<ItemProperties>;

    fn add_player_observers(&mut self, sink: EventSink);

    fn add_item_observers(&mut self, item: ItemId, sink: EventSink);

    fn add_periodic_time_observer(&mut self, interval: Duration, sink: EventSink);

    fn remove_observer(&mut self, handle: ObserverHandle);

    /// Bind the resource-loading hook for an item's asset
    fn set_resource_loader(&mut self, item: ItemId, loader: Arc<dyn ResourceLoader>);

    /// Apply caption styling; engines without caption support ignore it
    fn apply_caption_style(&mut self, _style: &CaptionStyle) {}
}
