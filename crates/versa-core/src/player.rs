//! Playback facade
//!
//! [`VersaPlayer`] owns the engine and the status bridge. Host code calls
//! the transport operations on it and drains engine notifications with
//! [`VersaPlayer::pump`] or [`VersaPlayer::next_event`]; delegate callbacks
//! only run during that drain. Every change is published as a
//! [`PlaybackSnapshot`] on a watch channel.

use crate::bridge::{self, StatusBridge};
use crate::delegate::{ControlsDelegate, DelegateId, PlaybackDelegate};
use crate::drm::{KeyDeliveryResolver, KeyLoaderHook};
use crate::engine::{MediaEngine, Observed, PlayerEvent, SeekId};
use crate::error::Result;
use crate::types::{CaptionStyle, ItemId, MediaItem, MediaTime, PlaybackSnapshot, PlayerConfig, SessionId, Status};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Media player over a [`MediaEngine`]
pub struct VersaPlayer<E: MediaEngine> {
    id: SessionId,
    config: PlayerConfig,
    engine: E,
    bridge: StatusBridge,
    resolver: Arc<KeyDeliveryResolver>,
    state_tx: watch::Sender<PlaybackSnapshot>,
    is_playing: bool,
    scrubbing: bool,
    resume_after_scrub: bool,
    next_seek: u64,
    pending_seeks: HashSet<SeekId>,
    was_playing_before_rate_change: bool,
    is_fullscreen: bool,
    is_pip: bool,
    caption_style: CaptionStyle,
}

impl<E: MediaEngine> VersaPlayer<E> {
    /// Create a player with an HTTP key resolver on the current runtime
    pub fn new(engine: E, config: PlayerConfig) -> Result<Self> {
        config.validate()?;
        let resolver = Arc::new(KeyDeliveryResolver::from_config(&config)?);
        Self::with_resolver(engine, config, resolver)
    }

    /// Create a player with a custom key resolver
    pub fn with_resolver(mut engine: E, config: PlayerConfig, resolver: Arc<KeyDeliveryResolver>) -> Result<Self> {
        config.validate()?;

        let id = SessionId::new();
        let mut bridge = StatusBridge::new();
        bridge.attach_player(&mut engine, config.time_observer_interval());
        let (state_tx, _) = watch::channel(PlaybackSnapshot::default());

        info!(session = %id, autoplay = config.autoplay, "Created player");

        Ok(Self {
            id,
            config,
            engine,
            bridge,
            resolver,
            state_tx,
            is_playing: false,
            scrubbing: false,
            resume_after_scrub: false,
            next_seek: 0,
            pending_seeks: HashSet::new(),
            was_playing_before_rate_change: false,
            is_fullscreen: false,
            is_pip: false,
            caption_style: CaptionStyle::default(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Start playback unless a delegate vetoes it
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn play(&mut self) -> bool {
        if !self.bridge.should_begin() {
            debug!("Playback vetoed");
            return false;
        }
        self.engine.play();
        self.is_playing = true;
        self.bridge.did_begin();
        self.publish();
        true
    }

    #[instrument(skip(self), fields(session = %self.id))]
    pub fn pause(&mut self) {
        self.bridge.will_pause();
        self.engine.pause();
        self.is_playing = false;
        self.bridge.did_pause();
        self.publish();
    }

    /// Leave fast-forward or rewind at normal speed, otherwise flip
    /// between playing and paused
    pub fn toggle_playback(&mut self) {
        if self.is_forwarding() || self.is_rewinding() {
            self.engine.set_rate(1.0);
            self.publish();
            return;
        }
        if self.is_playing {
            self.pause();
        } else {
            self.play();
        }
    }

    /// Replace the current item; `None` clears it
    #[instrument(skip(self, item), fields(session = %self.id))]
    pub fn set_item(&mut self, item: Option<MediaItem>) {
        let incoming = item.as_ref().map(|item| item.id);

        if let Some(item) = &item {
            if let Some(info) = &item.decryption {
                debug!(item = %item.id, content_id = %info.content_id, "Binding key loader");
                let hook = KeyLoaderHook::new(Arc::clone(&self.resolver), info.clone());
                self.engine.set_resource_loader(item.id, Arc::new(hook));
            }
        }

        self.pending_seeks.clear();
        self.scrubbing = false;
        self.bridge.replace_item(&mut self.engine, item);
        info!(item = ?incoming, "Current item replaced");

        match incoming {
            Some(_) if self.config.autoplay && !self.bridge.item_status().is_failed() => {
                self.play();
            }
            Some(_) => {}
            None => self.is_playing = false,
        }
        self.publish();
    }

    /// Seek within the playable range.
    ///
    /// Returns the clamped target, or `None` without an item or for a
    /// non-numeric time.
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn seek(&mut self, to: MediaTime) -> Option<MediaTime> {
        if self.engine.current_item_properties().is_none() {
            debug!("No item to seek");
            return None;
        }
        if !to.is_numeric() {
            warn!(target_time = %to, "Ignoring seek to non-numeric time");
            return None;
        }

        let target = to.clamp_to(self.start_time(), self.end_time());
        self.next_seek += 1;
        let seek = SeekId(self.next_seek);
        self.pending_seeks.insert(seek);
        self.engine.seek(target, seek);
        debug!(target_time = target.seconds(), seek = seek.0, "Seeking");
        self.publish();
        Some(target)
    }

    /// Start scrubbing: pause and remember whether to resume
    pub fn begin_seeking(&mut self) {
        self.resume_after_scrub = self.is_playing;
        self.scrubbing = true;
        self.pause();
    }

    /// Finish scrubbing and resume if playback was interrupted
    pub fn end_seeking(&mut self) {
        self.scrubbing = false;
        if std::mem::take(&mut self.resume_after_scrub) {
            self.play();
        }
        self.publish();
    }

    pub fn skip_forward(&mut self) -> Option<MediaTime> {
        let target = self.engine.current_time().offset_by(self.config.skip_interval_secs);
        self.seek(target)
    }

    pub fn skip_backward(&mut self) -> Option<MediaTime> {
        let target = self.engine.current_time().offset_by(-self.config.skip_interval_secs);
        self.seek(target)
    }

    /// Toggle fast-forward; returns false when the item cannot play fast
    pub fn toggle_fast_forward(&mut self) -> bool {
        let supported = self
            .engine
            .current_item_properties()
            .is_some_and(|props| props.can_play_fast_forward);
        if !supported {
            return false;
        }
        let rate = self.config.fast_forward_rate;
        let active = self.is_forwarding();
        self.toggle_rate(rate, active)
    }

    /// Toggle rewind; returns false when the item cannot play in reverse
    pub fn toggle_rewind(&mut self) -> bool {
        let supported = self
            .engine
            .current_item_properties()
            .is_some_and(|props| props.can_play_fast_reverse);
        if !supported {
            return false;
        }
        let rate = self.config.rewind_rate;
        let active = self.is_rewinding();
        self.toggle_rate(rate, active)
    }

    fn toggle_rate(&mut self, rate: f32, active: bool) -> bool {
        if active {
            self.engine.set_rate(1.0);
            if self.was_playing_before_rate_change {
                self.play();
            } else {
                self.pause();
            }
        } else {
            self.was_playing_before_rate_change = self.is_playing;
            if !self.is_playing && !self.play() {
                return false;
            }
            self.engine.set_rate(rate);
            debug!(rate, "Playback rate changed");
        }
        self.publish();
        true
    }

    /// Start of the playable range; zero without an item
    pub fn start_time(&self) -> MediaTime {
        bridge::start_time(&self.engine)
    }

    /// End of the playable range; zero without an item
    pub fn end_time(&self) -> MediaTime {
        bridge::end_time(&self.engine)
    }

    pub fn current_time(&self) -> MediaTime {
        self.engine.current_time()
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    /// Scrubbing, or waiting for a seek to complete
    pub fn is_seeking(&self) -> bool {
        self.scrubbing || !self.pending_seeks.is_empty()
    }

    pub fn is_buffering(&self) -> bool {
        self.bridge.is_buffering()
    }

    pub fn is_forwarding(&self) -> bool {
        self.engine.rate() > 1.0
    }

    pub fn is_rewinding(&self) -> bool {
        self.engine.rate() < 0.0
    }

    pub fn is_fullscreen(&self) -> bool {
        self.is_fullscreen
    }

    pub fn is_pip(&self) -> bool {
        self.is_pip
    }

    pub fn current_item(&self) -> Option<ItemId> {
        self.bridge.current_item()
    }

    pub fn item_status(&self) -> Status {
        self.bridge.item_status()
    }

    pub fn player_status(&self) -> Status {
        self.bridge.player_status().clone()
    }

    pub fn set_fullscreen(&mut self, enabled: bool) {
        if self.is_fullscreen != enabled {
            self.is_fullscreen = enabled;
            self.bridge.fullscreen_changed(enabled);
            self.publish();
        }
    }

    pub fn set_pip(&mut self, enabled: bool) {
        if self.is_pip != enabled {
            self.is_pip = enabled;
            self.bridge.pip_changed(enabled);
            self.publish();
        }
    }

    pub fn caption_style(&self) -> &CaptionStyle {
        &self.caption_style
    }

    pub fn set_caption_style(&mut self, style: CaptionStyle) {
        self.engine.apply_caption_style(&style);
        self.caption_style = style;
    }

    pub fn add_delegate(&mut self, delegate: Arc<dyn PlaybackDelegate>) -> DelegateId {
        self.bridge.add_delegate(delegate)
    }

    pub fn remove_delegate(&mut self, id: DelegateId) -> bool {
        self.bridge.remove_delegate(id)
    }

    pub fn set_controls(&mut self, controls: Option<Arc<dyn ControlsDelegate>>) {
        self.bridge.set_controls(controls);
    }

    /// Current state
    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            item: self.bridge.current_item(),
            item_status: self.bridge.item_status(),
            player_status: self.bridge.player_status().clone(),
            is_playing: self.is_playing,
            is_seeking: self.is_seeking(),
            is_buffering: self.bridge.is_buffering(),
            is_fullscreen: self.is_fullscreen,
            is_pip: self.is_pip,
            rate: self.engine.rate(),
            timeline: bridge::timeline(&self.engine),
        }
    }

    /// Subscribe to state snapshots
    pub fn subscribe_state(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.state_tx.subscribe()
    }

    /// Dispatch every queued engine notification; returns how many were
    /// accepted
    pub fn pump(&mut self) -> usize {
        let mut accepted = 0;
        while let Some(observed) = self.bridge.try_next() {
            if self.handle(observed).is_some() {
                accepted += 1;
            }
        }
        if accepted > 0 {
            self.publish();
        }
        accepted
    }

    /// Wait for and dispatch the next accepted engine notification
    pub async fn next_event(&mut self) -> Option<PlayerEvent> {
        loop {
            let observed = self.bridge.next().await?;
            if let Some(event) = self.handle(observed) {
                self.publish();
                return Some(event);
            }
        }
    }

    fn handle(&mut self, observed: Observed) -> Option<PlayerEvent> {
        let seeking = self.is_seeking();
        let event = self.bridge.dispatch(observed, &self.engine, seeking)?;
        match &event {
            PlayerEvent::PlayedToEnd => self.is_playing = false,
            PlayerEvent::SeekCompleted(seek) => {
                if !self.pending_seeks.remove(seek) {
                    debug!(seek = seek.0, "Completion of a seek issued before the item changed");
                }
            }
            PlayerEvent::StatusChanged(Status::Failed(_)) | PlayerEvent::ItemStatusChanged(Status::Failed(_)) => {
                self.is_playing = false
            }
            _ => {}
        }
        Some(event)
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.snapshot());
    }
}

impl<E: MediaEngine> Drop for VersaPlayer<E> {
    fn drop(&mut self) {
        self.bridge.teardown(&mut self.engine);
        debug!(session = %self.id, "Player dropped");
    }
}
