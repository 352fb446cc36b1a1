//! Status/event bridge
//!
//! Translates raw engine notifications into delegate callbacks. The bridge
//! owns every observer registration it makes on the engine and the channel
//! the engine delivers through; an event is only translated when the handle
//! it arrived with is still registered.

use crate::classifier::PlaybackErrorCode;
use crate::delegate::{ControlsDelegate, DelegateId, DelegateRegistry, FailureReason, PlaybackDelegate};
use crate::engine::{EventSink, MediaEngine, Observed, ObserverHandle, ObserverTarget, PlayerEvent};
use crate::types::{ItemId, MediaItem, MediaTime, Status, Timeline};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

struct ActiveItem {
    id: ItemId,
    status: Status,
}

/// Engine-to-delegate translation layer
pub struct StatusBridge {
    tx: mpsc::UnboundedSender<Observed>,
    rx: mpsc::UnboundedReceiver<Observed>,
    next_handle: u64,
    registrations: HashMap<ObserverHandle, ObserverTarget>,
    delegates: DelegateRegistry,
    controls: Option<Arc<dyn ControlsDelegate>>,
    active: Option<ActiveItem>,
    player_status: Status,
    buffering: bool,
    rendering_ready: bool,
}

impl StatusBridge {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            next_handle: 1,
            registrations: HashMap::new(),
            delegates: DelegateRegistry::new(),
            controls: None,
            active: None,
            player_status: Status::Unknown,
            buffering: false,
            rendering_ready: false,
        }
    }

    fn register(&mut self, target: ObserverTarget) -> EventSink {
        let handle = ObserverHandle(self.next_handle);
        self.next_handle += 1;
        self.registrations.insert(handle, target);
        EventSink::new(handle, self.tx.clone())
    }

    fn unregister<E>(&mut self, engine: &mut E, keep: impl Fn(&ObserverTarget) -> bool)
    where
        E: MediaEngine + ?Sized,
    {
        let mut removed: Vec<ObserverHandle> = self
            .registrations
            .iter()
            .filter(|(_, target)| !keep(target))
            .map(|(handle, _)| *handle)
            .collect();
        removed.sort();
        for handle in removed {
            self.registrations.remove(&handle);
            engine.remove_observer(handle);
        }
    }

    /// Register engine status, display readiness and periodic time observers
    pub fn attach_player<E>(&mut self, engine: &mut E, interval: Duration)
    where
        E: MediaEngine + ?Sized,
    {
        let sink = self.register(ObserverTarget::Player);
        engine.add_player_observers(sink);
        let sink = self.register(ObserverTarget::PeriodicTime);
        engine.add_periodic_time_observer(interval, sink);
        debug!(interval_ms = interval.as_millis() as u64, "Player observers attached");
    }

    /// Remove engine-level observers
    pub fn detach_player<E>(&mut self, engine: &mut E)
    where
        E: MediaEngine + ?Sized,
    {
        self.unregister(engine, |target| matches!(target, ObserverTarget::Item(_)));
    }

    /// Swap the engine's current item: detach observers from the outgoing
    /// item, replace it on the engine, then observe the incoming one.
    pub fn replace_item<E>(&mut self, engine: &mut E, item: Option<MediaItem>)
    where
        E: MediaEngine + ?Sized,
    {
        self.detach_item(engine);
        let incoming = item.as_ref().map(|item| item.id);
        engine.replace_current_item(item);
        if let Some(id) = incoming {
            self.attach_item(engine, id);
        }
    }

    fn detach_item<E>(&mut self, engine: &mut E)
    where
        E: MediaEngine + ?Sized,
    {
        let Some(active) = self.active.take() else {
            return;
        };
        self.unregister(engine, |target| !matches!(target, ObserverTarget::Item(_)));
        debug!(item = %active.id, "Item observers detached");

        if self.buffering {
            self.buffering = false;
            self.end_buffering();
        }
    }

    fn attach_item<E>(&mut self, engine: &mut E, id: ItemId)
    where
        E: MediaEngine + ?Sized,
    {
        debug_assert!(
            !self.registrations.values().any(|t| matches!(t, ObserverTarget::Item(_))),
            "item observers still registered"
        );
        self.active = Some(ActiveItem {
            id,
            status: Status::Unknown,
        });
        let sink = self.register(ObserverTarget::Item(id));
        engine.add_item_observers(id, sink);
        debug!(item = %id, "Item observers attached");
    }

    /// Whether `handle` belongs to a live registration
    pub fn is_current(&self, handle: ObserverHandle) -> bool {
        self.registrations.contains_key(&handle)
    }

    /// Number of live registrations
    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    pub fn current_item(&self) -> Option<ItemId> {
        self.active.as_ref().map(|active| active.id)
    }

    pub fn item_status(&self) -> Status {
        self.active
            .as_ref()
            .map(|active| active.status.clone())
            .unwrap_or_default()
    }

    pub fn player_status(&self) -> &Status {
        &self.player_status
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    pub fn is_rendering_ready(&self) -> bool {
        self.rendering_ready
    }

    /// Translate one engine notification.
    ///
    /// Returns the event when it was accepted, `None` when it was stale or
    /// arrived through a registration of the wrong kind.
    pub fn dispatch<E>(&mut self, observed: Observed, engine: &E, is_seeking: bool) -> Option<PlayerEvent>
    where
        E: MediaEngine + ?Sized,
    {
        let Some(target) = self.registrations.get(&observed.handle).copied() else {
            trace!(handle = %observed.handle, event = observed.event.name(), "Dropping stale event");
            return None;
        };
        if !observed.event.belongs_to(&target) {
            warn!(handle = %observed.handle, event = observed.event.name(), "Event delivered through wrong observer");
            return None;
        }

        match &observed.event {
            PlayerEvent::StatusChanged(status) => self.on_player_status(status.clone()),
            PlayerEvent::ItemStatusChanged(status) => self.on_item_status(status.clone()),
            PlayerEvent::BufferEmpty(true) => {
                if !self.buffering {
                    self.buffering = true;
                    self.delegates.notify(|d| d.start_buffering());
                    if let Some(controls) = &self.controls {
                        controls.on_start_buffering();
                    }
                }
            }
            PlayerEvent::BufferFull(true) | PlayerEvent::LikelyToKeepUp(true) => {
                if self.buffering {
                    self.buffering = false;
                    self.end_buffering();
                }
            }
            PlayerEvent::BufferEmpty(false) | PlayerEvent::BufferFull(false) | PlayerEvent::LikelyToKeepUp(false) => {}
            PlayerEvent::PeriodicTime(time) => {
                if !is_seeking {
                    let time = *time;
                    self.delegates.notify(|d| d.time_did_change(time));
                }
                if let Some(controls) = &self.controls {
                    controls.on_time_changed(&timeline(engine));
                }
            }
            PlayerEvent::PlayedToEnd => {
                self.delegates.notify(|d| d.did_end());
                if let Some(controls) = &self.controls {
                    controls.on_playback_ended();
                }
            }
            PlayerEvent::TimeJumped => {
                self.delegates.notify(|d| d.did_jump());
                if let Some(controls) = &self.controls {
                    controls.on_time_changed(&timeline(engine));
                }
            }
            PlayerEvent::SeekCompleted(_) => {}
            PlayerEvent::ReadyForDisplay(ready) => {
                if self.rendering_ready != *ready {
                    self.rendering_ready = *ready;
                    let ready = *ready;
                    self.delegates.notify(|d| d.rendering_availability_changed(ready));
                }
            }
        }

        Some(observed.event)
    }

    fn on_player_status(&mut self, status: Status) {
        if let Err(e) = self.player_status.advance(status.clone()) {
            warn!(error = %e, "Ignoring engine status change");
            return;
        }
        match status {
            Status::Unknown => {}
            Status::Ready => {
                debug!("Engine ready");
                self.delegates.notify(|d| d.player_is_ready());
            }
            Status::Failed(failure) => {
                warn!(failure = %failure, "Engine failed");
                self.delegates.notify(|d| d.player_did_fail(&failure));
                if let Some(controls) = &self.controls {
                    controls.on_playback_failed(&FailureReason::Player { error: failure });
                }
            }
        }
    }

    fn on_item_status(&mut self, status: Status) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Err(e) = active.status.advance(status.clone()) {
            warn!(item = %active.id, error = %e, "Ignoring item status change");
            return;
        }
        let item = active.id;
        match status {
            Status::Unknown => {}
            Status::Ready => {
                debug!(item = %item, "Item ready");
                self.delegates.notify(|d| d.item_is_ready());
            }
            Status::Failed(failure) => {
                let code = PlaybackErrorCode::from_failure(&failure);
                warn!(item = %item, code = %code, failure = %failure, "Item failed");
                self.delegates.notify(|d| d.item_did_fail(code));
                if let Some(controls) = &self.controls {
                    controls.on_playback_failed(&FailureReason::Item { code });
                }
            }
        }
    }

    fn end_buffering(&self) {
        self.delegates.notify(|d| d.end_buffering());
        if let Some(controls) = &self.controls {
            controls.on_end_buffering();
        }
    }

    pub fn should_begin(&self) -> bool {
        self.delegates.should_begin()
    }

    pub fn did_begin(&self) {
        self.delegates.notify(|d| d.did_begin());
        if let Some(controls) = &self.controls {
            controls.on_play();
        }
    }

    pub fn will_pause(&self) {
        self.delegates.notify(|d| d.will_pause());
    }

    pub fn did_pause(&self) {
        self.delegates.notify(|d| d.did_pause());
        if let Some(controls) = &self.controls {
            controls.on_pause();
        }
    }

    pub fn fullscreen_changed(&self, enabled: bool) {
        if let Some(controls) = &self.controls {
            controls.on_fullscreen_changed(enabled);
        }
    }

    pub fn pip_changed(&self, enabled: bool) {
        if let Some(controls) = &self.controls {
            controls.on_pip_changed(enabled);
        }
    }

    pub fn add_delegate(&mut self, delegate: Arc<dyn PlaybackDelegate>) -> DelegateId {
        self.delegates.add(delegate)
    }

    pub fn remove_delegate(&mut self, id: DelegateId) -> bool {
        self.delegates.remove(id)
    }

    pub fn set_controls(&mut self, controls: Option<Arc<dyn ControlsDelegate>>) {
        self.controls = controls;
    }

    /// Next queued notification, without waiting
    pub fn try_next(&mut self) -> Option<Observed> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next notification
    pub async fn next(&mut self) -> Option<Observed> {
        self.rx.recv().await
    }

    /// Detach item observers, remove engine observers, clear the engine item
    pub fn teardown<E>(&mut self, engine: &mut E)
    where
        E: MediaEngine + ?Sized,
    {
        self.detach_item(engine);
        self.detach_player(engine);
        engine.replace_current_item(None);
        debug!("Bridge torn down");
    }
}

impl Default for StatusBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Position and playable range of the engine's current item
pub fn timeline<E>(engine: &E) -> Timeline
where
    E: MediaEngine + ?Sized,
{
    match engine.current_item_properties() {
        None => Timeline::empty(),
        Some(props) => {
            let current = engine.current_time();
            Timeline {
                current,
                start: props.start_time(),
                end: props.end_time(current),
            }
        }
    }
}

/// Playable range start; zero without an item
pub fn start_time<E>(engine: &E) -> MediaTime
where
    E: MediaEngine + ?Sized,
{
    engine
        .current_item_properties()
        .map(|props| props.start_time())
        .unwrap_or(MediaTime::ZERO)
}

/// Playable range end; zero without an item
pub fn end_time<E>(engine: &E) -> MediaTime
where
    E: MediaEngine + ?Sized,
{
    engine
        .current_item_properties()
        .map(|props| props.end_time(engine.current_time()))
        .unwrap_or(MediaTime::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{EngineCall, SimulatedEngine};
    use crate::types::EngineFailure;
    use parking_lot::Mutex;
    use url::Url;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock())
        }

        fn push(&self, s: impl Into<String>) {
            self.0.lock().push(s.into());
        }
    }

    impl PlaybackDelegate for Recorder {
        fn start_buffering(&self) {
            self.push("start_buffering");
        }
        fn end_buffering(&self) {
            self.push("end_buffering");
        }
        fn player_is_ready(&self) {
            self.push("player_is_ready");
        }
        fn item_is_ready(&self) {
            self.push("item_is_ready");
        }
        fn item_did_fail(&self, error: PlaybackErrorCode) {
            self.push(format!("item_did_fail:{}", error));
        }
        fn time_did_change(&self, _time: MediaTime) {
            self.push("time_did_change");
        }
        fn rendering_availability_changed(&self, is_ready: bool) {
            self.push(format!("rendering:{}", is_ready));
        }
    }

    fn setup() -> (StatusBridge, SimulatedEngine, Arc<Recorder>) {
        let mut engine = SimulatedEngine::new();
        let mut bridge = StatusBridge::new();
        bridge.attach_player(&mut engine, Duration::from_secs(1));
        let recorder = Arc::new(Recorder::default());
        bridge.add_delegate(recorder.clone());
        (bridge, engine, recorder)
    }

    fn drain(bridge: &mut StatusBridge, engine: &SimulatedEngine, seeking: bool) -> usize {
        let mut accepted = 0;
        while let Some(observed) = bridge.try_next() {
            if bridge.dispatch(observed, engine, seeking).is_some() {
                accepted += 1;
            }
        }
        accepted
    }

    fn item() -> MediaItem {
        MediaItem::new(Url::parse("https://example.com/a.m3u8").unwrap())
    }

    #[test]
    fn test_player_ready_fires_once() {
        let (mut bridge, engine, recorder) = setup();
        engine.become_ready();
        engine.become_ready();
        drain(&mut bridge, &engine, false);
        assert_eq!(recorder.take(), vec!["player_is_ready"]);
    }

    #[test]
    fn test_next_waits_for_events() {
        let (mut bridge, engine, _recorder) = setup();
        engine.become_ready();
        let observed = tokio_test::block_on(bridge.next()).unwrap();
        assert_eq!(observed.event, PlayerEvent::StatusChanged(Status::Ready));
        assert!(bridge.is_current(observed.handle));
    }

    #[test]
    fn test_buffering_collapses_sources() {
        let (mut bridge, mut engine, recorder) = setup();
        bridge.replace_item(&mut engine, Some(item()));

        engine.buffer_empty();
        engine.buffer_empty();
        engine.emit_item_event(PlayerEvent::BufferEmpty(false));
        engine.likely_to_keep_up();
        engine.buffer_full();
        drain(&mut bridge, &engine, false);

        assert_eq!(recorder.take(), vec!["start_buffering", "end_buffering"]);
        assert!(!bridge.is_buffering());
    }

    #[test]
    fn test_detach_while_buffering_ends_buffering() {
        let (mut bridge, mut engine, recorder) = setup();
        bridge.replace_item(&mut engine, Some(item()));
        engine.buffer_empty();
        drain(&mut bridge, &engine, false);

        bridge.replace_item(&mut engine, None);
        assert_eq!(recorder.take(), vec!["start_buffering", "end_buffering"]);
    }

    #[test]
    fn test_replace_detaches_then_attaches() {
        let (mut bridge, mut engine, _recorder) = setup();
        let first = item();
        let second = item();
        bridge.replace_item(&mut engine, Some(first.clone()));
        engine.clear_calls();

        bridge.replace_item(&mut engine, Some(second.clone()));
        let calls = engine.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[0], EngineCall::RemoveObserver(_)));
        assert_eq!(calls[1], EngineCall::ReplaceItem(Some(second.id)));
        assert!(matches!(calls[2], EngineCall::AddItemObservers(id, _) if id == second.id));
        assert_eq!(bridge.current_item(), Some(second.id));
    }

    #[test]
    fn test_stale_item_events_dropped() {
        let (mut bridge, mut engine, recorder) = setup();
        bridge.replace_item(&mut engine, Some(item()));
        let old_handle = engine.item_observer_handles()[0];

        bridge.replace_item(&mut engine, Some(item()));
        assert!(!bridge.is_current(old_handle));
        engine.deliver_late(old_handle, PlayerEvent::ItemStatusChanged(Status::Ready));
        assert_eq!(drain(&mut bridge, &engine, false), 0);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_item_failure_without_code_is_unknown() {
        let (mut bridge, mut engine, recorder) = setup();
        bridge.replace_item(&mut engine, Some(item()));
        engine.item_failed(EngineFailure::new("AVFoundationErrorDomain", -11800, "failed"));
        drain(&mut bridge, &engine, false);
        assert_eq!(recorder.take(), vec!["item_did_fail:unknown"]);
    }

    #[test]
    fn test_item_status_is_terminal() {
        let (mut bridge, mut engine, recorder) = setup();
        bridge.replace_item(&mut engine, Some(item()));
        engine.item_ready();
        engine.item_failed(EngineFailure::new("x", -1, "late").with_underlying(-12938));
        drain(&mut bridge, &engine, false);
        assert_eq!(recorder.take(), vec!["item_is_ready"]);
        assert_eq!(bridge.item_status(), Status::Ready);
    }

    #[test]
    fn test_ticks_suppressed_while_seeking() {
        let (mut bridge, mut engine, recorder) = setup();
        bridge.replace_item(&mut engine, Some(item()));
        engine.play();
        engine.advance(Duration::from_secs(2));
        drain(&mut bridge, &engine, true);
        assert!(recorder.take().is_empty());

        engine.advance(Duration::from_secs(1));
        drain(&mut bridge, &engine, false);
        assert_eq!(recorder.take(), vec!["time_did_change"]);
    }

    #[test]
    fn test_rendering_changes_only() {
        let (mut bridge, engine, recorder) = setup();
        engine.ready_for_display(true);
        engine.ready_for_display(true);
        engine.ready_for_display(false);
        drain(&mut bridge, &engine, false);
        assert_eq!(recorder.take(), vec!["rendering:true", "rendering:false"]);
    }

    #[test]
    fn test_teardown_order() {
        let (mut bridge, mut engine, _recorder) = setup();
        bridge.replace_item(&mut engine, Some(item()));
        engine.clear_calls();

        bridge.teardown(&mut engine);
        let calls = engine.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[..3].iter().all(|c| matches!(c, EngineCall::RemoveObserver(_))));
        assert_eq!(calls[3], EngineCall::ReplaceItem(None));
        assert_eq!(bridge.registration_count(), 0);
    }
}
