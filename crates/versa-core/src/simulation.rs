//! In-process media engine
//!
//! [`SimulatedEngine`] implements [`MediaEngine`] without decoding anything.
//! It is a cheap clone over shared state, so a test or the CLI can hand one
//! copy to the player and keep another to drive engine-side transitions
//! (status changes, buffering, ticks, key requests) and inspect the calls
//! the player made.

use crate::drm::KeyDeliveryError;
use crate::engine::{
    EventSink, KeyLoadingRequest, MediaEngine, ObserverHandle, PlayerEvent, ResourceLoader, SeekId,
};
use crate::types::{CaptionStyle, EngineFailure, ItemId, ItemProperties, MediaItem, MediaTime, Status};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use url::Url;

/// Error domain used for simulated key failures
pub const KEY_ERROR_DOMAIN: &str = "CoreMediaErrorDomain";

/// A call the player made on the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Play,
    Pause,
    SetRate(f32),
    Seek(MediaTime),
    ReplaceItem(Option<ItemId>),
    AddPlayerObservers(ObserverHandle),
    AddItemObservers(ItemId, ObserverHandle),
    AddPeriodicObserver(ObserverHandle),
    RemoveObserver(ObserverHandle),
    SetResourceLoader(ItemId),
    ApplyCaptionStyle,
}

struct Periodic {
    interval: Duration,
    since_tick: Duration,
    sink: EventSink,
}

#[derive(Default)]
struct SimState {
    status: Status,
    rate: f32,
    time: f64,
    item: Option<MediaItem>,
    properties: ItemProperties,
    player_sinks: Vec<EventSink>,
    item_sinks: Vec<(ItemId, EventSink)>,
    periodic: Vec<Periodic>,
    retired: HashMap<ObserverHandle, EventSink>,
    seeks: VecDeque<SeekId>,
    loaders: HashMap<ItemId, Arc<dyn ResourceLoader>>,
    keys: HashMap<ItemId, Bytes>,
    caption_style: Option<CaptionStyle>,
    calls: Vec<EngineCall>,
}

impl SimState {
    fn current_item_id(&self) -> Option<ItemId> {
        self.item.as_ref().map(|item| item.id)
    }

    /// Known end of the playable range
    fn end_secs(&self) -> Option<f64> {
        let props = &self.properties;
        [props.forward_playback_end_time, props.duration]
            .into_iter()
            .find_map(|t| match t {
                MediaTime::Seconds(end) => Some(end),
                _ => None,
            })
    }

    fn move_by(&mut self, elapsed: Duration) {
        let mut time = self.time + elapsed.as_secs_f64() * self.rate as f64;
        if let Some(end) = self.end_secs() {
            time = time.min(end);
        }
        let start = match self.properties.start_time() {
            MediaTime::Seconds(start) => start,
            _ => 0.0,
        };
        self.time = time.max(start);
    }

    fn emit_player(&self, event: PlayerEvent) {
        for sink in &self.player_sinks {
            sink.send(event.clone());
        }
    }

    fn emit_item(&self, item: ItemId, event: PlayerEvent) {
        for (id, sink) in &self.item_sinks {
            if *id == item {
                sink.send(event.clone());
            }
        }
    }

    fn emit_current_item(&self, event: PlayerEvent) {
        if let Some(id) = self.current_item_id() {
            self.emit_item(id, event);
        }
    }
}

/// Scripted media engine with shared state
#[derive(Clone, Default)]
pub struct SimulatedEngine {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine becomes ready to play
    pub fn become_ready(&self) {
        let mut state = self.state.lock();
        state.status = Status::Ready;
        state.emit_player(PlayerEvent::StatusChanged(Status::Ready));
    }

    /// Engine fails fatally
    pub fn fail(&self, failure: EngineFailure) {
        let mut state = self.state.lock();
        state.status = Status::Failed(failure.clone());
        state.rate = 0.0;
        state.emit_player(PlayerEvent::StatusChanged(Status::Failed(failure)));
    }

    /// Timing and capability properties reported for the current item
    pub fn set_item_properties(&self, properties: ItemProperties) {
        self.state.lock().properties = properties;
    }

    pub fn item_ready(&self) {
        self.emit_item_event(PlayerEvent::ItemStatusChanged(Status::Ready));
    }

    pub fn item_failed(&self, failure: EngineFailure) {
        self.emit_item_event(PlayerEvent::ItemStatusChanged(Status::Failed(failure)));
    }

    pub fn buffer_empty(&self) {
        self.emit_item_event(PlayerEvent::BufferEmpty(true));
    }

    pub fn buffer_full(&self) {
        self.emit_item_event(PlayerEvent::BufferFull(true));
    }

    pub fn likely_to_keep_up(&self) {
        self.emit_item_event(PlayerEvent::LikelyToKeepUp(true));
    }

    /// Deliver any item notification for the current item
    pub fn emit_item_event(&self, event: PlayerEvent) {
        self.state.lock().emit_current_item(event);
    }

    /// Let `elapsed` wall time pass at the current rate, emitting periodic
    /// ticks as their intervals elapse
    pub fn advance(&self, elapsed: Duration) {
        let mut state = self.state.lock();
        let interval = state.periodic.first().map(|p| p.interval).unwrap_or_default();
        if interval.is_zero() {
            state.move_by(elapsed);
            return;
        }

        let mut remaining = elapsed;
        loop {
            let since_tick = state.periodic[0].since_tick;
            let until_tick = interval.saturating_sub(since_tick);
            if remaining < until_tick {
                state.move_by(remaining);
                for p in &mut state.periodic {
                    p.since_tick += remaining;
                }
                break;
            }
            state.move_by(until_tick);
            remaining -= until_tick;
            let tick = PlayerEvent::PeriodicTime(MediaTime::Seconds(state.time));
            for p in &mut state.periodic {
                p.since_tick = Duration::ZERO;
                p.sink.send(tick.clone());
            }
        }
    }

    /// Current item plays through its end
    pub fn play_to_end(&self) {
        let mut state = self.state.lock();
        if let Some(end) = state.end_secs() {
            state.time = end;
        }
        state.rate = 0.0;
        state.emit_current_item(PlayerEvent::PlayedToEnd);
    }

    /// Discontinuous time change
    pub fn jump(&self, to: MediaTime) {
        let mut state = self.state.lock();
        if let MediaTime::Seconds(secs) = to {
            state.time = secs;
        }
        state.emit_current_item(PlayerEvent::TimeJumped);
    }

    /// Report the oldest outstanding seek as finished
    pub fn complete_seek(&self) -> Option<SeekId> {
        let mut state = self.state.lock();
        let id = state.seeks.pop_front()?;
        state.emit_player(PlayerEvent::SeekCompleted(id));
        Some(id)
    }

    pub fn ready_for_display(&self, ready: bool) {
        self.state.lock().emit_player(PlayerEvent::ReadyForDisplay(ready));
    }

    /// Deliver an event through a registration that was already removed,
    /// the way a callback racing with removal would arrive
    pub fn deliver_late(&self, handle: ObserverHandle, event: PlayerEvent) -> bool {
        self.state
            .lock()
            .retired
            .get(&handle)
            .map(|sink| sink.send(event))
            .unwrap_or(false)
    }

    /// Ask the bound resource loader for the current item's content key.
    ///
    /// Returns `None` without a current item or bound loader; otherwise the
    /// loader's answer and a ticket resolving to what it finished with.
    pub fn request_key(&self, url: Option<Url>) -> Option<(bool, KeyTicket)> {
        let (asset, loader) = {
            let state = self.state.lock();
            let asset = state.current_item_id()?;
            let loader = state.loaders.get(&asset)?.clone();
            (asset, loader)
        };

        let (tx, rx) = oneshot::channel();
        let request = SimLoadingRequest {
            asset,
            url,
            state: Arc::clone(&self.state),
            done: Some(tx),
        };
        debug!(asset = %asset, "Requesting content key");
        let waiting = loader.should_wait_for_loading(Box::new(request));
        Some((waiting, KeyTicket { rx }))
    }

    /// Key delivered for `item`, if any
    pub fn delivered_key(&self, item: ItemId) -> Option<Bytes> {
        self.state.lock().keys.get(&item).cloned()
    }

    pub fn current_item(&self) -> Option<ItemId> {
        self.state.lock().current_item_id()
    }

    /// Handles of observers on the current item
    pub fn item_observer_handles(&self) -> Vec<ObserverHandle> {
        self.state
            .lock()
            .item_sinks
            .iter()
            .map(|(_, sink)| sink.handle())
            .collect()
    }

    /// Live observer registrations of every kind
    pub fn observer_count(&self) -> usize {
        let state = self.state.lock();
        state.player_sinks.len() + state.item_sinks.len() + state.periodic.len()
    }

    pub fn has_resource_loader(&self, item: ItemId) -> bool {
        self.state.lock().loaders.contains_key(&item)
    }

    pub fn caption_style(&self) -> Option<CaptionStyle> {
        self.state.lock().caption_style.clone()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

impl MediaEngine for SimulatedEngine {
    fn status(&self) -> Status {
        self.state.lock().status.clone()
    }

    fn play(&mut self) {
        let mut state = self.state.lock();
        state.rate = 1.0;
        state.calls.push(EngineCall::Play);
    }

    fn pause(&mut self) {
        let mut state = self.state.lock();
        state.rate = 0.0;
        state.calls.push(EngineCall::Pause);
    }

    fn rate(&self) -> f32 {
        self.state.lock().rate
    }

    fn set_rate(&mut self, rate: f32) {
        let mut state = self.state.lock();
        state.rate = rate;
        state.calls.push(EngineCall::SetRate(rate));
    }

    fn current_time(&self) -> MediaTime {
        MediaTime::Seconds(self.state.lock().time)
    }

    fn seek(&mut self, to: MediaTime, id: SeekId) {
        let mut state = self.state.lock();
        if let MediaTime::Seconds(secs) = to {
            state.time = secs;
        }
        state.seeks.push_back(id);
        state.calls.push(EngineCall::Seek(to));
    }

    fn replace_current_item(&mut self, item: Option<MediaItem>) {
        let mut state = self.state.lock();
        let id = item.as_ref().map(|item| item.id);
        if let Some(previous) = state.current_item_id().filter(|previous| Some(*previous) != id) {
            if state.loaders.remove(&previous).is_some() {
                trace!(item = %previous, "Released resource loader");
            }
        }
        state.item = item;
        state.time = 0.0;
        state.properties = ItemProperties::default();
        state.calls.push(EngineCall::ReplaceItem(id));
    }

    fn current_item_properties(&self) -> Option<ItemProperties> {
        let state = self.state.lock();
        state.item.as_ref().map(|_| state.properties)
    }

    fn add_player_observers(&mut self, sink: EventSink) {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::AddPlayerObservers(sink.handle()));
        state.player_sinks.push(sink);
    }

    fn add_item_observers(&mut self, item: ItemId, sink: EventSink) {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::AddItemObservers(item, sink.handle()));
        state.item_sinks.push((item, sink));
    }

    fn add_periodic_time_observer(&mut self, interval: Duration, sink: EventSink) {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::AddPeriodicObserver(sink.handle()));
        state.periodic.push(Periodic {
            interval,
            since_tick: Duration::ZERO,
            sink,
        });
    }

    fn remove_observer(&mut self, handle: ObserverHandle) {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::RemoveObserver(handle));

        let mut retired = Vec::new();
        state.player_sinks.retain(|sink| {
            let keep = sink.handle() != handle;
            if !keep {
                retired.push(sink.clone());
            }
            keep
        });
        state.item_sinks.retain(|(_, sink)| {
            let keep = sink.handle() != handle;
            if !keep {
                retired.push(sink.clone());
            }
            keep
        });
        state.periodic.retain(|p| {
            let keep = p.sink.handle() != handle;
            if !keep {
                retired.push(p.sink.clone());
            }
            keep
        });
        for sink in retired {
            state.retired.insert(sink.handle(), sink);
        }
    }

    fn set_resource_loader(&mut self, item: ItemId, loader: Arc<dyn ResourceLoader>) {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::SetResourceLoader(item));
        state.loaders.insert(item, loader);
    }

    fn apply_caption_style(&mut self, style: &CaptionStyle) {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::ApplyCaptionStyle);
        state.caption_style = Some(style.clone());
    }
}

/// Outcome of a simulated key request
pub struct KeyTicket {
    rx: oneshot::Receiver<Result<Bytes, KeyDeliveryError>>,
}

impl KeyTicket {
    /// Wait for the request to finish; `None` if it was never finished
    pub async fn wait(self) -> Option<Result<Bytes, KeyDeliveryError>> {
        self.rx.await.ok()
    }

    /// Outcome if the request already finished
    pub fn try_outcome(&mut self) -> Option<Result<Bytes, KeyDeliveryError>> {
        self.rx.try_recv().ok()
    }
}

struct SimLoadingRequest {
    asset: ItemId,
    url: Option<Url>,
    state: Arc<Mutex<SimState>>,
    done: Option<oneshot::Sender<Result<Bytes, KeyDeliveryError>>>,
}

impl KeyLoadingRequest for SimLoadingRequest {
    fn asset(&self) -> ItemId {
        self.asset
    }

    fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    fn key_request_data(&self, certificate: &[u8], content_id: &[u8]) -> Result<Bytes, String> {
        if certificate.is_empty() {
            return Err("empty application certificate".into());
        }
        if content_id.is_empty() {
            return Err("empty content identifier".into());
        }
        let mut payload = Vec::with_capacity(4 + certificate.len() + content_id.len());
        payload.extend_from_slice(b"SPC:");
        payload.extend_from_slice(content_id);
        payload.push(b':');
        payload.extend_from_slice(certificate);
        Ok(Bytes::from(payload))
    }

    fn finish(mut self: Box<Self>, outcome: Result<Bytes, KeyDeliveryError>) {
        {
            let mut state = self.state.lock();
            match &outcome {
                Ok(key) => {
                    trace!(asset = %self.asset, bytes = key.len(), "Key accepted");
                    state.keys.insert(self.asset, key.clone());
                    state.emit_item(self.asset, PlayerEvent::ItemStatusChanged(Status::Ready));
                }
                Err(e) => {
                    let failure = EngineFailure::new(KEY_ERROR_DOMAIN, e.code(), e.to_string());
                    state.emit_item(self.asset, PlayerEvent::ItemStatusChanged(Status::Failed(failure)));
                }
            }
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Observed;
    use tokio::sync::mpsc;

    fn sink(handle: u64) -> (EventSink, mpsc::UnboundedReceiver<Observed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink::new(ObserverHandle(handle), tx), rx)
    }

    #[test]
    fn test_ticks_follow_interval() {
        let mut engine = SimulatedEngine::new();
        let (tick_sink, mut rx) = sink(1);
        engine.add_periodic_time_observer(Duration::from_secs(1), tick_sink);
        engine.replace_current_item(Some(MediaItem::new(Url::parse("https://example.com/a.m3u8").unwrap())));
        engine.play();

        engine.advance(Duration::from_millis(2500));
        let mut ticks = Vec::new();
        while let Ok(observed) = rx.try_recv() {
            ticks.push(observed.event);
        }
        assert_eq!(
            ticks,
            vec![
                PlayerEvent::PeriodicTime(MediaTime::Seconds(1.0)),
                PlayerEvent::PeriodicTime(MediaTime::Seconds(2.0)),
            ]
        );
        assert_eq!(engine.current_time(), MediaTime::Seconds(2.5));
    }

    #[test]
    fn test_time_clamped_to_duration() {
        let mut engine = SimulatedEngine::new();
        engine.replace_current_item(Some(MediaItem::new(Url::parse("https://example.com/a.m3u8").unwrap())));
        engine.set_item_properties(ItemProperties {
            duration: MediaTime::Seconds(10.0),
            ..Default::default()
        });
        engine.set_rate(2.0);
        engine.advance(Duration::from_secs(8));
        assert_eq!(engine.current_time(), MediaTime::Seconds(10.0));
    }

    #[test]
    fn test_removed_observer_is_retired() {
        let mut engine = SimulatedEngine::new();
        let (player_sink, mut rx) = sink(4);
        engine.add_player_observers(player_sink);
        engine.remove_observer(ObserverHandle(4));

        engine.become_ready();
        assert!(rx.try_recv().is_err());
        assert!(engine.deliver_late(ObserverHandle(4), PlayerEvent::SeekCompleted(SeekId(1))));
        assert_eq!(rx.try_recv().unwrap().event, PlayerEvent::SeekCompleted(SeekId(1)));
        assert_eq!(engine.observer_count(), 0);
    }

    #[test]
    fn test_request_key_without_loader() {
        let mut engine = SimulatedEngine::new();
        assert!(engine.request_key(None).is_none());
        engine.replace_current_item(Some(MediaItem::new(Url::parse("https://example.com/a.m3u8").unwrap())));
        assert!(engine.request_key(None).is_none());
    }

    #[test]
    fn test_seeks_complete_in_order() {
        let mut engine = SimulatedEngine::new();
        let (player_sink, mut rx) = sink(2);
        engine.add_player_observers(player_sink);
        assert_eq!(engine.complete_seek(), None);

        engine.seek(MediaTime::Seconds(3.0), SeekId(1));
        engine.seek(MediaTime::Seconds(7.0), SeekId(2));
        assert_eq!(engine.complete_seek(), Some(SeekId(1)));
        assert_eq!(engine.complete_seek(), Some(SeekId(2)));
        assert_eq!(rx.try_recv().unwrap().event, PlayerEvent::SeekCompleted(SeekId(1)));
        assert_eq!(rx.try_recv().unwrap().event, PlayerEvent::SeekCompleted(SeekId(2)));
    }

    struct NoopLoader;

    impl ResourceLoader for NoopLoader {
        fn should_wait_for_loading(&self, request: Box<dyn KeyLoadingRequest>) -> bool {
            request.finish(Err(KeyDeliveryError::Abandoned));
            false
        }
    }

    #[test]
    fn test_replacement_releases_previous_loader() {
        let mut engine = SimulatedEngine::new();
        let first = MediaItem::new(Url::parse("https://example.com/a.m3u8").unwrap());
        let second = MediaItem::new(Url::parse("https://example.com/b.m3u8").unwrap());
        let (first_id, second_id) = (first.id, second.id);

        engine.set_resource_loader(first_id, Arc::new(NoopLoader));
        engine.replace_current_item(Some(first.clone()));
        engine.replace_current_item(Some(first));
        assert!(engine.has_resource_loader(first_id));

        engine.set_resource_loader(second_id, Arc::new(NoopLoader));
        engine.replace_current_item(Some(second));
        assert!(!engine.has_resource_loader(first_id));
        assert!(engine.has_resource_loader(second_id));
    }

    #[test]
    fn test_payload_rejects_empty_inputs() {
        let request = SimLoadingRequest {
            asset: ItemId::new(),
            url: None,
            state: Arc::default(),
            done: None,
        };
        assert!(request.key_request_data(b"", b"id").is_err());
        assert!(request.key_request_data(b"cert", b"").is_err());
        assert_eq!(
            request.key_request_data(b"cert", b"id").unwrap(),
            Bytes::from_static(b"SPC:id:cert")
        );
    }
}
