//! Core types for Versa Core

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Unique identifier for a player session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a media item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point on the media timeline.
///
/// Mirrors the three shapes a native engine reports: a concrete time, an
/// indefinite time (live streams, unknown duration) and an invalid time
/// (property not set).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaTime {
    Invalid,
    Indefinite,
    Seconds(f64),
}

impl MediaTime {
    pub const ZERO: MediaTime = MediaTime::Seconds(0.0);

    /// Build a time from seconds; NaN is invalid, infinities are indefinite
    pub fn from_secs(seconds: f64) -> Self {
        if seconds.is_nan() {
            MediaTime::Invalid
        } else if seconds.is_infinite() {
            MediaTime::Indefinite
        } else {
            MediaTime::Seconds(seconds)
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, MediaTime::Invalid)
    }

    pub fn is_indefinite(&self) -> bool {
        matches!(self, MediaTime::Indefinite)
    }

    /// Valid and finite
    pub fn is_numeric(&self) -> bool {
        matches!(self, MediaTime::Seconds(_))
    }

    /// Seconds value; NaN when invalid and +inf when indefinite
    pub fn seconds(&self) -> f64 {
        match self {
            MediaTime::Invalid => f64::NAN,
            MediaTime::Indefinite => f64::INFINITY,
            MediaTime::Seconds(s) => *s,
        }
    }

    /// Offset a numeric time; non-numeric times are returned unchanged
    pub fn offset_by(self, delta_secs: f64) -> Self {
        match self {
            MediaTime::Seconds(s) => MediaTime::from_secs(s + delta_secs),
            other => other,
        }
    }

    /// Clamp into `[start, end]`, ignoring bounds that are not numeric
    pub fn clamp_to(self, start: MediaTime, end: MediaTime) -> Self {
        let MediaTime::Seconds(mut s) = self else {
            return self;
        };
        if let MediaTime::Seconds(end) = end {
            s = s.min(end);
        }
        if let MediaTime::Seconds(start) = start {
            s = s.max(start);
        }
        MediaTime::Seconds(s)
    }
}

impl Default for MediaTime {
    fn default() -> Self {
        MediaTime::Invalid
    }
}

impl From<Duration> for MediaTime {
    fn from(d: Duration) -> Self {
        MediaTime::Seconds(d.as_secs_f64())
    }
}

impl std::fmt::Display for MediaTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaTime::Invalid => write!(f, "invalid"),
            MediaTime::Indefinite => write!(f, "indefinite"),
            MediaTime::Seconds(s) => {
                let total = s.max(0.0) as u64;
                write!(f, "{:02}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
            }
        }
    }
}

/// Decryption metadata attached to an encrypted item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionInfo {
    /// Content identifier, sent to the engine as UTF-8 bytes
    pub content_id: String,
    /// Locator of the application certificate (file:// or http(s)://)
    pub certificate_url: Url,
    /// License (key) server endpoint
    pub license_server_url: Url,
}

impl DecryptionInfo {
    pub fn new(content_id: impl Into<String>, certificate_url: Url, license_server_url: Url) -> Self {
        Self {
            content_id: content_id.into(),
            certificate_url,
            license_server_url,
        }
    }
}

/// One playable asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    /// Unique identifier
    pub id: ItemId,
    /// Source locator
    pub url: Url,
    /// Decryption metadata, present only for encrypted assets
    pub decryption: Option<DecryptionInfo>,
    /// Optional display title
    pub title: Option<String>,
}

impl MediaItem {
    /// Create a plain (unencrypted) item
    pub fn new(url: Url) -> Self {
        Self {
            id: ItemId::new(),
            url,
            decryption: None,
            title: None,
        }
    }

    /// Create an encrypted item
    pub fn encrypted(url: Url, decryption: DecryptionInfo) -> Self {
        Self {
            decryption: Some(decryption),
            ..Self::new(url)
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.decryption.is_some()
    }
}

/// Failure reported by the engine, for itself or for an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineFailure {
    /// Error domain reported by the engine
    pub domain: String,
    /// Top-level error code
    pub code: i64,
    /// Underlying error code, used for item classification
    pub underlying_code: Option<i64>,
    /// Human-readable message
    pub message: String,
}

impl EngineFailure {
    pub fn new(domain: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            code,
            underlying_code: None,
            message: message.into(),
        }
    }

    pub fn with_underlying(mut self, code: i64) -> Self {
        self.underlying_code = Some(code);
        self
    }
}

impl std::fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.domain, self.code, self.message)?;
        if let Some(code) = self.underlying_code {
            write!(f, " [underlying {}]", code)?;
        }
        Ok(())
    }
}

/// Three-valued status shared by the engine and its items
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Status {
    Unknown,
    Ready,
    Failed(EngineFailure),
}

impl Status {
    /// Ready and failed are terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Unknown)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Status::Failed(_))
    }

    /// Check if transition to target status is valid
    pub fn can_transition_to(&self, target: &Status) -> bool {
        matches!((self, target), (Status::Unknown, Status::Ready) | (Status::Unknown, Status::Failed(_)))
    }

    /// Move to `target`, rejecting transitions out of a terminal status
    pub fn advance(&mut self, target: Status) -> Result<()> {
        if matches!((&*self, &target), (Status::Unknown, Status::Unknown)) {
            return Ok(());
        }
        if !self.can_transition_to(&target) {
            return Err(Error::InvalidStatusTransition {
                from: self.to_string(),
                to: target.to_string(),
            });
        }
        *self = target;
        Ok(())
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Unknown
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Unknown => write!(f, "unknown"),
            Status::Ready => write!(f, "ready"),
            Status::Failed(_) => write!(f, "failed"),
        }
    }
}

/// Timing and capability properties of the engine's current item
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ItemProperties {
    /// Total duration; indefinite for live content
    pub duration: MediaTime,
    /// Explicit end boundary for forward playback
    pub forward_playback_end_time: MediaTime,
    /// Explicit end boundary for reverse playback (the start of the playable range)
    pub reverse_playback_end_time: MediaTime,
    /// Rates above 1 are supported
    pub can_play_fast_forward: bool,
    /// Negative rates are supported
    pub can_play_fast_reverse: bool,
}

impl Default for ItemProperties {
    fn default() -> Self {
        Self {
            duration: MediaTime::Invalid,
            forward_playback_end_time: MediaTime::Invalid,
            reverse_playback_end_time: MediaTime::Invalid,
            can_play_fast_forward: false,
            can_play_fast_reverse: false,
        }
    }
}

impl ItemProperties {
    /// Start of the playable range: the reverse boundary when valid, else zero
    pub fn start_time(&self) -> MediaTime {
        if self.reverse_playback_end_time.is_valid() {
            self.reverse_playback_end_time
        } else {
            MediaTime::ZERO
        }
    }

    /// End of the playable range: forward boundary, else finite duration,
    /// else the current position
    pub fn end_time(&self, current: MediaTime) -> MediaTime {
        if self.forward_playback_end_time.is_valid() {
            self.forward_playback_end_time
        } else if self.duration.is_valid() && !self.duration.is_indefinite() {
            self.duration
        } else {
            current
        }
    }
}

/// Current position together with the playable range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub current: MediaTime,
    pub start: MediaTime,
    pub end: MediaTime,
}

impl Timeline {
    /// Timeline for an engine with no current item
    pub fn empty() -> Self {
        Self {
            current: MediaTime::ZERO,
            start: MediaTime::ZERO,
            end: MediaTime::ZERO,
        }
    }

    /// Progress in `[0, 1]` when the range is numeric and non-empty
    pub fn progress(&self) -> Option<f64> {
        let (start, end, current) = (self.start.seconds(), self.end.seconds(), self.current.seconds());
        if !(start.is_finite() && end.is_finite() && current.is_finite()) || end <= start {
            return None;
        }
        Some(((current - start) / (end - start)).clamp(0.0, 1.0))
    }
}

/// Caption edge treatment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptionEdge {
    None,
    DropShadow,
    Raised,
    Depressed,
    Uniform,
}

/// Caption text styling forwarded to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionStyle {
    /// Relative font size (1.0 = engine default)
    pub font_scale: f32,
    /// Foreground colour as #RRGGBB or #RRGGBBAA
    pub foreground: String,
    /// Background colour as #RRGGBB or #RRGGBBAA
    pub background: String,
    pub edge: CaptionEdge,
}

impl Default for CaptionStyle {
    fn default() -> Self {
        Self {
            font_scale: 1.0,
            foreground: "#FFFFFF".to_string(),
            background: "#000000BF".to_string(),
            edge: CaptionEdge::None,
        }
    }
}

/// Point-in-time view of the player, published on every change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub item: Option<ItemId>,
    pub item_status: Status,
    pub player_status: Status,
    pub is_playing: bool,
    pub is_seeking: bool,
    pub is_buffering: bool,
    pub is_fullscreen: bool,
    pub is_pip: bool,
    pub rate: f32,
    pub timeline: Timeline,
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            item: None,
            item_status: Status::Unknown,
            player_status: Status::Unknown,
            is_playing: false,
            is_seeking: false,
            is_buffering: false,
            is_fullscreen: false,
            is_pip: false,
            rate: 0.0,
            timeline: Timeline::empty(),
        }
    }
}

/// Player configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Start playback as soon as an item is set
    pub autoplay: bool,
    /// Skip forward/backward step in seconds
    pub skip_interval_secs: f64,
    /// Periodic time observer cadence in milliseconds
    pub time_observer_interval_ms: u64,
    /// Rate used by the fast-forward toggle
    pub fast_forward_rate: f32,
    /// Rate used by the rewind toggle
    pub rewind_rate: f32,
    /// Extra headers sent with license requests
    pub license_headers: HashMap<String, String>,
    /// Content type of the license request body
    pub license_content_type: String,
    /// Optional HTTP timeout for certificate and license requests
    pub request_timeout_ms: Option<u64>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            autoplay: true,
            skip_interval_secs: 30.0,
            time_observer_interval_ms: 1000,
            fast_forward_rate: 2.0,
            rewind_rate: -1.0,
            license_headers: HashMap::new(),
            license_content_type: "application/octet-stream".to_string(),
            request_timeout_ms: None,
        }
    }
}

impl PlayerConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PlayerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Add a custom header for license requests
    pub fn with_license_header(mut self, key: &str, value: &str) -> Self {
        self.license_headers.insert(key.to_string(), value.to_string());
        self
    }

    /// Periodic time observer cadence
    pub fn time_observer_interval(&self) -> Duration {
        Duration::from_millis(self.time_observer_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.skip_interval_secs.is_finite() && self.skip_interval_secs > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "skip_interval_secs must be positive, got {}",
                self.skip_interval_secs
            )));
        }
        if self.time_observer_interval_ms == 0 {
            return Err(Error::InvalidConfig("time_observer_interval_ms must be non-zero".into()));
        }
        if self.fast_forward_rate <= 1.0 {
            return Err(Error::InvalidConfig(format!(
                "fast_forward_rate must exceed 1.0, got {}",
                self.fast_forward_rate
            )));
        }
        if self.rewind_rate >= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "rewind_rate must be negative, got {}",
                self.rewind_rate
            )));
        }
        Ok(())
    }
}
