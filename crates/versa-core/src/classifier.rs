//! Playback error classification
//!
//! Maps the numeric codes carried by an engine item failure onto a closed
//! set of reasons the host can act on. The table covers the streaming and
//! URL-loading codes the native media framework reports; anything else is
//! `Unknown`.

use crate::types::EngineFailure;
use serde::{Deserialize, Serialize};

/// Reason an item failed to play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackErrorCode {
    AuthenticationError,
    Unauthorized,
    Forbidden,
    NotFound,
    Unavailable,
    MediaFileError,
    BandwidthExceeded,
    PlaylistUnchanged,
    DecoderMalfunction,
    DecoderTemporarilyUnavailable,
    WrongHostIp,
    WrongHostDns,
    BadUrl,
    InvalidRequest,
    Unknown,
}

/// Every known engine code with its classification
pub const KNOWN_CODES: [(i64, PlaybackErrorCode); 15] = [
    (-12937, PlaybackErrorCode::AuthenticationError),
    (-16840, PlaybackErrorCode::Unauthorized),
    (-12660, PlaybackErrorCode::Forbidden),
    (-12938, PlaybackErrorCode::NotFound),
    (-12661, PlaybackErrorCode::Unavailable),
    (-12645, PlaybackErrorCode::MediaFileError),
    (-12889, PlaybackErrorCode::MediaFileError),
    (-12318, PlaybackErrorCode::BandwidthExceeded),
    (-12642, PlaybackErrorCode::PlaylistUnchanged),
    (-12911, PlaybackErrorCode::DecoderMalfunction),
    (-12913, PlaybackErrorCode::DecoderTemporarilyUnavailable),
    (-1004, PlaybackErrorCode::WrongHostIp),
    (-1003, PlaybackErrorCode::WrongHostDns),
    (-1000, PlaybackErrorCode::BadUrl),
    (-1202, PlaybackErrorCode::InvalidRequest),
];

impl PlaybackErrorCode {
    /// Classify an underlying engine error code
    pub fn classify(code: i64) -> Self {
        match code {
            -12937 => PlaybackErrorCode::AuthenticationError,
            -16840 => PlaybackErrorCode::Unauthorized,
            -12660 => PlaybackErrorCode::Forbidden,
            -12938 => PlaybackErrorCode::NotFound,
            -12661 => PlaybackErrorCode::Unavailable,
            -12645 | -12889 => PlaybackErrorCode::MediaFileError,
            -12318 => PlaybackErrorCode::BandwidthExceeded,
            -12642 => PlaybackErrorCode::PlaylistUnchanged,
            -12911 => PlaybackErrorCode::DecoderMalfunction,
            -12913 => PlaybackErrorCode::DecoderTemporarilyUnavailable,
            -1004 => PlaybackErrorCode::WrongHostIp,
            -1003 => PlaybackErrorCode::WrongHostDns,
            -1000 => PlaybackErrorCode::BadUrl,
            -1202 => PlaybackErrorCode::InvalidRequest,
            _ => PlaybackErrorCode::Unknown,
        }
    }

    /// Classify an item failure by its underlying code; failures without
    /// one are `Unknown`
    pub fn from_failure(failure: &EngineFailure) -> Self {
        failure
            .underlying_code
            .map(Self::classify)
            .unwrap_or(PlaybackErrorCode::Unknown)
    }

    /// Stable snake-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackErrorCode::AuthenticationError => "authentication_error",
            PlaybackErrorCode::Unauthorized => "unauthorized",
            PlaybackErrorCode::Forbidden => "forbidden",
            PlaybackErrorCode::NotFound => "not_found",
            PlaybackErrorCode::Unavailable => "unavailable",
            PlaybackErrorCode::MediaFileError => "media_file_error",
            PlaybackErrorCode::BandwidthExceeded => "bandwidth_exceeded",
            PlaybackErrorCode::PlaylistUnchanged => "playlist_unchanged",
            PlaybackErrorCode::DecoderMalfunction => "decoder_malfunction",
            PlaybackErrorCode::DecoderTemporarilyUnavailable => "decoder_temporarily_unavailable",
            PlaybackErrorCode::WrongHostIp => "wrong_host_ip",
            PlaybackErrorCode::WrongHostDns => "wrong_host_dns",
            PlaybackErrorCode::BadUrl => "bad_url",
            PlaybackErrorCode::InvalidRequest => "invalid_request",
            PlaybackErrorCode::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for PlaybackErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
