//! Versa Core - playback core for the Versa video player
//!
//! This crate sits between a native media engine and the host application:
//! - Engine status and item observation, translated into delegate callbacks
//! - Buffering, readiness and failure signals with stale-callback protection
//! - FairPlay-style content key delivery against a license server
//! - Classification of engine error codes
//! - A transport facade (play, pause, seek, skip, rate toggles)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Versa Core                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │   host ──▶ ┌─────────────┐ ──▶ ┌──────────────┐                 │
//! │            │ VersaPlayer │     │ MediaEngine  │ (native)        │
//! │   host ◀── │   facade    │ ◀── │  callbacks   │                 │
//! │            └──────┬──────┘     └──────┬───────┘                 │
//! │                   │                   │ key requests            │
//! │            ┌──────┴──────┐     ┌──────┴───────┐                 │
//! │            │   Status    │     │ Key Delivery │ ──▶ license     │
//! │            │   Bridge    │     │   Resolver   │     server      │
//! │            └──────┬──────┘     └──────────────┘                 │
//! │                   │                                             │
//! │            ┌──────┴──────┐     ┌──────────────┐                 │
//! │            │  Delegates  │ ◀── │    Error     │                 │
//! │            │  + Overlay  │     │  Classifier  │                 │
//! │            └─────────────┘     └──────────────┘                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod classifier;
pub mod engine;
pub mod delegate;
pub mod drm;
pub mod bridge;
pub mod player;
pub mod simulation;

pub use error::{Error, Result};
pub use types::*;
pub use classifier::{PlaybackErrorCode, KNOWN_CODES};
pub use engine::{
    EventSink, KeyLoadingRequest, MediaEngine, Observed, ObserverHandle, ObserverTarget, PlayerEvent,
    ResourceLoader, SeekId,
};
pub use delegate::{ControlsDelegate, DelegateId, DelegateRegistry, FailureReason, PlaybackDelegate};
pub use drm::{
    CertificateSource, DefaultCertificateSource, HttpLicenseTransport, KeyDeliveryError, KeyDeliveryResolver,
    KeyLoaderHook, KeyRequest, KeyRequestState, LicenseResponse, LicenseTransport, StaticCertificate,
};
pub use bridge::StatusBridge;
pub use player::VersaPlayer;
pub use simulation::{EngineCall, KeyTicket, SimulatedEngine};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the player library with default configuration
pub fn init() {
    tracing::info!(version = VERSION, "Versa Core initialized");
}
