//! CLI command implementations

use crate::output::{format_record, format_rows};
use anyhow::{anyhow, bail, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tabled::Tabled;
use tracing::info;
use url::Url;
use versa_core::{
    DecryptionInfo, EngineFailure, ItemProperties, MediaItem, MediaTime, PlaybackDelegate, PlaybackErrorCode,
    PlayerConfig, SimulatedEngine, VersaPlayer, KNOWN_CODES,
};

// =============================================================================
// Classify
// =============================================================================

#[derive(Serialize, Tabled)]
struct ClassificationRow {
    code: i64,
    classification: String,
}

/// Classify engine error codes
pub fn classify(codes: &[i64], all: bool, format: &str) -> anyhow::Result<()> {
    let rows: Vec<ClassificationRow> = if all {
        KNOWN_CODES
            .iter()
            .map(|(code, class)| ClassificationRow {
                code: *code,
                classification: class.to_string(),
            })
            .collect()
    } else {
        if codes.is_empty() {
            bail!("no error codes given; pass one or more codes or --all");
        }
        codes
            .iter()
            .map(|code| ClassificationRow {
                code: *code,
                classification: PlaybackErrorCode::classify(*code).to_string(),
            })
            .collect()
    };

    println!("{}", format_rows(&rows, format));
    Ok(())
}

// =============================================================================
// Resolve key
// =============================================================================

/// Inputs of a key delivery check
pub struct KeyCheck {
    pub content_id: String,
    pub certificate: String,
    pub license_server: String,
    pub headers: Vec<String>,
    pub key_url: Option<String>,
}

#[derive(Serialize)]
struct KeyReport {
    content_id: String,
    item: String,
    status: &'static str,
    key_bytes: Option<usize>,
    key_base64: Option<String>,
    error: Option<String>,
    error_code: Option<i64>,
}

/// Accept either a URL or a local filesystem path
fn parse_locator(raw: &str) -> anyhow::Result<Url> {
    if let Ok(url) = Url::parse(raw) {
        if url.scheme().len() > 1 {
            return Ok(url);
        }
    }
    let path = Path::new(raw)
        .canonicalize()
        .with_context(|| format!("certificate not found: {}", raw))?;
    Url::from_file_path(&path).map_err(|_| anyhow!("not an absolute path: {}", path.display()))
}

fn parse_header(raw: &str) -> anyhow::Result<(&str, &str)> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| anyhow!("invalid header '{}', expected KEY=VALUE", raw))
}

/// Run one key request for an encrypted item through the player
pub async fn resolve_key(check: KeyCheck, mut config: PlayerConfig, format: &str) -> anyhow::Result<()> {
    for header in &check.headers {
        let (key, value) = parse_header(header)?;
        config = config.with_license_header(key, value);
    }

    let certificate_url = parse_locator(&check.certificate)?;
    let license_url = Url::parse(&check.license_server).context("invalid license server URL")?;
    let key_url = match &check.key_url {
        Some(raw) => Url::parse(raw).context("invalid key URL")?,
        None => Url::parse(&format!("skd://{}", check.content_id))?,
    };

    let engine = SimulatedEngine::new();
    let mut player = VersaPlayer::new(engine.clone(), PlayerConfig { autoplay: false, ..config })?;

    let info = DecryptionInfo::new(check.content_id.clone(), certificate_url, license_url);
    let item = MediaItem::encrypted(key_url.clone(), info);
    let item_id = item.id;
    player.set_item(Some(item));

    info!(content_id = %check.content_id, key_url = %key_url, "Requesting content key");
    let (_, ticket) = engine
        .request_key(Some(key_url))
        .ok_or_else(|| anyhow!("no key loader bound for the item"))?;
    let outcome = ticket
        .wait()
        .await
        .ok_or_else(|| anyhow!("key request was never finished"))?;
    player.pump();

    let report = match &outcome {
        Ok(key) => KeyReport {
            content_id: check.content_id.clone(),
            item: item_id.to_string(),
            status: "delivered",
            key_bytes: Some(key.len()),
            key_base64: Some(STANDARD.encode(key)),
            error: None,
            error_code: None,
        },
        Err(e) => KeyReport {
            content_id: check.content_id.clone(),
            item: item_id.to_string(),
            status: "failed",
            key_bytes: None,
            key_base64: None,
            error: Some(e.to_string()),
            error_code: Some(e.code()),
        },
    };
    println!("{}", format_record(&report, format));

    if let Err(e) = outcome {
        bail!("key delivery failed at {}: {}", e.stage(), e);
    }
    Ok(())
}

// =============================================================================
// Simulate
// =============================================================================

/// Scripted playback session
pub struct Script {
    pub duration: u64,
    pub stall_at: Option<u64>,
    pub fail_code: Option<i64>,
    pub seek_to: Option<f64>,
}

#[derive(Serialize, Tabled)]
struct CallbackRow {
    seq: usize,
    callback: String,
    detail: String,
}

/// Delegate that logs and records every callback
#[derive(Default)]
struct LoggingDelegate {
    rows: Mutex<Vec<CallbackRow>>,
}

impl LoggingDelegate {
    fn record(&self, callback: &str, detail: String) {
        info!(callback, detail = %detail, "Delegate callback");
        let mut rows = self.rows.lock();
        let seq = rows.len() + 1;
        rows.push(CallbackRow {
            seq,
            callback: callback.to_string(),
            detail,
        });
    }

    fn take(&self) -> Vec<CallbackRow> {
        std::mem::take(&mut *self.rows.lock())
    }
}

impl PlaybackDelegate for LoggingDelegate {
    fn did_begin(&self) {
        self.record("did_begin", String::new());
    }
    fn will_pause(&self) {
        self.record("will_pause", String::new());
    }
    fn did_pause(&self) {
        self.record("did_pause", String::new());
    }
    fn did_end(&self) {
        self.record("did_end", String::new());
    }
    fn did_jump(&self) {
        self.record("did_jump", String::new());
    }
    fn time_did_change(&self, time: MediaTime) {
        self.record("time_did_change", time.to_string());
    }
    fn start_buffering(&self) {
        self.record("start_buffering", String::new());
    }
    fn end_buffering(&self) {
        self.record("end_buffering", String::new());
    }
    fn player_is_ready(&self) {
        self.record("player_is_ready", String::new());
    }
    fn item_is_ready(&self) {
        self.record("item_is_ready", String::new());
    }
    fn player_did_fail(&self, error: &EngineFailure) {
        self.record("player_did_fail", error.to_string());
    }
    fn item_did_fail(&self, error: PlaybackErrorCode) {
        self.record("item_did_fail", error.to_string());
    }
    fn rendering_availability_changed(&self, is_ready: bool) {
        self.record("rendering_availability_changed", is_ready.to_string());
    }
}

/// Drive a simulated engine through a playback session and print the
/// delegate callbacks it produced
pub async fn simulate(script: Script, config: PlayerConfig, format: &str) -> anyhow::Result<()> {
    if script.duration == 0 {
        bail!("duration must be at least one second");
    }

    let engine = SimulatedEngine::new();
    let mut player = VersaPlayer::new(engine.clone(), config)?;
    let delegate = Arc::new(LoggingDelegate::default());
    player.add_delegate(delegate.clone());

    engine.become_ready();
    engine.ready_for_display(true);
    player.pump();

    let item = MediaItem::new(Url::parse("https://cdn.example.com/simulated/master.m3u8")?)
        .with_title("Simulated item");
    player.set_item(Some(item));
    engine.set_item_properties(ItemProperties {
        duration: MediaTime::Seconds(script.duration as f64),
        can_play_fast_forward: true,
        can_play_fast_reverse: true,
        ..Default::default()
    });
    engine.item_ready();
    player.pump();

    let fail_at = script.fail_code.map(|_| script.duration / 2);
    let mut second = 0;
    let mut failed = false;

    while second < script.duration {
        engine.advance(Duration::from_secs(1));
        second += 1;

        if second == 1 {
            if let Some(target) = script.seek_to {
                player.seek(MediaTime::from_secs(target));
                engine.complete_seek();
            }
        }
        if script.stall_at == Some(second) {
            engine.buffer_empty();
            player.pump();
            engine.likely_to_keep_up();
        }
        if let (Some(at), Some(code)) = (fail_at, script.fail_code) {
            if second >= at {
                engine.item_failed(
                    EngineFailure::new("AVFoundationErrorDomain", -11800, "simulated failure").with_underlying(code),
                );
                player.pump();
                failed = true;
                break;
            }
        }
        player.pump();
    }

    if !failed {
        engine.play_to_end();
        player.pump();
    }

    let rows = delegate.take();
    println!("{}", format_rows(&rows, format));

    let snapshot = player.snapshot();
    info!(
        playing = snapshot.is_playing,
        position = %snapshot.timeline.current,
        callbacks = rows.len(),
        "Simulation finished"
    );
    Ok(())
}
