//! Playback snapshots, track identity and per-player watch state

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::ObservedAt;
use crate::types::Milliseconds;

/// Stable identifier of a player (e.g. an MPRIS bus name or a speaker UID).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PlayerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Transport state reported by a player.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Playing,
    Paused,
    Stopped,
    #[default]
    Other,
}

impl TransportState {
    /// Parse a player-reported status string.
    ///
    /// Accepts UPnP (`PLAYING`, `PAUSED_PLAYBACK`, `STOPPED`) and MPRIS
    /// (`Playing`, `Paused`, `Stopped`) spellings.
    #[must_use]
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "PLAYING" => Self::Playing,
            "PAUSED" | "PAUSED_PLAYBACK" => Self::Paused,
            "STOPPED" => Self::Stopped,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// One poll result for one player.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSnapshot {
    pub player_id: PlayerId,
    /// Human-readable player name, if the player reports one.
    pub player_name: Option<String>,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
    /// Total length in seconds. Zero, negative or non-finite means unknown.
    pub duration_seconds: f64,
    /// Elapsed position in seconds as reported by the player.
    pub position_seconds: f64,
    pub transport_state: TransportState,
    pub observed_at: ObservedAt,
}

impl PlaybackSnapshot {
    /// Snapshot with no track and `Other` transport state.
    #[must_use]
    pub fn empty(player_id: PlayerId, observed_at: ObservedAt) -> Self {
        Self {
            player_id,
            player_name: None,
            artist: None,
            title: None,
            album: None,
            duration_seconds: 0.0,
            position_seconds: 0.0,
            transport_state: TransportState::Other,
            observed_at,
        }
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.transport_state == TransportState::Playing
    }

    /// Identity of the playing track, if both artist and title are present.
    #[must_use]
    pub fn track_key(&self) -> Option<TrackKey> {
        TrackKey::from_parts(self.artist.as_deref()?, self.title.as_deref()?)
    }

    /// Track length when it is usable for the percentage threshold.
    #[must_use]
    pub fn known_duration(&self) -> Option<f64> {
        (self.duration_seconds.is_finite() && self.duration_seconds > 0.0)
            .then_some(self.duration_seconds)
    }

    /// Position clamped into `[0, duration]`.
    #[must_use]
    pub fn clamped_position(&self) -> f64 {
        if !self.position_seconds.is_finite() || self.position_seconds < 0.0 {
            return 0.0;
        }
        self.known_duration()
            .map_or(self.position_seconds, |d| self.position_seconds.min(d))
    }

    /// Name for log lines: player name when known, else the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.player_name
            .as_deref()
            .unwrap_or_else(|| self.player_id.as_str())
    }
}

/// Track identity used for duplicate detection: normalized artist and title.
///
/// Album is deliberately not part of identity. Deserializing goes through
/// [`TrackKey::from_parts`], so keys read from disk match live keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTrackKey")]
pub struct TrackKey {
    artist: String,
    title: String,
}

impl TrackKey {
    /// Build a key from raw strings.
    ///
    /// Returns `None` when either part is blank.
    #[must_use]
    pub fn from_parts(artist: &str, title: &str) -> Option<Self> {
        let artist = normalize(artist);
        let title = normalize(title);
        if artist.is_empty() || title.is_empty() {
            return None;
        }
        Some(Self { artist, title })
    }
}

/// On-disk shape of a [`TrackKey`], before normalization.
#[derive(Deserialize)]
struct RawTrackKey {
    artist: String,
    title: String,
}

impl TryFrom<RawTrackKey> for TrackKey {
    type Error = String;

    fn try_from(raw: RawTrackKey) -> Result<Self, Self::Error> {
        Self::from_parts(&raw.artist, &raw.title)
            .ok_or_else(|| format!("blank track key: {:?} - {:?}", raw.artist, raw.title))
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.artist, self.title)
    }
}

/// Trim, collapse inner whitespace and lower-case.
fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Watch state for one player
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerTrackState {
    /// Track currently being watched.
    pub current_track: Option<TrackKey>,

    /// Playing time accrued for `current_track` in this watch segment.
    pub watched: Milliseconds,

    /// Set once this watch segment has been scrobbled (or suppressed).
    pub scrobbled_this_play: bool,

    /// When the watch segment started (wall clock).
    pub started_at: Option<DateTime<Utc>>,

    /// Monotonic time of the last Playing snapshot. Process-local, never persisted.
    pub last_observed: Option<Duration>,

    /// Most recent scrobble time per track.
    pub recent_scrobbles: BTreeMap<TrackKey, DateTime<Utc>>,
}

impl PlayerTrackState {
    /// Create a new empty state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last time `key` was scrobbled from this player.
    #[must_use]
    pub fn last_scrobble_time(&self, key: &TrackKey) -> Option<DateTime<Utc>> {
        self.recent_scrobbles.get(key).copied()
    }

    /// Drop scrobble records older than `window` relative to `now`.
    pub fn prune_recent(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        self.recent_scrobbles.retain(|_, at| now - *at < window);
    }

    /// Whether `other` differs in anything that must survive a restart
    /// immediately (track change or scrobble bookkeeping).
    #[must_use]
    pub fn differs_durably(&self, other: &Self) -> bool {
        self.current_track != other.current_track
            || self.scrobbled_this_play != other.scrobbled_this_play
            || self.recent_scrobbles != other.recent_scrobbles
    }
}

/// A decided scrobble, handed to every configured sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrobbleEvent {
    /// Unique per emission; sinks may use it for idempotence.
    pub id: Uuid,
    pub player_id: PlayerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_name: Option<String>,
    pub artist: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    pub watched: Milliseconds,
    pub started_at: DateTime<Utc>,
    pub scrobbled_at: DateTime<Utc>,
}
