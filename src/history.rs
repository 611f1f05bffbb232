//! Durable per-player scrobble history
//!
//! One pretty-printed JSON document holds, for every player, the current
//! watch and the recent scrobble times per track. The document is rewritten
//! atomically (temp file, fsync, rename) on every durable `put`, so a crash
//! right after `put` returns still observes the written state on reload.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::track::{PlayerId, PlayerTrackState, TrackKey};
use crate::types::Milliseconds;

/// On-disk format version.
const FORMAT_VERSION: u32 = 1;

/// Write attempts before a persistence error is surfaced.
const WRITE_ATTEMPTS: u32 = 3;

/// Backoff step between write attempts.
const WRITE_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// On-disk records
// ============================================================================

/// The whole history file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    version: u32,
    #[serde(default)]
    players: BTreeMap<PlayerId, PlayerRecord>,
}

/// Both records kept for one player.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PlayerRecord {
    #[serde(default)]
    current: CurrentWatch,
    #[serde(default)]
    recent_scrobbles: Vec<RecentScrobble>,
}

/// The in-progress watch segment.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CurrentWatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    track: Option<TrackKey>,
    #[serde(default)]
    watched_ms: Milliseconds,
    #[serde(default)]
    scrobbled_this_play: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecentScrobble {
    #[serde(flatten)]
    track: TrackKey,
    scrobbled_at: DateTime<Utc>,
}

impl From<&PlayerTrackState> for PlayerRecord {
    fn from(state: &PlayerTrackState) -> Self {
        Self {
            current: CurrentWatch {
                track: state.current_track.clone(),
                watched_ms: state.watched,
                scrobbled_this_play: state.scrobbled_this_play,
                started_at: state.started_at,
            },
            recent_scrobbles: state
                .recent_scrobbles
                .iter()
                .map(|(track, at)| RecentScrobble {
                    track: track.clone(),
                    scrobbled_at: *at,
                })
                .collect(),
        }
    }
}

impl From<PlayerRecord> for PlayerTrackState {
    fn from(record: PlayerRecord) -> Self {
        let mut recent_scrobbles = BTreeMap::new();
        for entry in record.recent_scrobbles {
            // Keep the newest if a hand-edited file lists a track twice.
            let slot = recent_scrobbles
                .entry(entry.track)
                .or_insert(entry.scrobbled_at);
            if entry.scrobbled_at > *slot {
                *slot = entry.scrobbled_at;
            }
        }

        Self {
            current_track: record.current.track,
            watched: record.current.watched_ms.max(Milliseconds::ZERO),
            scrobbled_this_play: record.current.scrobbled_this_play,
            started_at: record.current.started_at,
            last_observed: None,
            recent_scrobbles,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Per-player history, shared by handle.
///
/// All mutations go through one async mutex, so writes to the file are
/// serialized and entries for different players never interfere.
#[derive(Clone)]
pub struct HistoryStore {
    path: Option<PathBuf>,
    players: Arc<Mutex<BTreeMap<PlayerId, PlayerTrackState>>>,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl HistoryStore {
    /// Open a file-backed store, loading existing history if present.
    ///
    /// # Errors
    /// `Persistence` if the file exists but can't be read or parsed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            path: Some(path.into()),
            players: Arc::new(Mutex::new(BTreeMap::new())),
        };
        store.load().await?;
        Ok(store)
    }

    /// Store without a backing file. Used in tests and dry runs.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            players: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replace in-memory state with what is on disk.
    ///
    /// A missing file is an empty history.
    pub async fn load(&self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        let loaded = tokio::task::spawn_blocking(move || read_file(&path))
            .await
            .map_err(|e| Error::persistence(format!("history load task failed: {e}")))??;

        let count = loaded.len();
        *self.players.lock().await = loaded;
        if count > 0 {
            info!("Loaded history for {} player(s)", count);
        }
        Ok(())
    }

    /// State for `player`, created empty on first use.
    pub async fn get(&self, player: &PlayerId) -> PlayerTrackState {
        self.players
            .lock()
            .await
            .entry(player.clone())
            .or_default()
            .clone()
    }

    /// Overwrite `player`'s state and write it to disk before returning.
    ///
    /// # Errors
    /// `Persistence` once all write attempts have failed. The in-memory state
    /// keeps the new value either way.
    pub async fn put(&self, player: &PlayerId, state: PlayerTrackState) -> Result<()> {
        let mut players = self.players.lock().await;
        players.insert(player.clone(), state);
        self.write_locked(&players).await
    }

    /// Overwrite `player`'s state in memory only; it reaches disk with the
    /// next `put` or `flush`.
    pub async fn stage(&self, player: &PlayerId, state: PlayerTrackState) {
        self.players.lock().await.insert(player.clone(), state);
    }

    /// Write everything to disk.
    pub async fn flush(&self) -> Result<()> {
        let players = self.players.lock().await;
        self.write_locked(&players).await
    }

    /// Known player ids.
    pub async fn players(&self) -> Vec<PlayerId> {
        self.players.lock().await.keys().cloned().collect()
    }

    /// Snapshot of all entries.
    pub async fn entries(&self) -> BTreeMap<PlayerId, PlayerTrackState> {
        self.players.lock().await.clone()
    }

    /// Forget one player. Returns whether it was known.
    pub async fn clear(&self, player: &PlayerId) -> Result<bool> {
        let mut players = self.players.lock().await;
        let removed = players.remove(player).is_some();
        if removed {
            info!("Cleared history for {}", player);
            self.write_locked(&players).await?;
        }
        Ok(removed)
    }

    /// Forget every player.
    pub async fn clear_all(&self) -> Result<usize> {
        let mut players = self.players.lock().await;
        let count = players.len();
        players.clear();
        info!("Cleared history for {} player(s)", count);
        self.write_locked(&players).await?;
        Ok(count)
    }

    /// Serialize and write while the caller holds the lock, retrying with backoff.
    async fn write_locked(&self, players: &BTreeMap<PlayerId, PlayerTrackState>) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        let file = HistoryFile {
            version: FORMAT_VERSION,
            players: players
                .iter()
                .map(|(id, state)| (id.clone(), PlayerRecord::from(state)))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| Error::persistence(format!("failed to serialize history: {e}")))?;
        let bytes = Arc::new(bytes);

        let mut last_error = String::new();
        for attempt in 1..=WRITE_ATTEMPTS {
            let target = path.clone();
            let bytes = Arc::clone(&bytes);
            let result = tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
                .await
                .map_err(|e| std::io::Error::other(e.to_string()))
                .and_then(|r| r);

            match result {
                Ok(()) => {
                    debug!("History written to {:?}", path);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "History write attempt {}/{} failed: {}",
                        attempt, WRITE_ATTEMPTS, e
                    );
                    last_error = e.to_string();
                    if attempt < WRITE_ATTEMPTS {
                        tokio::time::sleep(WRITE_BACKOFF * attempt).await;
                    }
                }
            }
        }

        error!("Giving up writing history to {:?}: {}", path, last_error);
        Err(Error::persistence(format!(
            "failed to write {} after {} attempts: {}",
            path.display(),
            WRITE_ATTEMPTS,
            last_error
        )))
    }
}

/// Read and decode a history file. Missing file means empty history.
fn read_file(path: &Path) -> Result<BTreeMap<PlayerId, PlayerTrackState>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => {
            return Err(Error::persistence(format!(
                "failed to read {}: {e}",
                path.display()
            )))
        }
    };

    if contents.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    let file: HistoryFile = serde_json::from_str(&contents).map_err(|e| {
        Error::persistence(format!("failed to parse {}: {e}", path.display()))
    })?;

    if file.version > FORMAT_VERSION {
        return Err(Error::persistence(format!(
            "{} has format version {}, newer than supported {}",
            path.display(),
            file.version,
            FORMAT_VERSION
        )));
    }

    Ok(file
        .players
        .into_iter()
        .map(|(id, record)| (id, PlayerTrackState::from(record)))
        .collect())
}

/// Write `bytes` to `path` via a synced temp file in the same directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
