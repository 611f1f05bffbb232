//! Scrobble decision engine
//!
//! Pure logic: given a new snapshot and a player's prior state, decide whether
//! the play counts as a scrobble. Rules (Last.fm style):
//! - Only Playing snapshots with both artist and title advance anything
//! - A play counts after 240 s watched, or after `threshold_percent` of a
//!   known duration, whichever comes first
//! - At most once per watch segment, and at most once per duplicate window
//!   per track even across replays
//!
//! Watch time comes from the monotonic clock difference between snapshots,
//! never from reported positions, since users seek.

use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::track::{PlaybackSnapshot, PlayerTrackState, ScrobbleEvent};
use crate::types::Milliseconds;

/// Absolute watch time after which any track is eligible (4 minutes).
pub const ABSOLUTE_THRESHOLD: Duration = Duration::from_secs(240);

/// Default window during which a repeated track is not scrobbled again.
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(1800);

/// Default share of a track that must be watched.
pub const DEFAULT_THRESHOLD_PERCENT: f64 = 25.0;

/// Default cap on time accrued between two consecutive snapshots.
pub const DEFAULT_MAX_ACCRUAL: Duration = Duration::from_secs(60);

/// Engine tuning
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Percentage (0-100) of a known duration that makes a track eligible.
    pub threshold_percent: f64,

    /// Watch time that makes any track eligible.
    pub absolute_threshold: Duration,

    /// Minimum spacing between two scrobbles of the same track on one player.
    pub duplicate_window: Duration,

    /// Largest gap between snapshots that is credited as watch time.
    pub max_accrual: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threshold_percent: DEFAULT_THRESHOLD_PERCENT,
            absolute_threshold: ABSOLUTE_THRESHOLD,
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
            max_accrual: DEFAULT_MAX_ACCRUAL,
        }
    }
}

/// What the caller should do with a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Nothing changed that matters.
    None,
    /// Progress was recorded or a new watch segment started.
    Update,
    /// The play counts; forward the event to the sinks.
    Scrobble(ScrobbleEvent),
}

impl Action {
    #[must_use]
    pub const fn is_scrobble(&self) -> bool {
        matches!(self, Self::Scrobble(_))
    }
}

/// Result of [`ScrobbleEngine::decide`].
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub state: PlayerTrackState,
    pub action: Action,
}

impl Decision {
    fn unchanged(prior: &PlayerTrackState) -> Self {
        Self {
            state: prior.clone(),
            action: Action::None,
        }
    }
}

/// Stateless decision engine; all state lives in [`PlayerTrackState`].
#[derive(Debug, Clone, Default)]
pub struct ScrobbleEngine {
    config: EngineConfig,
}

impl ScrobbleEngine {
    #[must_use]
    pub fn new(mut config: EngineConfig) -> Self {
        if !config.threshold_percent.is_finite() {
            config.threshold_percent = DEFAULT_THRESHOLD_PERCENT;
        }
        config.threshold_percent = config.threshold_percent.clamp(0.0, 100.0);
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Decide what a snapshot means for a player.
    ///
    /// Never panics; inert or malformed snapshots yield [`Action::None`] with
    /// the prior state returned as-is. A non-playing snapshot additionally
    /// drops the monotonic baseline, so time spent paused or stopped is never
    /// credited when playback resumes.
    #[must_use]
    pub fn decide(&self, snapshot: &PlaybackSnapshot, prior: &PlayerTrackState) -> Decision {
        if !snapshot.is_playing() {
            let mut decision = Decision::unchanged(prior);
            decision.state.last_observed = None;
            return decision;
        }
        let Some(key) = snapshot.track_key() else {
            return Decision::unchanged(prior);
        };

        let now = snapshot.observed_at;
        let mut state = prior.clone();

        if state.current_track.as_ref() != Some(&key) {
            state.current_track = Some(key);
            state.watched = Milliseconds::ZERO;
            state.scrobbled_this_play = false;
            state.started_at = Some(now.wall);
            state.last_observed = Some(now.monotonic);
            return Decision {
                state,
                action: Action::Update,
            };
        }

        // No baseline after a restart: credit nothing, just re-anchor.
        let elapsed = state.last_observed.map_or(Duration::ZERO, |last| {
            now.monotonic
                .saturating_sub(last)
                .min(self.config.max_accrual)
        });
        state.watched = state
            .watched
            .saturating_add(Milliseconds::from_duration(elapsed));
        state.last_observed = Some(now.monotonic);

        debug!(
            "[{}] {}: {} watched, position {:.0}s/{:.0}s",
            snapshot.display_name(),
            key,
            state.watched,
            snapshot.clamped_position(),
            snapshot.known_duration().unwrap_or(0.0)
        );

        if !self.is_eligible(&state, snapshot.known_duration()) {
            return Decision {
                state,
                action: Action::Update,
            };
        }

        state.scrobbled_this_play = true;

        if self.within_duplicate_window(&state, &key, now.wall) {
            debug!(
                "[{}] {} already scrobbled within the last {}s, suppressing",
                snapshot.display_name(),
                key,
                self.config.duplicate_window.as_secs()
            );
            return Decision {
                state,
                action: Action::None,
            };
        }

        state.recent_scrobbles.insert(key, now.wall);
        if let Ok(window) = chrono::Duration::from_std(self.config.duplicate_window) {
            state.prune_recent(now.wall, window);
        }

        let event = ScrobbleEvent {
            id: Uuid::new_v4(),
            player_id: snapshot.player_id.clone(),
            player_name: snapshot.player_name.clone(),
            artist: snapshot.artist.clone().unwrap_or_default(),
            title: snapshot.title.clone().unwrap_or_default(),
            album: snapshot.album.clone().filter(|a| !a.trim().is_empty()),
            duration_seconds: snapshot.known_duration().map(|d| d.round() as u64),
            watched: state.watched,
            started_at: state.started_at.unwrap_or(now.wall),
            scrobbled_at: now.wall,
        };

        Decision {
            state,
            action: Action::Scrobble(event),
        }
    }

    /// Threshold check for the current watch segment.
    fn is_eligible(&self, state: &PlayerTrackState, duration: Option<f64>) -> bool {
        if state.scrobbled_this_play {
            return false;
        }
        state.watched >= Milliseconds::from_duration(self.threshold_for(duration))
    }

    fn within_duplicate_window(
        &self,
        state: &PlayerTrackState,
        key: &crate::track::TrackKey,
        now: chrono::DateTime<chrono::Utc>,
    ) -> bool {
        let Some(last) = state.last_scrobble_time(key) else {
            return false;
        };
        let window = chrono::Duration::from_std(self.config.duplicate_window)
            .unwrap_or_else(|_| chrono::Duration::zero());
        now - last < window
    }

    /// Watch time at which a track of `duration` seconds becomes eligible.
    #[must_use]
    pub fn threshold_for(&self, duration: Option<f64>) -> Duration {
        let absolute = self.config.absolute_threshold;
        duration
            .filter(|d| d.is_finite() && *d > 0.0)
            .map_or(absolute, |d| {
                Duration::try_from_secs_f64(d * self.config.threshold_percent / 100.0)
                    .map_or(absolute, |pct| pct.min(absolute))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ObservedAt;
    use crate::track::{PlayerId, TrackKey, TransportState};
    use chrono::{DateTime, TimeZone, Utc};

    fn base_wall() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 20, 0, 0).unwrap()
    }

    fn at(secs: u64) -> ObservedAt {
        ObservedAt {
            monotonic: Duration::from_secs(secs),
            wall: base_wall() + chrono::Duration::seconds(secs as i64),
        }
    }

    fn playing(artist: &str, title: &str, duration: f64, secs: u64) -> PlaybackSnapshot {
        PlaybackSnapshot {
            player_id: PlayerId::new("P1"),
            player_name: Some("Living Room".to_string()),
            artist: Some(artist.to_string()),
            title: Some(title.to_string()),
            album: None,
            duration_seconds: duration,
            position_seconds: 0.0,
            transport_state: TransportState::Playing,
            observed_at: at(secs),
        }
    }

    /// Feed snapshots every `step` seconds from `from` to `to` inclusive,
    /// counting scrobbles.
    fn play(
        engine: &ScrobbleEngine,
        state: &mut PlayerTrackState,
        track: (&str, &str, f64),
        from: u64,
        to: u64,
        step: u64,
    ) -> usize {
        let mut scrobbles = 0;
        let mut t = from;
        while t <= to {
            let decision = engine.decide(&playing(track.0, track.1, track.2, t), state);
            if decision.action.is_scrobble() {
                scrobbles += 1;
            }
            *state = decision.state;
            t += step;
        }
        scrobbles
    }

    #[test]
    fn test_non_playing_snapshots_keep_durable_state() {
        let engine = ScrobbleEngine::default();
        let mut prior = PlayerTrackState::new();
        prior.current_track = TrackKey::from_parts("Artist A", "Song X");
        prior.watched = Milliseconds(42_000);
        prior.last_observed = Some(Duration::from_secs(10));

        for transport in [
            TransportState::Paused,
            TransportState::Stopped,
            TransportState::Other,
        ] {
            let mut snap = playing("Artist A", "Song X", 200.0, 500);
            snap.transport_state = transport;
            let decision = engine.decide(&snap, &prior);
            assert_eq!(decision.action, Action::None);
            assert!(!decision.state.differs_durably(&prior));
            assert_eq!(decision.state.watched, prior.watched);
            assert_eq!(decision.state.started_at, prior.started_at);
            assert_eq!(decision.state.last_observed, None);
        }
    }

    #[test]
    fn test_paused_time_is_not_credited() {
        let engine = ScrobbleEngine::default();
        let mut state = PlayerTrackState::new();

        // 200s track, 50s threshold: ten seconds heard, then a long pause.
        play(&engine, &mut state, ("A", "X", 200.0), 0, 10, 1);
        assert_eq!(state.watched, Milliseconds(10_000));

        for t in 11..70 {
            let mut snap = playing("A", "X", 200.0, t);
            snap.transport_state = TransportState::Paused;
            let decision = engine.decide(&snap, &state);
            assert_eq!(decision.action, Action::None);
            state = decision.state;
        }

        let resumed = engine.decide(&playing("A", "X", 200.0, 70), &state);
        assert_eq!(resumed.state.watched, Milliseconds(10_000));
        assert!(!resumed.action.is_scrobble());

        // Accrual picks up again from the resume point.
        let mut state = resumed.state;
        assert_eq!(play(&engine, &mut state, ("A", "X", 200.0), 71, 110, 1), 1);
    }

    #[test]
    fn test_missing_artist_or_title_is_inert() {
        let engine = ScrobbleEngine::default();
        let prior = PlayerTrackState::new();

        let mut snap = playing("Artist A", "Song X", 200.0, 0);
        snap.artist = None;
        let decision = engine.decide(&snap, &prior);
        assert_eq!(decision.action, Action::None);
        assert_eq!(decision.state, prior);

        let mut snap = playing("Artist A", "Song X", 200.0, 0);
        snap.title = Some("   ".to_string());
        let decision = engine.decide(&snap, &prior);
        assert_eq!(decision.action, Action::None);
        assert_eq!(decision.state, prior);
    }

    #[test]
    fn test_first_snapshot_starts_watch() {
        let engine = ScrobbleEngine::default();
        let decision = engine.decide(&playing("A", "X", 200.0, 7), &PlayerTrackState::new());
        assert_eq!(decision.action, Action::Update);
        assert_eq!(decision.state.current_track, TrackKey::from_parts("A", "X"));
        assert_eq!(decision.state.watched, Milliseconds::ZERO);
        assert!(!decision.state.scrobbled_this_play);
        assert_eq!(decision.state.started_at, Some(at(7).wall));
    }

    #[test]
    fn test_unknown_duration_scrobbles_once_at_240s_any_poll_rate() {
        let engine = ScrobbleEngine::default();
        for step in [1, 3, 7, 10, 30] {
            let mut state = PlayerTrackState::new();
            let count = play(&engine, &mut state, ("A", "Long", 0.0), 0, 600, step);
            assert_eq!(count, 1, "step {step}");
        }
    }

    #[test]
    fn test_unknown_duration_not_before_240s() {
        let engine = ScrobbleEngine::default();
        let mut state = PlayerTrackState::new();
        assert_eq!(play(&engine, &mut state, ("A", "Long", 0.0), 0, 239, 1), 0);
        assert_eq!(state.watched, Milliseconds(239_000));
        assert_eq!(play(&engine, &mut state, ("A", "Long", 0.0), 240, 240, 1), 1);
    }

    #[test]
    fn test_percentage_threshold_exactly_at_25_percent() {
        let engine = ScrobbleEngine::default();
        let mut state = PlayerTrackState::new();
        assert_eq!(play(&engine, &mut state, ("A", "Short", 100.0), 0, 24, 1), 0);

        let decision = engine.decide(&playing("A", "Short", 100.0, 25), &state);
        assert!(decision.action.is_scrobble());
        assert_eq!(decision.state.watched, Milliseconds(25_000));
    }

    #[test]
    fn test_scenario_two_snapshots_thirty_seconds_apart() {
        let engine = ScrobbleEngine::default();
        let state = PlayerTrackState::new();

        let d0 = engine.decide(&playing("Artist A", "Song X", 200.0, 0), &state);
        assert_eq!(d0.action, Action::Update);

        let d1 = engine.decide(&playing("Artist A", "Song X", 200.0, 30), &d0.state);
        assert_eq!(d1.action, Action::Update);
        assert_eq!(d1.state.watched, Milliseconds(30_000));

        let d2 = engine.decide(&playing("Artist A", "Song X", 200.0, 60), &d1.state);
        let Action::Scrobble(event) = d2.action else {
            panic!("expected scrobble, got {:?}", d2.action);
        };
        assert_eq!(event.watched, Milliseconds(60_000));
        assert_eq!(event.artist, "Artist A");
        assert_eq!(event.title, "Song X");
        assert_eq!(event.player_id, PlayerId::new("P1"));
        assert_eq!(event.duration_seconds, Some(200));
        assert_eq!(event.started_at, at(0).wall);
        assert_eq!(event.scrobbled_at, at(60).wall);
        assert!(d2.state.scrobbled_this_play);

        let d3 = engine.decide(&playing("Artist A", "Song X", 200.0, 90), &d2.state);
        assert_eq!(d3.action, Action::Update);
    }

    #[test]
    fn test_track_switch_resets_watch_time() {
        let engine = ScrobbleEngine::default();
        let mut state = PlayerTrackState::new();
        play(&engine, &mut state, ("A", "Long", 0.0), 0, 200, 10);
        assert_eq!(state.watched, Milliseconds(200_000));

        let decision = engine.decide(&playing("B", "Other", 0.0, 210), &state);
        assert_eq!(decision.action, Action::Update);
        assert_eq!(decision.state.watched, Milliseconds::ZERO);
        assert_eq!(decision.state.current_track, TrackKey::from_parts("B", "Other"));
    }

    #[test]
    fn test_replay_within_window_is_suppressed() {
        let engine = ScrobbleEngine::default();
        let mut state = PlayerTrackState::new();

        // First play scrobbles at 25s.
        assert_eq!(play(&engine, &mut state, ("A", "X", 100.0), 0, 100, 5), 1);
        // Something else, then the same track again at t=200.
        play(&engine, &mut state, ("B", "Y", 100.0), 105, 110, 5);
        assert_eq!(play(&engine, &mut state, ("A", "X", 100.0), 200, 300, 5), 0);
        assert!(state.scrobbled_this_play, "suppressed play stays marked");
    }

    #[test]
    fn test_replay_after_window_scrobbles_again() {
        let engine = ScrobbleEngine::default();
        let mut state = PlayerTrackState::new();

        assert_eq!(play(&engine, &mut state, ("A", "X", 100.0), 0, 100, 5), 1);
        play(&engine, &mut state, ("B", "Y", 100.0), 105, 110, 5);
        // First scrobble was at t=25; 25 + 1800 = 1825.
        assert_eq!(play(&engine, &mut state, ("A", "X", 100.0), 1800, 1900, 5), 1);
    }

    #[test]
    fn test_duplicate_window_is_case_insensitive() {
        let engine = ScrobbleEngine::default();
        let mut state = PlayerTrackState::new();
        assert_eq!(play(&engine, &mut state, ("Artist", "Song", 100.0), 0, 50, 5), 1);
        play(&engine, &mut state, ("B", "Y", 100.0), 55, 60, 5);
        assert_eq!(play(&engine, &mut state, ("ARTIST", "song", 100.0), 65, 200, 5), 0);
    }

    #[test]
    fn test_large_gaps_are_capped() {
        let engine = ScrobbleEngine::default();
        let state = PlayerTrackState::new();
        let d0 = engine.decide(&playing("A", "X", 0.0, 0), &state);
        let d1 = engine.decide(&playing("A", "X", 0.0, 3600), &d0.state);
        assert_eq!(d1.state.watched, Milliseconds::from_duration(DEFAULT_MAX_ACCRUAL));
        assert_eq!(d1.action, Action::Update);
    }

    #[test]
    fn test_slow_polls_within_cap_credit_full_gap() {
        let engine = ScrobbleEngine::new(EngineConfig {
            max_accrual: Duration::from_secs(95),
            ..EngineConfig::default()
        });
        let mut state = PlayerTrackState::new();
        assert_eq!(play(&engine, &mut state, ("A", "X", 0.0), 0, 270, 90), 1);
        assert_eq!(state.watched, Milliseconds(270_000));
    }

    #[test]
    fn test_monotonic_going_backwards_accrues_nothing() {
        let engine = ScrobbleEngine::default();
        let d0 = engine.decide(&playing("A", "X", 0.0, 100), &PlayerTrackState::new());
        let d1 = engine.decide(&playing("A", "X", 0.0, 50), &d0.state);
        assert_eq!(d1.state.watched, Milliseconds::ZERO);
    }

    #[test]
    fn test_restart_without_baseline_resumes_accrual() {
        let engine = ScrobbleEngine::default();
        let mut state = PlayerTrackState::new();
        play(&engine, &mut state, ("A", "X", 200.0), 0, 40, 10);
        assert_eq!(state.watched, Milliseconds(40_000));

        // Simulate reload: monotonic baseline is not persisted.
        state.last_observed = None;

        let d = engine.decide(&playing("A", "X", 200.0, 5), &state);
        assert_eq!(d.state.watched, Milliseconds(40_000));
        assert_eq!(d.action, Action::Update);
        let d = engine.decide(&playing("A", "X", 200.0, 15), &d.state);
        assert!(d.action.is_scrobble());
        assert_eq!(d.state.watched, Milliseconds(50_000));
    }

    #[test]
    fn test_adversarial_numbers_never_panic() {
        let engine = ScrobbleEngine::new(EngineConfig {
            threshold_percent: f64::NAN,
            ..EngineConfig::default()
        });
        let mut state = PlayerTrackState::new();
        for (i, duration) in [f64::NAN, -5.0, f64::INFINITY, f64::MIN_POSITIVE, 1e300]
            .into_iter()
            .enumerate()
        {
            let mut snap = playing("A", "X", duration, i as u64 * 10);
            snap.position_seconds = f64::NAN;
            state = engine.decide(&snap, &state).state;
        }
        assert_eq!(engine.config().threshold_percent, DEFAULT_THRESHOLD_PERCENT);
    }

    #[test]
    fn test_zero_percent_threshold_scrobbles_on_second_snapshot() {
        let engine = ScrobbleEngine::new(EngineConfig {
            threshold_percent: 0.0,
            ..EngineConfig::default()
        });
        let mut state = PlayerTrackState::new();
        assert_eq!(play(&engine, &mut state, ("A", "X", 300.0), 0, 0, 1), 0);
        assert_eq!(play(&engine, &mut state, ("A", "X", 300.0), 1, 1, 1), 1);
    }

    #[test]
    fn test_threshold_for() {
        let engine = ScrobbleEngine::default();
        assert_eq!(engine.threshold_for(Some(200.0)), Duration::from_secs(50));
        assert_eq!(engine.threshold_for(Some(3600.0)), ABSOLUTE_THRESHOLD);
        assert_eq!(engine.threshold_for(None), ABSOLUTE_THRESHOLD);
        assert_eq!(engine.threshold_for(Some(-1.0)), ABSOLUTE_THRESHOLD);
    }

    #[test]
    fn test_blank_album_is_dropped_from_event() {
        let engine = ScrobbleEngine::default();
        let mut state = PlayerTrackState::new();
        let mut scrobbled = None;
        for t in [0, 30, 60] {
            let mut snap = playing("A", "X", 100.0, t);
            snap.album = Some("  ".to_string());
            let d = engine.decide(&snap, &state);
            state = d.state;
            if let Action::Scrobble(event) = d.action {
                scrobbled = Some(event);
            }
        }
        let Some(event) = scrobbled else {
            panic!("expected scrobble");
        };
        assert!(event.album.is_none());
    }
}
