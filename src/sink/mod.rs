//! Scrobble sinks
//!
//! A sink receives each decided [`ScrobbleEvent`]. The dispatcher hands an
//! event to every configured sink at once, bounds each delivery with a
//! timeout, and reports failures per sink. A failing sink never affects the
//! others or the engine state that produced the event.

mod lastfm;
mod listenbrainz;
mod log;

pub use lastfm::LastFmSink;
pub use listenbrainz::ListenBrainzSink;
pub use log::LogSink;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, SinkError};
use crate::track::ScrobbleEvent;

/// A destination for scrobbles.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name used in logs and reports.
    fn name(&self) -> &str;

    /// Deliver one scrobble.
    async fn deliver(&self, event: &ScrobbleEvent) -> std::result::Result<(), SinkError>;
}

/// Accepts and drops every scrobble. Used when no sink is enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledSink;

#[async_trait]
impl Sink for DisabledSink {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn deliver(&self, event: &ScrobbleEvent) -> std::result::Result<(), SinkError> {
        debug!(
            "[{}] scrobbling disabled, dropping {} - {}",
            event.player_id, event.artist, event.title
        );
        Ok(())
    }
}

/// Outcome of delivering one event to one sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkOutcome {
    pub sink: String,
    pub result: std::result::Result<(), SinkError>,
}

/// Per-sink outcomes of one dispatch, in sink order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub outcomes: Vec<SinkOutcome>,
}

impl DispatchReport {
    /// Number of sinks that accepted the event.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    /// Sinks that failed, with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &SinkError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.sink.as_str(), e)))
    }

    #[must_use]
    pub fn all_delivered(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

/// Fans scrobbles out to every configured sink.
#[derive(Clone)]
pub struct SinkDispatcher {
    sinks: Vec<Arc<dyn Sink>>,
    delivery_timeout: Duration,
}

impl std::fmt::Debug for SinkDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkDispatcher")
            .field("sinks", &self.names())
            .field("delivery_timeout", &self.delivery_timeout)
            .finish()
    }
}

impl SinkDispatcher {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn Sink>>, delivery_timeout: Duration) -> Self {
        Self {
            sinks,
            delivery_timeout,
        }
    }

    /// Build the sinks enabled in the configuration.
    ///
    /// Falls back to a single [`DisabledSink`] when nothing is enabled.
    pub fn from_config(config: &Config) -> Result<Self> {
        let sinks_config = &config.sinks;
        let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();

        if sinks_config.log.enabled {
            let log = LogSink::new(
                config.log_path()?,
                sinks_config.log.format,
                sinks_config.log.stdout,
            );
            info!("Logging scrobbles to {}", log.path().display());
            sinks.push(Arc::new(log));
        }

        if sinks_config.lastfm.enabled {
            sinks.push(Arc::new(LastFmSink::new(
                sinks_config.lastfm.api_key.clone(),
                sinks_config.lastfm.api_secret.clone(),
                sinks_config.lastfm.session_key.clone(),
            )));
        }

        if sinks_config.listenbrainz.enabled {
            sinks.push(Arc::new(ListenBrainzSink::new(
                sinks_config.listenbrainz.token.clone(),
                sinks_config.listenbrainz.api_url.clone(),
            )));
        }

        if sinks.is_empty() {
            sinks.push(Arc::new(DisabledSink));
        }

        Ok(Self::new(
            sinks,
            Duration::from_secs(sinks_config.delivery_timeout_seconds),
        ))
    }

    /// Names of the configured sinks.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Deliver an event to every sink concurrently.
    ///
    /// Failures are logged and returned in the report; they are never
    /// propagated.
    pub async fn dispatch(&self, event: &ScrobbleEvent) -> DispatchReport {
        let deliveries = self.sinks.iter().map(|sink| async move {
            let delivery = tokio::time::timeout(self.delivery_timeout, sink.deliver(event));
            let result = match delivery.await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout),
            };

            if let Err(ref e) = result {
                warn!(
                    "[{}] {} failed to take {} - {}: {}",
                    event.player_id,
                    sink.name(),
                    event.artist,
                    event.title,
                    e
                );
            }

            SinkOutcome {
                sink: sink.name().to_string(),
                result,
            }
        });

        DispatchReport {
            outcomes: join_all(deliveries).await,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::track::PlayerId;
    use crate::types::Milliseconds;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;
    use uuid::Uuid;

    pub(crate) fn event() -> ScrobbleEvent {
        let started_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        ScrobbleEvent {
            id: Uuid::new_v4(),
            player_id: PlayerId::new("living-room"),
            player_name: Some("Living Room".into()),
            artist: "Artist A".into(),
            title: "Song X".into(),
            album: Some("Album Z".into()),
            duration_seconds: Some(200),
            watched: Milliseconds(60_000),
            started_at,
            scrobbled_at: started_at + chrono::Duration::seconds(60),
        }
    }

    /// Remembers every delivered event.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) events: Mutex<Vec<ScrobbleEvent>>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, event: &ScrobbleEvent) -> std::result::Result<(), SinkError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl Sink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _event: &ScrobbleEvent) -> std::result::Result<(), SinkError> {
            Err(SinkError::Rejected("invalid session".into()))
        }
    }

    struct SlowSink;

    #[async_trait]
    impl Sink for SlowSink {
        fn name(&self) -> &str {
            "slow"
        }

        async fn deliver(&self, _event: &ScrobbleEvent) -> std::result::Result<(), SinkError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let recording = Arc::new(RecordingSink::default());
        let sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(FailingSink), recording.clone()];
        let dispatcher = SinkDispatcher::new(sinks, Duration::from_secs(5));

        let event = event();
        let report = dispatcher.dispatch(&event).await;

        assert_eq!(report.delivered(), 1);
        assert!(!report.all_delivered());
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "failing");
        assert_eq!(recording.events.lock().unwrap().as_slice(), &[event]);
    }

    #[tokio::test]
    async fn test_slow_sink_times_out() {
        let recording = Arc::new(RecordingSink::default());
        let sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(SlowSink), recording.clone()];
        let dispatcher = SinkDispatcher::new(sinks, Duration::from_millis(50));

        let started = std::time::Instant::now();
        let report = dispatcher.dispatch(&event()).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.outcomes[0].result, Err(SinkError::Timeout));
        assert!(report.outcomes[1].result.is_ok());
        assert_eq!(recording.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_sink_accepts_everything() {
        let sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(DisabledSink)];
        let dispatcher = SinkDispatcher::new(sinks, Duration::from_secs(1));
        let report = dispatcher.dispatch(&event()).await;
        assert!(report.all_delivered());
        assert_eq!(dispatcher.names(), vec!["disabled"]);
    }

    #[test]
    fn test_from_config_without_sinks_is_disabled() {
        let mut config = Config::default();
        config.sinks.log.enabled = false;
        let dispatcher = SinkDispatcher::from_config(&config).unwrap();
        assert_eq!(dispatcher.names(), vec!["disabled"]);
    }

    #[test]
    fn test_from_config_builds_enabled_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.general.data_dir = Some(dir.path().to_path_buf());
        config.sinks.listenbrainz.enabled = true;
        config.sinks.listenbrainz.token = "tok".into();
        let dispatcher = SinkDispatcher::from_config(&config).unwrap();
        assert_eq!(dispatcher.names(), vec!["log", "listenbrainz"]);
    }
}
