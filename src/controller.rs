//! Poll loop
//!
//! Drives the whole pipeline: discover players, poll them, run each snapshot
//! through the engine, persist the result and hand scrobbles to the sinks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::engine::{Action, ScrobbleEngine};
use crate::error::{PollError, Result};
use crate::history::HistoryStore;
use crate::sink::SinkDispatcher;
use crate::source::{PlayerFilter, PlayerSource};
use crate::track::{PlaybackSnapshot, PlayerId};

/// Poll loop timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Time between ticks.
    pub interval: Duration,

    /// Upper bound on polling a single player (and on discovery).
    pub poll_timeout: Duration,

    /// Time between player discovery runs.
    pub rediscovery_interval: Duration,

    /// How often in-progress watch time is written to disk per player.
    pub progress_persist_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(5),
            rediscovery_interval: Duration::from_secs(10),
            progress_persist_interval: Duration::from_secs(15),
        }
    }
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ControllerState {
    #[display("idle")]
    Idle,
    #[display("polling")]
    Polling,
    #[display("processing")]
    Processing,
    #[display("shutdown")]
    Shutdown,
}

/// Summary of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Players whose poll returned a snapshot.
    pub polled: usize,
    /// Players whose poll failed or timed out.
    pub failed: usize,
    /// Snapshots that changed watch state.
    pub updated: usize,
    /// Scrobbles handed to the sinks.
    pub scrobbled: usize,
}

/// State owned by whichever tick is running.
#[derive(Debug, Default)]
struct LoopState {
    players: Vec<PlayerId>,
    last_discovery: Option<Instant>,
    /// Monotonic time of the last durable write per player.
    last_persist: HashMap<PlayerId, Duration>,
    /// Players whose last poll failed, so repeats log quietly.
    failing: HashSet<PlayerId>,
}

/// The poll loop.
pub struct PollController {
    source: Arc<dyn PlayerSource>,
    store: HistoryStore,
    engine: ScrobbleEngine,
    dispatcher: SinkDispatcher,
    filter: PlayerFilter,
    config: ControllerConfig,
    state: Mutex<ControllerState>,
    loop_state: tokio::sync::Mutex<LoopState>,
    /// Atomic flag for stop signaling
    running: AtomicBool,
    wake: Notify,
}

impl PollController {
    #[must_use]
    pub fn new(
        source: Arc<dyn PlayerSource>,
        store: HistoryStore,
        engine: ScrobbleEngine,
        dispatcher: SinkDispatcher,
        mut config: ControllerConfig,
    ) -> Self {
        // tokio's interval rejects a zero period
        config.interval = config.interval.max(Duration::from_millis(1));

        Self {
            source,
            store,
            engine,
            dispatcher,
            filter: PlayerFilter::default(),
            config,
            state: Mutex::new(ControllerState::Idle),
            loop_state: tokio::sync::Mutex::new(LoopState::default()),
            running: AtomicBool::new(true),
            wake: Notify::new(),
        }
    }

    /// Only track players the filter allows.
    #[must_use]
    pub fn with_filter(mut self, filter: PlayerFilter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ControllerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Ask the loop to stop. An in-flight tick still completes.
    ///
    /// This method is synchronous as it only sets an atomic flag.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Run until [`stop`](Self::stop) is called or persistence fails.
    ///
    /// The store is flushed on the way out in either case.
    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting poll loop (every {:?}, sinks: {})",
            self.config.interval,
            self.dispatcher.names().join(", ")
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            if !self.running.load(Ordering::SeqCst) {
                break Ok(());
            }

            tokio::select! {
                _ = interval.tick() => {}
                () = self.wake.notified() => continue,
            }

            if !self.running.load(Ordering::SeqCst) {
                break Ok(());
            }

            match self.tick().await {
                Ok(report) => {
                    if report.scrobbled > 0 {
                        debug!("Tick: {:?}", report);
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!("Stopping poll loop: {}", e);
                    break Err(e);
                }
                Err(e) => warn!("Tick failed: {}", e),
            }
        };

        self.set_state(ControllerState::Shutdown);

        if let Err(e) = self.store.flush().await {
            error!("Failed to flush history on shutdown: {}", e);
            if outcome.is_ok() {
                return Err(e);
            }
        }

        info!("Poll loop stopped");
        outcome
    }

    /// One pass: discover if due, poll every player, process the snapshots.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut loop_state = self.loop_state.lock().await;

        self.set_state(ControllerState::Polling);
        self.refresh_players(&mut loop_state).await;

        let polls = loop_state.players.iter().map(|player| async move {
            let result = tokio::time::timeout(self.config.poll_timeout, self.source.poll(player))
                .await
                .unwrap_or(Err(PollError::Timeout));
            (player.clone(), result)
        });
        let results = join_all(polls).await;

        self.set_state(ControllerState::Processing);
        let mut report = TickReport::default();
        let mut outcome = Ok(());

        for (player, result) in results {
            match result {
                Ok(snapshot) => {
                    report.polled += 1;
                    if loop_state.failing.remove(&player) {
                        info!("[{}] Player reachable again", player);
                    }
                    if let Err(e) = self
                        .process(&player, &snapshot, &mut loop_state, &mut report)
                        .await
                    {
                        outcome = Err(e);
                        break;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    if loop_state.failing.insert(player.clone()) {
                        warn!("[{}] Poll failed: {}", player, e);
                    } else {
                        debug!("[{}] Poll still failing: {}", player, e);
                    }
                }
            }
        }

        self.set_state(ControllerState::Idle);
        outcome.map(|()| report)
    }

    /// Run discovery if it's due. A failed discovery keeps the previous list.
    async fn refresh_players(&self, loop_state: &mut LoopState) {
        let due = loop_state
            .last_discovery
            .map_or(true, |at| at.elapsed() >= self.config.rediscovery_interval);
        if !due {
            return;
        }
        loop_state.last_discovery = Some(Instant::now());

        let discovered =
            match tokio::time::timeout(self.config.poll_timeout, self.source.list_players()).await {
                Ok(Ok(players)) => players,
                Ok(Err(e)) => {
                    warn!(
                        "Player discovery failed, keeping {} known player(s): {}",
                        loop_state.players.len(),
                        e
                    );
                    return;
                }
                Err(_) => {
                    warn!(
                        "Player discovery timed out, keeping {} known player(s)",
                        loop_state.players.len()
                    );
                    return;
                }
            };

        let players: Vec<PlayerId> = discovered
            .into_iter()
            .filter(|p| self.filter.allows(p))
            .collect();

        if players != loop_state.players {
            info!(
                "Tracking {} player(s): {}",
                players.len(),
                players
                    .iter()
                    .map(PlayerId::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            loop_state
                .last_persist
                .retain(|id, _| players.contains(id));
            loop_state.failing.retain(|id| players.contains(id));
        }
        loop_state.players = players;
    }

    /// Decide, persist, then dispatch.
    ///
    /// State reaches disk before any sink sees the scrobble, so a crash in
    /// between loses a delivery rather than repeating one.
    async fn process(
        &self,
        player: &PlayerId,
        snapshot: &PlaybackSnapshot,
        loop_state: &mut LoopState,
        report: &mut TickReport,
    ) -> Result<()> {
        let prior = self.store.get(player).await;
        let decision = self.engine.decide(snapshot, &prior);

        if decision.state == prior {
            return Ok(());
        }

        let now = snapshot.observed_at.monotonic;
        let persist_due = loop_state.last_persist.get(player).map_or(true, |last| {
            now.saturating_sub(*last) >= self.config.progress_persist_interval
        });

        if decision.state.differs_durably(&prior) || persist_due {
            self.store.put(player, decision.state).await?;
            loop_state.last_persist.insert(player.clone(), now);
        } else {
            self.store.stage(player, decision.state).await;
        }

        match decision.action {
            Action::Scrobble(event) => {
                report.scrobbled += 1;
                info!(
                    "[{}] Scrobbling: {} - {} ({} watched)",
                    snapshot.display_name(),
                    event.artist,
                    event.title,
                    event.watched
                );
                let delivery = self.dispatcher.dispatch(&event).await;
                if !delivery.all_delivered() {
                    debug!(
                        "[{}] delivered to {}/{} sink(s)",
                        player,
                        delivery.delivered(),
                        delivery.outcomes.len()
                    );
                }
            }
            Action::Update => report.updated += 1,
            Action::None => {}
        }

        Ok(())
    }
}
