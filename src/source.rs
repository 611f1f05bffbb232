//! Where snapshots come from
//!
//! The poll loop only needs two things from a player backend: which players
//! exist right now, and what one of them is playing. Discovery and the wire
//! protocol stay behind [`PlayerSource`].

use async_trait::async_trait;

use crate::config::PlayerConfig;
use crate::error::PollError;
use crate::track::{PlaybackSnapshot, PlayerId};

/// Discovery and polling of media players.
#[async_trait]
pub trait PlayerSource: Send + Sync {
    /// Players currently reachable.
    async fn list_players(&self) -> Result<Vec<PlayerId>, PollError>;

    /// Current playback snapshot for one player.
    async fn poll(&self, player: &PlayerId) -> Result<PlaybackSnapshot, PollError>;
}

/// Whitelist/blacklist filtering of discovered players.
#[derive(Debug, Clone, Default)]
pub struct PlayerFilter {
    whitelist: Vec<String>,
    blacklist: Vec<String>,
}

impl PlayerFilter {
    #[must_use]
    pub fn new(config: &PlayerConfig) -> Self {
        Self {
            whitelist: config.whitelist.clone(),
            blacklist: config.blacklist.clone(),
        }
    }

    /// Check if a player should be tracked.
    ///
    /// Substring match on the id; the blacklist wins, and an empty whitelist
    /// allows everything.
    #[must_use]
    pub fn allows(&self, player: &PlayerId) -> bool {
        let id = player.as_str();

        if self.blacklist.iter().any(|p| id.contains(p.as_str())) {
            return false;
        }

        if self.whitelist.is_empty() {
            return true;
        }

        self.whitelist.iter().any(|p| id.contains(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(whitelist: &[&str], blacklist: &[&str]) -> PlayerFilter {
        PlayerFilter::new(&PlayerConfig {
            whitelist: whitelist.iter().map(ToString::to_string).collect(),
            blacklist: blacklist.iter().map(ToString::to_string).collect(),
        })
    }

    #[test]
    fn test_empty_filter_allows_all() {
        assert!(filter(&[], &[]).allows(&PlayerId::new("spotify")));
    }

    #[test]
    fn test_blacklist_wins_over_whitelist() {
        let f = filter(&["firefox"], &["firefox"]);
        assert!(!f.allows(&PlayerId::new("firefox.instance_1_42")));
    }

    #[test]
    fn test_whitelist_restricts() {
        let f = filter(&["mpd", "strawberry"], &[]);
        assert!(f.allows(&PlayerId::new("mpd")));
        assert!(f.allows(&PlayerId::new("strawberry")));
        assert!(!f.allows(&PlayerId::new("chromium.instance7")));
    }
}
