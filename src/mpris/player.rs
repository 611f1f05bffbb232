//! MPRIS player polling

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use zbus::fdo::DBusProxy;
use zbus::names::InterfaceName;
use zbus::zvariant::OwnedValue;
use zbus::Connection;

use crate::clock::Clock;
use crate::error::{PollError, Result};
use crate::source::PlayerSource;
use crate::track::{PlaybackSnapshot, PlayerId, TransportState};

use super::{
    extract, extract_string, parse_metadata, player_id_from_bus_name, MPRIS_PATH,
    MPRIS_PLAYER_IFACE, MPRIS_PREFIX, MPRIS_ROOT_IFACE,
};

/// Timeout for each D-Bus call, so a misbehaving player can't hang a tick.
const DBUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls MPRIS players on the session bus.
pub struct MprisSource {
    connection: Connection,
    clock: Arc<dyn Clock>,
}

impl MprisSource {
    /// Connect to the session bus.
    pub async fn new(clock: Arc<dyn Clock>) -> Result<Self> {
        let connection = Connection::session().await?;
        Ok(Self { connection, clock })
    }

    /// Read one property from a player, bounded by [`DBUS_TIMEOUT`].
    async fn get_property(
        &self,
        bus_name: &str,
        interface: &'static str,
        property: &'static str,
    ) -> std::result::Result<OwnedValue, PollError> {
        let proxy = tokio::time::timeout(DBUS_TIMEOUT, async {
            zbus::fdo::PropertiesProxy::builder(&self.connection)
                .destination(bus_name)?
                .path(MPRIS_PATH)?
                .build()
                .await
        })
        .await
        .map_err(|_| PollError::Timeout)??;

        let iface = InterfaceName::try_from(interface)
            .map_err(|e| PollError::Protocol(e.to_string()))?;

        tokio::time::timeout(DBUS_TIMEOUT, proxy.get(iface, property))
            .await
            .map_err(|_| PollError::Timeout)?
            .map_err(PollError::from)
    }
}

#[async_trait]
impl PlayerSource for MprisSource {
    async fn list_players(&self) -> std::result::Result<Vec<PlayerId>, PollError> {
        let dbus = tokio::time::timeout(DBUS_TIMEOUT, DBusProxy::new(&self.connection))
            .await
            .map_err(|_| PollError::Timeout)??;
        let names = tokio::time::timeout(DBUS_TIMEOUT, dbus.list_names())
            .await
            .map_err(|_| PollError::Timeout)??;

        let mut players: Vec<PlayerId> = names
            .iter()
            .filter_map(|name| player_id_from_bus_name(name.as_str()))
            .map(PlayerId::new)
            .collect();
        players.sort();
        Ok(players)
    }

    async fn poll(&self, player: &PlayerId) -> std::result::Result<PlaybackSnapshot, PollError> {
        let bus_name = format!("{MPRIS_PREFIX}{player}");

        let status = self
            .get_property(&bus_name, MPRIS_PLAYER_IFACE, "PlaybackStatus")
            .await?;
        let status = extract_string(&status)
            .ok_or_else(|| PollError::Protocol("PlaybackStatus is not a string".into()))?;

        let metadata = self
            .get_property(&bus_name, MPRIS_PLAYER_IFACE, "Metadata")
            .await?;
        let metadata = HashMap::<String, OwnedValue>::try_from(metadata)
            .map_err(|_| PollError::Protocol("Failed to parse metadata".into()))?;
        let track = parse_metadata(&metadata);

        // Not every player implements Position or Identity.
        let position_us = match self.get_property(&bus_name, MPRIS_PLAYER_IFACE, "Position").await {
            Ok(value) => extract::<i64>(&value).unwrap_or(0),
            Err(e) => {
                debug!("[{}] no position: {}", player, e);
                0
            }
        };
        let identity = self
            .get_property(&bus_name, MPRIS_ROOT_IFACE, "Identity")
            .await
            .ok()
            .and_then(|v| extract_string(&v));

        Ok(PlaybackSnapshot {
            player_id: player.clone(),
            player_name: identity,
            duration_seconds: track.duration_seconds(),
            position_seconds: position_us as f64 / 1_000_000.0,
            artist: track.artist,
            title: track.title,
            album: track.album,
            transport_state: TransportState::parse(&status),
            observed_at: self.clock.now(),
        })
    }
}
