//! MPRIS metadata parsing

use std::collections::HashMap;
use zbus::zvariant::OwnedValue;

use super::{extract, extract_first_or_string, extract_string};

/// The subset of MPRIS metadata needed for scrobbling
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_us: Option<i64>,
}

impl TrackMetadata {
    /// Duration in seconds, 0 when unknown.
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        self.duration_us
            .filter(|us| *us > 0)
            .map_or(0.0, |us| us as f64 / 1_000_000.0)
    }
}

/// Parse an MPRIS `Metadata` dictionary
pub fn parse_metadata(metadata: &HashMap<String, OwnedValue>) -> TrackMetadata {
    let mut track = TrackMetadata::default();

    if let Some(value) = metadata.get("xesam:title") {
        track.title = extract_string(value);
    }

    // Artist is a string array; take the first
    if let Some(value) = metadata.get("xesam:artist") {
        track.artist = extract_first_or_string(value);
    }

    if let Some(value) = metadata.get("xesam:album") {
        track.album = extract_string(value);
    }

    // Microseconds
    if let Some(value) = metadata.get("mpris:length") {
        track.duration_us = extract::<i64>(value);
    }

    track
}
