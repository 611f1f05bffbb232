//! MPRIS D-Bus player source
//!
//! Polls MPRIS-compatible media players on the session bus. Each player's
//! well-known name suffix (e.g. `spotify` for
//! `org.mpris.MediaPlayer2.spotify`) is its [`PlayerId`](crate::track::PlayerId).

mod metadata;
mod player;

pub use metadata::{parse_metadata, TrackMetadata};
pub use player::MprisSource;

use zbus::zvariant::{OwnedValue, Value};

/// MPRIS D-Bus constants
pub const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2.";
pub const MPRIS_PATH: &str = "/org/mpris/MediaPlayer2";
pub const MPRIS_ROOT_IFACE: &str = "org.mpris.MediaPlayer2";
pub const MPRIS_PLAYER_IFACE: &str = "org.mpris.MediaPlayer2.Player";

/// Trait for extracting typed values from D-Bus variants
pub trait ExtractValue: Sized {
    /// Extract a value from a D-Bus OwnedValue
    fn extract(value: &OwnedValue) -> Option<Self>;
}

impl ExtractValue for String {
    fn extract(value: &OwnedValue) -> Option<Self> {
        if let Ok(Value::Str(s)) = value.try_into() {
            return Some(s.to_string());
        }
        <&str>::try_from(value)
            .map(String::from)
            .or_else(|_| String::try_from(value.clone()))
            .ok()
    }
}

impl ExtractValue for Vec<String> {
    fn extract(value: &OwnedValue) -> Option<Self> {
        Vec::<String>::try_from(value.clone())
            .ok()
            .filter(|arr| !arr.is_empty())
            .or_else(|| {
                if let Value::Array(arr) = Value::from(value.clone()) {
                    let strings: Vec<_> = arr
                        .iter()
                        .filter_map(|v| match v {
                            Value::Str(s) => Some(s.to_string()),
                            _ => None,
                        })
                        .collect();
                    (!strings.is_empty()).then_some(strings)
                } else {
                    None
                }
            })
    }
}

/// Lengths and positions arrive as whatever integer width the player picked.
impl ExtractValue for i64 {
    fn extract(value: &OwnedValue) -> Option<Self> {
        Self::try_from(value.clone())
            .ok()
            .or_else(|| match Value::from(value.clone()) {
                Value::I64(v) => Some(v),
                Value::I32(v) => Some(Self::from(v)),
                Value::U64(v) => Self::try_from(v).ok(),
                Value::U32(v) => Some(Self::from(v)),
                Value::F64(v) if v.is_finite() => Some(v as Self),
                _ => None,
            })
    }
}

/// Convenience function to extract a value using the ExtractValue trait
pub fn extract<T: ExtractValue>(value: &OwnedValue) -> Option<T> {
    T::extract(value)
}

/// Extract the first element of a string array, falling back to a single string
pub fn extract_first_or_string(value: &OwnedValue) -> Option<String> {
    if let Some(arr) = Vec::<String>::extract(value) {
        arr.into_iter().next()
    } else {
        String::extract(value)
    }
}

/// Extract a string from a D-Bus value.
pub fn extract_string(value: &OwnedValue) -> Option<String> {
    String::extract(value)
}

/// Player id for an MPRIS bus name, or `None` if it isn't one.
#[must_use]
pub fn player_id_from_bus_name(name: &str) -> Option<&str> {
    name.strip_prefix(MPRIS_PREFIX).filter(|s| !s.is_empty())
}
