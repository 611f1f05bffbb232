//! # Music Scrobbler
//!
//! Watches media players and decides when a play counts as a scrobble.
//!
//! This crate provides:
//! - A pure decision engine that turns playback snapshots into scrobbles
//! - A durable per-player history so restarts neither lose progress nor
//!   repeat scrobbles
//! - A poll loop that drives any [`PlayerSource`](source::PlayerSource)
//! - MPRIS D-Bus polling for Linux media players
//! - Sinks for a local log, Last.fm and ListenBrainz

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod history;
pub mod mpris;
pub mod sink;
pub mod source;
pub mod track;
pub mod types;

pub use config::Config;
pub use controller::PollController;
pub use engine::ScrobbleEngine;
pub use error::{Error, Result};
pub use history::HistoryStore;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "music-scrobbler";
