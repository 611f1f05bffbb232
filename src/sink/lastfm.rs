//! Last.fm scrobbling
//! API Documentation: https://www.last.fm/api/show/track.scrobble

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::Sink;
use crate::error::SinkError;
use crate::track::ScrobbleEvent;

const API_URL: &str = "https://ws.audioscrobbler.com/2.0/";

/// Submits scrobbles to Last.fm with an existing session key.
pub struct LastFmSink {
    api_key: String,
    api_secret: String,
    session_key: String,
    api_url: String,
    client: Client,
}

impl LastFmSink {
    #[must_use]
    pub fn new(api_key: String, api_secret: String, session_key: String) -> Self {
        Self {
            api_key,
            api_secret,
            session_key,
            api_url: API_URL.to_string(),
            client: Client::new(),
        }
    }

    /// Signed form parameters for a `track.scrobble` call.
    fn scrobble_params(&self, event: &ScrobbleEvent) -> BTreeMap<&'static str, String> {
        let mut params = BTreeMap::new();
        params.insert("method", "track.scrobble".to_string());
        params.insert("artist", event.artist.clone());
        params.insert("track", event.title.clone());
        params.insert("timestamp", event.started_at.timestamp().to_string());
        params.insert("api_key", self.api_key.clone());
        params.insert("sk", self.session_key.clone());
        if let Some(ref album) = event.album {
            params.insert("album", album.clone());
        }
        if let Some(duration) = event.duration_seconds {
            params.insert("duration", duration.to_string());
        }

        let signature = sign(&params, &self.api_secret);
        params.insert("api_sig", signature);
        // Not part of the signature.
        params.insert("format", "json".to_string());
        params
    }
}

/// Last.fm request signature: md5 over the sorted `key value` pairs followed
/// by the shared secret.
fn sign(params: &BTreeMap<&'static str, String>, secret: &str) -> String {
    let mut payload = String::new();
    for (key, value) in params {
        payload.push_str(key);
        payload.push_str(value);
    }
    payload.push_str(secret);
    format!("{:x}", md5::compute(payload.as_bytes()))
}

/// Pull `error`/`message` out of a Last.fm JSON response, if present.
fn api_error(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;
    let code = json.get("error")?;
    let message = json
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    Some(format!("error {code}: {message}"))
}

#[async_trait]
impl Sink for LastFmSink {
    fn name(&self) -> &str {
        "lastfm"
    }

    async fn deliver(&self, event: &ScrobbleEvent) -> Result<(), SinkError> {
        debug!("Scrobbling to Last.fm: {} - {}", event.artist, event.title);

        let response = self
            .client
            .post(&self.api_url)
            .form(&self.scrobble_params(event))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if let Some(err) = api_error(&body) {
            return Err(SinkError::Rejected(err));
        }
        if !status.is_success() {
            return Err(SinkError::Http(format!("{status}: {body}")));
        }

        debug!("Last.fm accepted {} - {}", event.artist, event.title);
        Ok(())
    }
}
