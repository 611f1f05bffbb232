//! ListenBrainz scrobbling
//! API Documentation: https://listenbrainz.readthedocs.io/

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::Sink;
use crate::error::SinkError;
use crate::track::ScrobbleEvent;

/// Submits listens to a ListenBrainz server with a user token.
pub struct ListenBrainzSink {
    token: String,
    api_url: String,
    client: Client,
}

impl ListenBrainzSink {
    #[must_use]
    pub fn new(token: String, api_url: String) -> Self {
        Self {
            token,
            api_url: api_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn submit_url(&self) -> String {
        format!("{}/1/submit-listens", self.api_url)
    }
}

/// `submit-listens` body for a single completed listen.
fn listen_payload(event: &ScrobbleEvent) -> Value {
    let mut track_metadata = json!({
        "artist_name": event.artist,
        "track_name": event.title,
        "additional_info": {
            "submission_client": crate::APP_NAME,
            "submission_client_version": crate::VERSION,
            "media_player": event.player_name.as_deref().unwrap_or(event.player_id.as_str()),
        },
    });

    if let Some(ref album) = event.album {
        track_metadata["release_name"] = json!(album);
    }
    if let Some(duration) = event.duration_seconds {
        track_metadata["additional_info"]["duration_ms"] = json!(duration * 1000);
    }

    json!({
        "listen_type": "single",
        "payload": [{
            "listened_at": event.started_at.timestamp(),
            "track_metadata": track_metadata,
        }]
    })
}

#[async_trait]
impl Sink for ListenBrainzSink {
    fn name(&self) -> &str {
        "listenbrainz"
    }

    async fn deliver(&self, event: &ScrobbleEvent) -> Result<(), SinkError> {
        debug!("Submitting listen to ListenBrainz: {} - {}", event.artist, event.title);

        let response = self
            .client
            .post(self.submit_url())
            .header("Authorization", format!("Token {}", self.token))
            .json(&listen_payload(event))
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected(format!("{status}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Http(format!("{status}: {body}")));
        }

        debug!("ListenBrainz accepted {} - {}", event.artist, event.title);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::tests::event;

    #[test]
    fn test_payload_shape() {
        let e = event();
        let payload = listen_payload(&e);

        assert_eq!(payload["listen_type"], "single");
        let listen = &payload["payload"][0];
        assert_eq!(listen["listened_at"], e.started_at.timestamp());
        assert_eq!(listen["track_metadata"]["artist_name"], "Artist A");
        assert_eq!(listen["track_metadata"]["track_name"], "Song X");
        assert_eq!(listen["track_metadata"]["release_name"], "Album Z");
        assert_eq!(
            listen["track_metadata"]["additional_info"]["duration_ms"],
            200_000
        );
        assert_eq!(
            listen["track_metadata"]["additional_info"]["media_player"],
            "Living Room"
        );
    }

    #[test]
    fn test_payload_without_album() {
        let mut e = event();
        e.album = None;
        e.duration_seconds = None;
        let payload = listen_payload(&e);
        let metadata = &payload["payload"][0]["track_metadata"];
        assert!(metadata.get("release_name").is_none());
        assert!(metadata["additional_info"].get("duration_ms").is_none());
    }

    #[test]
    fn test_submit_url_strips_trailing_slash() {
        let sink = ListenBrainzSink::new("tok".into(), "https://lb.example.org/".into());
        assert_eq!(sink.submit_url(), "https://lb.example.org/1/submit-listens");
    }
}
