use serde::{Deserialize, Serialize};

/// Discrete transport state of a player.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// No active decoder; initial and terminal state.
    #[default]
    Stopped,
    /// Audio is being rendered.
    Playing,
    /// Output is suspended and elapsed time is frozen.
    Paused,
}

/// Caller-supplied description of a track.
///
/// The player never fetches metadata itself; whatever the catalog layer hands in is echoed
/// back through status snapshots.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackMetadata {
    /// Catalog identifier, if any.
    pub id: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    /// Track duration in milliseconds when the catalog knows it.
    pub duration_ms: Option<u64>,
}

/// Point-in-time playback status snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerStatus {
    pub state: PlaybackState,
    /// Elapsed position in milliseconds, derived from the wall-clock anchor.
    pub elapsed_ms: u64,
    /// Total duration in milliseconds; `None` when unknown.
    pub duration_ms: Option<u64>,
    /// Output volume percent (0..=100).
    pub volume: u8,
    /// `true` while a seek is settling.
    pub seeking: bool,
    /// Zero-based index of the current track within the logical playlist.
    pub playlist_pos: u32,
    /// Number of tracks known to the player (current plus queued next).
    pub playlist_len: u32,
    /// Locator of the current track.
    pub now_playing: Option<String>,
    /// Metadata of the current track.
    pub track: Option<TrackMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_state_serializes_snake_case() {
        let json = serde_json::to_string(&PlaybackState::Playing).unwrap();
        assert_eq!(json, "\"playing\"");
        let state: PlaybackState = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(state, PlaybackState::Paused);
    }

    #[test]
    fn default_status_is_stopped_and_empty() {
        let status = PlayerStatus::default();
        assert_eq!(status.state, PlaybackState::Stopped);
        assert_eq!(status.elapsed_ms, 0);
        assert!(status.duration_ms.is_none());
        assert!(status.track.is_none());
    }

    #[test]
    fn status_roundtrips_through_json() {
        let status = PlayerStatus {
            state: PlaybackState::Paused,
            elapsed_ms: 30_250,
            duration_ms: Some(180_000),
            volume: 80,
            seeking: false,
            playlist_pos: 1,
            playlist_len: 2,
            now_playing: Some("http://example/b.flac".to_string()),
            track: Some(TrackMetadata {
                title: Some("B".to_string()),
                duration_ms: Some(180_000),
                ..TrackMetadata::default()
            }),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"state\":\"paused\""));
        let back: PlayerStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
