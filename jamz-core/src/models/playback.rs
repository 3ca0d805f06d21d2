use chrono::{DateTime, Utc};
use jamz_sfu::{ParticipantId, SessionId};
use serde::{Deserialize, Serialize};

use super::playlist::{PlaylistEntry, TrackId};

/// The track a session is playing. `url` is never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentlyPlaying {
    pub entry: PlaylistEntry,
    pub url: String,
    pub started_at: DateTime<Utc>,
}

impl CurrentlyPlaying {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

/// Canonical playback state broadcast after every accepted change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub session_id: SessionId,
    pub playlist: Vec<PlaylistEntry>,
    pub currently_playing: Option<CurrentlyPlaying>,
    pub controller: Option<ParticipantId>,
    pub is_playing: bool,
    /// Seconds into the current track
    pub position: f64,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Transport controls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PlaybackAction {
    /// Without a track: resume the current one, else start the first playable
    #[serde(rename_all = "camelCase")]
    Play {
        #[serde(default)]
        track_id: Option<TrackId>,
        #[serde(default)]
        position: Option<f64>,
    },
    Pause {
        #[serde(default)]
        position: Option<f64>,
    },
    Seek {
        position: f64,
    },
    Next,
    Previous,
}

impl PlaybackAction {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Play { .. } => "play",
            Self::Pause { .. } => "pause",
            Self::Seek { .. } => "seek",
            Self::Next => "next",
            Self::Previous => "previous",
        }
    }
}
