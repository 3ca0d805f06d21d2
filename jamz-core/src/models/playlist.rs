use chrono::{DateTime, Utc};
use jamz_sfu::ParticipantId;
use serde::{Deserialize, Serialize};

pub type TrackId = String;

/// Deduplication key. Case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackKey {
    pub title: String,
    pub artist: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistEntry {
    pub id: TrackId,
    pub title: String,
    pub artist: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Locally hosted file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// External video source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    /// Streaming-service preview clip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    /// Playable URL picked from the sources above
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_by: Option<ParticipantId>,
    pub added_at: DateTime<Utc>,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

impl PlaylistEntry {
    #[must_use]
    pub fn key(&self) -> TrackKey {
        TrackKey {
            title: self.title.clone(),
            artist: self.artist.clone(),
        }
    }

    #[must_use]
    pub fn same_track(&self, other: &Self) -> bool {
        self.title == other.title && self.artist == other.artist
    }

    /// Best source URL: local file, then video, then preview
    #[must_use]
    pub fn source_url(&self) -> Option<&str> {
        non_empty(self.file_url.as_ref())
            .or_else(|| non_empty(self.video_url.as_ref()))
            .or_else(|| non_empty(self.preview_url.as_ref()))
    }

    /// The resolved URL, if present and non-empty
    #[must_use]
    pub fn playable_url(&self) -> Option<&str> {
        non_empty(self.url.as_ref())
    }

    #[must_use]
    pub fn is_playable(&self) -> bool {
        self.playable_url().is_some()
    }

    /// Fill `url` from the sources if it is missing. Returns whether it changed.
    pub fn resolve_url(&mut self) -> bool {
        if self.is_playable() {
            return false;
        }
        match self.source_url().map(str::to_owned) {
            Some(url) => {
                self.url = Some(url);
                true
            }
            None => false,
        }
    }
}

/// Track submitted by a participant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTrack {
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl NewTrack {
    #[must_use]
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_file_url(mut self, url: impl Into<String>) -> Self {
        self.file_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_video_url(mut self, url: impl Into<String>) -> Self {
        self.video_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_preview_url(mut self, url: impl Into<String>) -> Self {
        self.preview_url = Some(url.into());
        self
    }

    /// Build the stored entry, resolving its URL from the sources
    #[must_use]
    pub fn into_entry(self, added_by: Option<ParticipantId>) -> PlaylistEntry {
        let mut entry = PlaylistEntry {
            id: nanoid::nanoid!(),
            title: self.title,
            artist: self.artist,
            album: self.album,
            duration: self.duration,
            file_url: self.file_url,
            video_url: self.video_url,
            preview_url: self.preview_url,
            url: self.url,
            added_by,
            added_at: Utc::now(),
        };
        entry.resolve_url();
        entry
    }
}
