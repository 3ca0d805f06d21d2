//! Session playback state
//!
//! Owns each session's playlist and currently-playing pointer. Mutations on one
//! session are serialized behind that session's mutex; different sessions never
//! contend. Media router work happens elsewhere and never runs under these
//! locks.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jamz_sfu::{ParticipantId, SessionId};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::models::{
    CurrentlyPlaying, NewTrack, PlaybackAction, PlaybackState, PlaylistEntry, TrackId,
};
use crate::{Error, Result};

/// State handed back by the storage collaborator on rehydration
#[derive(Debug, Clone, Default)]
pub struct StoredSession {
    pub playlist: Vec<PlaylistEntry>,
    pub currently_playing: Option<CurrentlyPlaying>,
}

/// Source of persisted session state.
///
/// Consulted once per session, the first time the store touches it. Failures
/// are surfaced to the caller and not cached.
#[async_trait]
pub trait SessionStateLoader: Send + Sync {
    async fn load(&self, session_id: &SessionId) -> Result<Option<StoredSession>>;
}

/// Result of [`SessionStateStore::add_track`]
#[derive(Debug, Clone, PartialEq)]
pub struct AddTrackOutcome {
    pub entry: PlaylistEntry,
    /// `false` when an entry with the same title and artist already existed
    pub created: bool,
}

struct SessionMusic {
    playlist: Vec<PlaylistEntry>,
    currently_playing: Option<CurrentlyPlaying>,
    controller: Option<ParticipantId>,
    is_playing: bool,
    position: f64,
    version: u64,
    updated_at: DateTime<Utc>,
}

impl SessionMusic {
    fn from_stored(stored: StoredSession) -> Self {
        Self {
            playlist: stored.playlist,
            currently_playing: stored.currently_playing,
            controller: None,
            is_playing: false,
            position: 0.0,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    fn snapshot(&self, session_id: &SessionId) -> PlaybackState {
        PlaybackState {
            session_id: session_id.clone(),
            playlist: self.playlist.clone(),
            currently_playing: self.currently_playing.clone(),
            controller: self.controller.clone(),
            is_playing: self.is_playing,
            position: self.position,
            version: self.version,
            updated_at: self.updated_at,
        }
    }

    fn index_of(&self, track_id: &str) -> Option<usize> {
        self.playlist.iter().position(|e| e.id == track_id)
    }

    fn current_index(&self) -> Option<usize> {
        self.currently_playing
            .as_ref()
            .and_then(|c| self.index_of(&c.entry.id))
    }

    /// The one place a track becomes current. Rejects entries without a URL
    /// and leaves state untouched in that case.
    fn set_current(&mut self, track_id: &str) -> Result<CurrentlyPlaying> {
        let entry = self
            .index_of(track_id)
            .and_then(|i| self.playlist.get(i))
            .ok_or_else(|| Error::NotFound(format!("track {track_id}")))?;

        let url = entry.playable_url().ok_or_else(|| {
            Error::InvariantViolation(format!(
                "track '{}' by '{}' has no playable url",
                entry.title, entry.artist
            ))
        })?;

        let current = CurrentlyPlaying {
            entry: entry.clone(),
            url: url.to_string(),
            started_at: Utc::now(),
        };
        self.currently_playing = Some(current.clone());
        self.position = 0.0;
        self.touch();
        Ok(current)
    }

    /// Walk from `start` in `step` direction, wrapping, to the first playable
    fn playable_from(&self, start: usize, step: isize) -> Option<usize> {
        let len = self.playlist.len() as isize;
        (0..len)
            .map(|offset| (start as isize + offset * step).rem_euclid(len) as usize)
            .find(|&i| self.playlist.get(i).is_some_and(PlaylistEntry::is_playable))
    }

    fn clear_current(&mut self) {
        self.currently_playing = None;
        self.is_playing = false;
        self.position = 0.0;
    }

    fn ensure_controller(&self, actor: &ParticipantId) -> Result<()> {
        match &self.controller {
            Some(controller) if controller != actor => Err(Error::PermissionDenied(format!(
                "playback is controlled by {controller}"
            ))),
            _ => Ok(()),
        }
    }

    fn control(&mut self, action: PlaybackAction) -> Result<()> {
        match action {
            PlaybackAction::Play { track_id, position } => {
                let position = position.map(checked_position).transpose()?;
                let target = match track_id {
                    Some(id) => Some(id),
                    None if self.currently_playing.is_some() => None,
                    None => Some(
                        self.playable_from(0, 1)
                            .and_then(|i| self.playlist.get(i))
                            .map(|e| e.id.clone())
                            .ok_or_else(|| {
                                Error::InvariantViolation(
                                    "playlist has no playable track".to_string(),
                                )
                            })?,
                    ),
                };
                if let Some(id) = target {
                    self.set_current(&id)?;
                }
                if let Some(position) = position {
                    self.position = position;
                }
                self.is_playing = true;
            }
            PlaybackAction::Pause { position } => {
                if let Some(position) = position {
                    self.position = checked_position(position)?;
                }
                self.is_playing = false;
            }
            PlaybackAction::Seek { position } => {
                if self.currently_playing.is_none() {
                    return Err(Error::InvalidInput("nothing is playing".to_string()));
                }
                self.position = checked_position(position)?;
            }
            PlaybackAction::Next | PlaybackAction::Previous => {
                if self.playlist.is_empty() {
                    return Err(Error::InvalidInput("playlist is empty".to_string()));
                }
                let last = self.playlist.len() - 1;
                let forward = matches!(action, PlaybackAction::Next);
                let start = match (self.current_index(), forward) {
                    (Some(i), true) => if i == last { 0 } else { i + 1 },
                    (Some(i), false) => if i == 0 { last } else { i - 1 },
                    (None, true) => 0,
                    (None, false) => last,
                };
                let target = self
                    .playable_from(start, if forward { 1 } else { -1 })
                    .and_then(|i| self.playlist.get(i))
                    .map(|e| e.id.clone())
                    .ok_or_else(|| {
                        Error::InvariantViolation("playlist has no playable track".to_string())
                    })?;
                self.set_current(&target)?;
                self.is_playing = true;
            }
        }
        self.touch();
        Ok(())
    }
}

fn checked_position(position: f64) -> Result<f64> {
    if position.is_finite() && position >= 0.0 {
        Ok(position)
    } else {
        Err(Error::InvalidInput(format!("invalid position {position}")))
    }
}

type SessionSlot = Arc<OnceCell<Arc<Mutex<SessionMusic>>>>;

/// Process-resident playback state for every active session
#[derive(Default)]
pub struct SessionStateStore {
    sessions: DashMap<SessionId, SessionSlot>,
    loader: Option<Arc<dyn SessionStateLoader>>,
}

impl std::fmt::Debug for SessionStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStateStore")
            .field("sessions", &self.sessions.len())
            .field("loader", &self.loader.is_some())
            .finish()
    }
}

impl SessionStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_loader(loader: Arc<dyn SessionStateLoader>) -> Self {
        Self {
            sessions: DashMap::new(),
            loader: Some(loader),
        }
    }

    /// Get the session's state, rehydrating it on first access
    async fn session(&self, session_id: &SessionId) -> Result<Arc<Mutex<SessionMusic>>> {
        let slot = Arc::clone(&self.sessions.entry(session_id.clone()).or_default());

        let loaded = slot
            .get_or_try_init(|| async {
                let stored = match &self.loader {
                    Some(loader) => loader.load(session_id).await.map_err(|e| match e {
                        Error::Upstream(msg) => Error::Upstream(msg),
                        other => Error::Upstream(other.to_string()),
                    })?,
                    None => None,
                };
                if let Some(stored) = &stored {
                    debug!(
                        session_id = %session_id,
                        tracks = stored.playlist.len(),
                        "Session state rehydrated"
                    );
                }
                Ok::<_, Error>(Arc::new(Mutex::new(SessionMusic::from_stored(
                    stored.unwrap_or_default(),
                ))))
            })
            .await;

        match loaded {
            Ok(music) => Ok(Arc::clone(music)),
            Err(e) => {
                self.sessions
                    .remove_if(session_id, |_, s| Arc::ptr_eq(s, &slot) && !s.initialized());
                warn!(session_id = %session_id, error = %e, "Failed to load session state");
                Err(e)
            }
        }
    }

    async fn mutate<T>(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut SessionMusic) -> Result<T>,
    ) -> Result<T> {
        let music = self.session(session_id).await?;
        let mut guard = music.lock().await;
        f(&mut guard)
    }

    /// Append a track unless one with the same title and artist exists, in
    /// which case the existing entry is returned unchanged.
    pub async fn add_track(
        &self,
        session_id: &SessionId,
        track: NewTrack,
        added_by: Option<ParticipantId>,
    ) -> Result<AddTrackOutcome> {
        if track.title.trim().is_empty() || track.artist.trim().is_empty() {
            return Err(Error::InvalidInput(
                "track title and artist are required".to_string(),
            ));
        }

        self.mutate(session_id, |music| {
            if let Some(existing) = music
                .playlist
                .iter()
                .find(|e| e.title == track.title && e.artist == track.artist)
            {
                return Ok(AddTrackOutcome {
                    entry: existing.clone(),
                    created: false,
                });
            }

            let entry = track.into_entry(added_by);
            music.playlist.push(entry.clone());
            music.touch();
            Ok(AddTrackOutcome {
                entry,
                created: true,
            })
        })
        .await
    }

    pub async fn remove_track(
        &self,
        session_id: &SessionId,
        track_id: &str,
    ) -> Result<PlaylistEntry> {
        self.mutate(session_id, |music| {
            let index = music
                .index_of(track_id)
                .ok_or_else(|| Error::NotFound(format!("track {track_id}")))?;
            let removed = music.playlist.remove(index);
            if music
                .currently_playing
                .as_ref()
                .is_some_and(|c| c.entry.id == removed.id)
            {
                music.clear_current();
            }
            music.touch();
            Ok(removed)
        })
        .await
    }

    /// Keep the first entry of every (title, artist) pair, in order.
    /// Returns how many entries were dropped.
    pub async fn deduplicate(&self, session_id: &SessionId) -> Result<usize> {
        let removed = self
            .mutate(session_id, |music| {
                let before = music.playlist.len();
                let mut seen = HashSet::with_capacity(before);
                music.playlist.retain(|e| seen.insert(e.key()));
                let removed = before - music.playlist.len();
                if removed == 0 {
                    return Ok(0);
                }

                // Repoint the current track at the surviving copy
                if let Some(current) = &music.currently_playing {
                    if music.index_of(&current.entry.id).is_none() {
                        let survivor = music
                            .playlist
                            .iter()
                            .find(|e| e.same_track(&current.entry))
                            .cloned();
                        match survivor {
                            Some(entry) => {
                                if let Some(current) = music.currently_playing.as_mut() {
                                    if let Some(url) = entry.playable_url() {
                                        current.url = url.to_string();
                                    }
                                    current.entry = entry;
                                }
                            }
                            None => music.clear_current(),
                        }
                    }
                }
                music.touch();
                Ok(removed)
            })
            .await?;

        if removed > 0 {
            info!(session_id = %session_id, removed, "Removed duplicate playlist entries");
        }
        Ok(removed)
    }

    /// Fill in missing URLs from each entry's sources. Entries with no source
    /// stay unplayable. Returns how many entries gained a URL.
    pub async fn resolve_missing_urls(&self, session_id: &SessionId) -> Result<usize> {
        self.mutate(session_id, |music| {
            let resolved = music
                .playlist
                .iter_mut()
                .map(PlaylistEntry::resolve_url)
                .filter(|changed| *changed)
                .count();
            if resolved > 0 {
                music.touch();
            }
            Ok(resolved)
        })
        .await
    }

    /// Point the session at a track. Fails without touching state if the
    /// track has no resolved URL.
    pub async fn set_currently_playing(
        &self,
        session_id: &SessionId,
        track_id: &str,
    ) -> Result<CurrentlyPlaying> {
        self.mutate(session_id, |music| music.set_current(track_id))
            .await
    }

    /// Repair: drop a currently-playing pointer whose URL is empty
    pub async fn clear_invalid_currently_playing(&self, session_id: &SessionId) -> Result<bool> {
        let cleared = self
            .mutate(session_id, |music| {
                let invalid = music
                    .currently_playing
                    .as_ref()
                    .is_some_and(|c| !c.is_valid());
                if invalid {
                    music.clear_current();
                    music.touch();
                }
                Ok(invalid)
            })
            .await?;

        if cleared {
            warn!(session_id = %session_id, "Cleared currently playing track without url");
        }
        Ok(cleared)
    }

    /// Apply a transport control on behalf of `actor`
    pub async fn control(
        &self,
        session_id: &SessionId,
        action: PlaybackAction,
        actor: &ParticipantId,
    ) -> Result<PlaybackState> {
        self.mutate(session_id, |music| {
            music.ensure_controller(actor)?;
            music.control(action)?;
            Ok(music.snapshot(session_id))
        })
        .await
    }

    /// Make `participant` the session's controller
    pub async fn take_control(
        &self,
        session_id: &SessionId,
        participant: &ParticipantId,
    ) -> Result<PlaybackState> {
        self.mutate(session_id, |music| {
            music.ensure_controller(participant)?;
            if music.controller.as_ref() != Some(participant) {
                music.controller = Some(participant.clone());
                music.touch();
            }
            Ok(music.snapshot(session_id))
        })
        .await
    }

    /// Give up control. Returns `false` if `participant` was not the controller.
    pub async fn release_control(
        &self,
        session_id: &SessionId,
        participant: &ParticipantId,
    ) -> Result<bool> {
        self.mutate(session_id, |music| {
            if music.controller.as_ref() != Some(participant) {
                return Ok(false);
            }
            music.controller = None;
            music.touch();
            Ok(true)
        })
        .await
    }

    /// Hand the current state to `publish` while the session is locked.
    ///
    /// Publishers are serialized with every mutation, so whatever `publish`
    /// queues is queued in version order. `publish` must not block.
    pub async fn with_snapshot<R>(
        &self,
        session_id: &SessionId,
        publish: impl FnOnce(PlaybackState) -> R,
    ) -> Result<R> {
        self.mutate(session_id, |music| Ok(publish(music.snapshot(session_id))))
            .await
    }

    /// Whether state for the session is resident
    #[must_use]
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|slot| slot.initialized())
    }

    /// Drop resident state. The loader rebuilds it on next access.
    pub fn evict(&self, session_id: &SessionId) -> bool {
        let evicted = self.sessions.remove(session_id).is_some();
        if evicted {
            debug!(session_id = %session_id, "Session state evicted");
        }
        evicted
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sid(s: &str) -> SessionId {
        SessionId::from(s)
    }

    async fn snapshot(store: &SessionStateStore, s: &SessionId) -> Result<PlaybackState> {
        store.with_snapshot(s, |state| state).await
    }

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::from(s)
    }

    fn entry(id: &str, title: &str, artist: &str, url: Option<&str>) -> PlaylistEntry {
        PlaylistEntry {
            id: id.to_string(),
            title: title.to_string(),
            artist: artist.to_string(),
            album: None,
            duration: None,
            file_url: None,
            video_url: None,
            preview_url: None,
            url: url.map(str::to_string),
            added_by: None,
            added_at: Utc::now(),
        }
    }

    struct FixedLoader(StoredSession);

    #[async_trait]
    impl SessionStateLoader for FixedLoader {
        async fn load(&self, _session_id: &SessionId) -> Result<Option<StoredSession>> {
            Ok(Some(self.0.clone()))
        }
    }

    fn store_with(playlist: Vec<PlaylistEntry>) -> SessionStateStore {
        SessionStateStore::with_loader(Arc::new(FixedLoader(StoredSession {
            playlist,
            currently_playing: None,
        })))
    }

    fn titles(state: &PlaybackState) -> Vec<(&str, &str)> {
        state
            .playlist
            .iter()
            .map(|e| (e.title.as_str(), e.artist.as_str()))
            .collect()
    }

    #[tokio::test]
    async fn test_deduplicate_keeps_first_occurrence() {
        let store = store_with(vec![
            entry("1", "A", "X", Some("u1")),
            entry("2", "B", "Y", Some("u2")),
            entry("3", "A", "X", Some("u3")),
        ]);
        let s = sid("s1");

        assert_eq!(store.deduplicate(&s).await.unwrap(), 1);
        let state = snapshot(&store, &s).await.unwrap();
        assert_eq!(titles(&state), vec![("A", "X"), ("B", "Y")]);
        assert_eq!(state.playlist[0].id, "1");

        assert_eq!(store.deduplicate(&s).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deduplicate_repoints_current_track() {
        let store = store_with(vec![
            entry("1", "A", "X", Some("u1")),
            entry("2", "A", "X", Some("u2")),
        ]);
        let s = sid("s1");
        store.set_currently_playing(&s, "2").await.unwrap();

        store.deduplicate(&s).await.unwrap();
        let state = snapshot(&store, &s).await.unwrap();
        let current = state.currently_playing.unwrap();
        assert_eq!(current.entry.id, "1");
        assert_eq!(current.url, "u1");
    }

    #[tokio::test]
    async fn test_add_track_is_idempotent() {
        let store = SessionStateStore::new();
        let s = sid("s1");

        let first = store
            .add_track(&s, NewTrack::new("A", "X").with_file_url("/a"), Some(pid("p1")))
            .await
            .unwrap();
        let second = store
            .add_track(&s, NewTrack::new("A", "X").with_video_url("v"), Some(pid("p2")))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.entry, second.entry);
        assert_eq!(snapshot(&store, &s).await.unwrap().playlist.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_adds_of_same_track_yield_one_entry() {
        let store = Arc::new(SessionStateStore::new());
        let s = sid("s1");

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                let s = s.clone();
                tokio::spawn(async move {
                    store
                        .add_track(&s, NewTrack::new("A", "X"), Some(pid(&format!("p{i}"))))
                        .await
                        .unwrap()
                        .created
                })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(snapshot(&store, &s).await.unwrap().playlist.len(), 1);
    }

    #[tokio::test]
    async fn test_add_track_requires_title_and_artist() {
        let store = SessionStateStore::new();
        let err = store
            .add_track(&sid("s1"), NewTrack::new("", "X"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_resolve_missing_urls_uses_source_priority() {
        let mut preview_only = entry("1", "A", "X", None);
        preview_only.preview_url = Some("https://preview/a".to_string());
        let mut file_and_video = entry("2", "B", "Y", None);
        file_and_video.file_url = Some("/uploads/b.mp3".to_string());
        file_and_video.video_url = Some("https://video/b".to_string());
        let nothing = entry("3", "C", "Z", None);

        let store = store_with(vec![preview_only, file_and_video, nothing]);
        let s = sid("s1");

        assert_eq!(store.resolve_missing_urls(&s).await.unwrap(), 2);
        let state = snapshot(&store, &s).await.unwrap();
        assert_eq!(state.playlist[0].url.as_deref(), Some("https://preview/a"));
        assert_eq!(state.playlist[1].url.as_deref(), Some("/uploads/b.mp3"));
        assert_eq!(state.playlist[2].url, None);

        let err = store.set_currently_playing(&s, "3").await.unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_set_currently_playing_rejects_empty_url() {
        let store = store_with(vec![
            entry("1", "A", "X", Some("u1")),
            entry("2", "B", "Y", Some("")),
        ]);
        let s = sid("s1");

        let err = store.set_currently_playing(&s, "2").await.unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert!(snapshot(&store, &s).await.unwrap().currently_playing.is_none());

        store.set_currently_playing(&s, "1").await.unwrap();
        let version = snapshot(&store, &s).await.unwrap().version;

        assert!(store.set_currently_playing(&s, "2").await.is_err());
        let state = snapshot(&store, &s).await.unwrap();
        assert_eq!(state.currently_playing.unwrap().entry.id, "1");
        assert_eq!(state.version, version);
    }

    #[tokio::test]
    async fn test_clear_invalid_currently_playing() {
        let stale = entry("1", "A", "X", None);
        let store = SessionStateStore::with_loader(Arc::new(FixedLoader(StoredSession {
            playlist: vec![stale.clone()],
            currently_playing: Some(CurrentlyPlaying {
                entry: stale,
                url: String::new(),
                started_at: Utc::now(),
            }),
        })));
        let s = sid("s1");

        assert!(store.clear_invalid_currently_playing(&s).await.unwrap());
        assert!(snapshot(&store, &s).await.unwrap().currently_playing.is_none());
        assert!(!store.clear_invalid_currently_playing(&s).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_current_track_clears_pointer() {
        let store = store_with(vec![entry("1", "A", "X", Some("u1"))]);
        let s = sid("s1");
        store
            .control(&s, PlaybackAction::Play { track_id: None, position: None }, &pid("p1"))
            .await
            .unwrap();

        let removed = store.remove_track(&s, "1").await.unwrap();
        assert_eq!(removed.id, "1");
        let state = snapshot(&store, &s).await.unwrap();
        assert!(state.currently_playing.is_none());
        assert!(!state.is_playing);

        let err = store.remove_track(&s, "1").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_next_and_previous_wrap_and_skip_unplayable() {
        let store = store_with(vec![
            entry("1", "A", "X", Some("u1")),
            entry("2", "B", "Y", None),
            entry("3", "C", "Z", Some("u3")),
        ]);
        let s = sid("s1");
        let p = pid("p1");

        let state = store.control(&s, PlaybackAction::Next, &p).await.unwrap();
        assert_eq!(state.currently_playing.unwrap().entry.id, "1");

        let state = store.control(&s, PlaybackAction::Next, &p).await.unwrap();
        assert_eq!(state.currently_playing.unwrap().entry.id, "3");

        let state = store.control(&s, PlaybackAction::Next, &p).await.unwrap();
        assert_eq!(state.currently_playing.unwrap().entry.id, "1");

        let state = store.control(&s, PlaybackAction::Previous, &p).await.unwrap();
        assert_eq!(state.currently_playing.unwrap().entry.id, "3");
        assert!(state.is_playing);
    }

    #[tokio::test]
    async fn test_play_pause_seek() {
        let store = store_with(vec![entry("1", "A", "X", None), entry("2", "B", "Y", Some("u2"))]);
        let s = sid("s1");
        let p = pid("p1");

        let err = store
            .control(&s, PlaybackAction::Seek { position: 3.0 }, &p)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let state = store
            .control(&s, PlaybackAction::Play { track_id: None, position: None }, &p)
            .await
            .unwrap();
        assert_eq!(state.currently_playing.as_ref().unwrap().entry.id, "2");
        assert!(state.is_playing);

        let state = store
            .control(&s, PlaybackAction::Pause { position: Some(12.5) }, &p)
            .await
            .unwrap();
        assert!(!state.is_playing);
        assert!((state.position - 12.5).abs() < f64::EPSILON);

        let err = store
            .control(&s, PlaybackAction::Seek { position: -1.0 }, &p)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let state = store
            .control(&s, PlaybackAction::Play { track_id: None, position: None }, &p)
            .await
            .unwrap();
        assert!(state.is_playing);
        assert!((state.position - 12.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_controller_gates_playback() {
        let store = store_with(vec![entry("1", "A", "X", Some("u1"))]);
        let s = sid("s1");
        let (dj, other) = (pid("dj"), pid("other"));

        store.take_control(&s, &dj).await.unwrap();
        let err = store.take_control(&s, &other).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        let err = store
            .control(&s, PlaybackAction::Next, &other)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        store.control(&s, PlaybackAction::Next, &dj).await.unwrap();

        assert!(!store.release_control(&s, &other).await.unwrap());
        assert!(store.release_control(&s, &dj).await.unwrap());
        store.control(&s, PlaybackAction::Next, &other).await.unwrap();
    }

    #[tokio::test]
    async fn test_version_increases_only_on_change() {
        let store = SessionStateStore::new();
        let s = sid("s1");

        let v0 = snapshot(&store, &s).await.unwrap().version;
        store.add_track(&s, NewTrack::new("A", "X"), None).await.unwrap();
        let v1 = snapshot(&store, &s).await.unwrap().version;
        store.add_track(&s, NewTrack::new("A", "X"), None).await.unwrap();
        let v2 = snapshot(&store, &s).await.unwrap().version;

        assert!(v1 > v0);
        assert_eq!(v1, v2);
    }

    #[tokio::test]
    async fn test_concurrent_publishers_queue_in_version_order() {
        let store = Arc::new(SessionStateStore::new());
        let s = sid("s1");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            let tx = tx.clone();
            let s = s.clone();
            tasks.push(tokio::spawn(async move {
                let track = NewTrack {
                    title: format!("T{i}"),
                    artist: "X".to_string(),
                    ..NewTrack::default()
                };
                store.add_track(&s, track, None).await.unwrap();
                tokio::task::yield_now().await;
                store
                    .with_snapshot(&s, |state| tx.send(state.version))
                    .await
                    .unwrap()
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        drop(tx);

        let mut versions = Vec::new();
        while let Some(v) = rx.recv().await {
            versions.push(v);
        }
        assert_eq!(versions.len(), 16);
        assert!(versions.windows(2).all(|w| w[0] <= w[1]), "{versions:?}");
        assert_eq!(versions.last(), Some(&16));
    }

    struct FlakyLoader {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionStateLoader for FlakyLoader {
        async fn load(&self, _session_id: &SessionId) -> Result<Option<StoredSession>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::Internal("storage unreachable".to_string()));
            }
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_loader_failure_is_returned_once_and_not_cached() {
        let loader = Arc::new(FlakyLoader {
            calls: AtomicUsize::new(0),
        });
        let store = SessionStateStore::with_loader(loader.clone());
        let s = sid("s1");

        let err = snapshot(&store, &s).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
        assert!(!store.contains(&s));

        snapshot(&store, &s).await.unwrap();
        assert!(store.contains(&s));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_evict_forces_rehydration() {
        let store = store_with(vec![entry("1", "A", "X", Some("u1"))]);
        let s = sid("s1");

        store.add_track(&s, NewTrack::new("B", "Y"), None).await.unwrap();
        assert_eq!(snapshot(&store, &s).await.unwrap().playlist.len(), 2);

        assert!(store.evict(&s));
        assert!(!store.evict(&s));
        assert_eq!(snapshot(&store, &s).await.unwrap().playlist.len(), 1);
    }
}
