pub mod playback;
pub mod playlist;

pub use playback::{CurrentlyPlaying, PlaybackAction, PlaybackState};
pub use playlist::{NewTrack, PlaylistEntry, TrackId, TrackKey};
