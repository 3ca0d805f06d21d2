use jamz_core::config::RateLimitConfig;
use jamz_core::models::{NewTrack, PlaybackAction};
use jamz_core::service::{
    ConnectionId, MessageKind, RateLimiter, SessionStateStore, SignalingValidator,
};
use jamz_core::{Error, ParticipantId, SessionId};
use serde_json::json;

#[test]
fn default_buckets_admit_capacity_then_reject() {
    let config = RateLimitConfig::default();
    let limiter = RateLimiter::new(&config).unwrap();
    let conn = ConnectionId::from("c1");

    for (kind, capacity) in [
        (MessageKind::Candidate, config.candidate.capacity),
        (MessageKind::MusicSync, config.music_sync.capacity),
        (MessageKind::Negotiation, config.negotiation.capacity),
    ] {
        for i in 0..capacity {
            assert!(limiter.check(&conn, kind).is_ok(), "{kind} message {i} rejected");
        }
        assert!(limiter.check(&conn, kind).is_err(), "{kind} over capacity admitted");
    }

    let counts = limiter.rejections();
    assert_eq!(
        (counts.candidates, counts.music_sync, counts.negotiation),
        (1, 1, 1)
    );
}

#[tokio::test]
async fn music_sync_flow_from_raw_payloads() {
    let validator = SignalingValidator::default();
    let store = SessionStateStore::new();
    let dj = ParticipantId::from("dj");

    let payload = json!({
        "session_id": "room-7",
        "action": "add-track",
        "track": {"title": "Song", "artist": "Band", "previewUrl": "https://p/song"}
    });
    let session = validator.require_session_id(&payload, Some(&dj)).unwrap();
    assert_eq!(session, SessionId::from("room-7"));

    let track: NewTrack = serde_json::from_value(payload["track"].clone()).unwrap();
    let added = store.add_track(&session, track, Some(dj.clone())).await.unwrap();
    assert_eq!(added.entry.url.as_deref(), Some("https://p/song"));

    let unplayable = store
        .add_track(&session, NewTrack::new("Silent", "Nobody"), Some(dj.clone()))
        .await
        .unwrap();
    let err = store
        .control(
            &session,
            PlaybackAction::Play {
                track_id: Some(unplayable.entry.id.clone()),
                position: None,
            },
            &dj,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(_)));

    let state = store
        .control(&session, PlaybackAction::Play { track_id: None, position: None }, &dj)
        .await
        .unwrap();
    let current = state.currently_playing.unwrap();
    assert_eq!(current.entry.title, "Song");
    assert_eq!(current.url, "https://p/song");
}
