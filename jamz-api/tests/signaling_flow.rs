//! Two sessions sharing one gateway: call-setup stays inside its session

use std::sync::Arc;

use jamz_api::protocol::ServerEvent;
use jamz_api::{ConnectionHandle, SignalingContext, SignalingGateway};
use jamz_core::service::SessionStateStore;
use jamz_core::Config;
use jamz_sfu::{fatal_channel, MediaWorkerPool, SessionId};
use serde_json::json;

async fn gateway() -> SignalingGateway {
    let mut config = Config::default();
    config.media.worker_count = 2;
    let (fatal_tx, _fatal_rx) = fatal_channel();
    let pool = MediaWorkerPool::create_workers(config.media.to_pool_config().unwrap(), fatal_tx)
        .await
        .unwrap();
    let context = Arc::new(SignalingContext::from_config(&config));
    SignalingGateway::new(&config, pool, Arc::new(SessionStateStore::new()), context).unwrap()
}

fn drain(conn: &mut ConnectionHandle) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = conn.outbound.try_recv() {
        out.push(event);
    }
    out
}

async fn send(gw: &SignalingGateway, conn: &ConnectionHandle, event: &str, data: serde_json::Value) {
    let frame = json!({ "event": event, "data": data }).to_string();
    gw.handle_text(&conn.id, &frame).await;
}

#[tokio::test]
async fn call_setup_is_scoped_to_session() {
    let gw = gateway().await;
    let mut a = gw.connect();
    let mut b = gw.connect();
    let mut c = gw.connect();

    send(&gw, &a, "join-audio-session", json!({"sessionId": "s1"})).await;
    send(&gw, &b, "join-audio-session", json!({"sessionId": "s1"})).await;
    send(&gw, &c, "join-audio-session", json!({"sessionId": "s2"})).await;

    let s1 = SessionId::from("s1");
    let s2 = SessionId::from("s2");
    let router_a = gw.pool().router_for(&s1).unwrap();
    let router_c = gw.pool().router_for(&s2).unwrap();
    assert_ne!(router_a.id, router_c.id);
    assert!(gw.pool().transport_for(&s1, &a.id).is_some());
    assert!(gw.pool().transport_for(&s1, &b.id).is_some());

    // B's join result lists A; A hears about B
    let b_events = drain(&mut b);
    let joined = b_events
        .iter()
        .find_map(|e| match e {
            ServerEvent::SessionJoined(joined) => Some(joined),
            _ => None,
        })
        .unwrap();
    assert_eq!(joined.participants, vec![a.id.clone()]);
    assert!(drain(&mut a)
        .iter()
        .any(|e| matches!(e, ServerEvent::ParticipantJoined(p) if p.participant_id == b.id)));
    drain(&mut c);

    send(&gw, &a, "webrtc-offer", json!({"sessionId": "s1", "offer": {"type": "offer", "sdp": "v=0"}})).await;
    send(&gw, &b, "webrtc-answer", json!({"sessionId": "s1", "answer": {"type": "answer", "sdp": "v=0"}})).await;
    send(&gw, &a, "webrtc-candidate", json!({"sessionId": "s1", "candidate": {"candidate": "host"}})).await;

    let to_b = drain(&mut b);
    assert_eq!(to_b.len(), 2);
    match &to_b[0] {
        ServerEvent::WebrtcOffer(signal) => {
            assert_eq!(signal.from, a.id);
            assert_eq!(signal.session_id, s1);
            assert_eq!(signal.payload["offer"]["sdp"], "v=0");
            assert!(!signal.payload.contains_key("sessionId"));
        }
        other => panic!("expected offer, got {other:?}"),
    }
    assert!(matches!(to_b[1], ServerEvent::WebrtcCandidate(_)));

    let to_a = drain(&mut a);
    assert_eq!(to_a.len(), 1);
    assert!(matches!(&to_a[0], ServerEvent::WebrtcAnswer(signal) if signal.from == b.id));

    assert!(drain(&mut c).is_empty());

    // C cannot reach into s1 by naming it
    send(&gw, &c, "webrtc-offer", json!({"sessionId": "s1", "offer": {"sdp": "x"}})).await;
    assert!(drain(&mut a).is_empty());
    assert!(drain(&mut b).is_empty());
}

#[tokio::test]
async fn relayed_sender_cannot_be_spoofed() {
    let gw = gateway().await;
    let mut a = gw.connect();
    let mut b = gw.connect();
    send(&gw, &a, "join-audio-session", json!({"sessionId": "s1"})).await;
    send(&gw, &b, "join-audio-session", json!({"sessionId": "s1"})).await;
    drain(&mut a);
    drain(&mut b);

    send(
        &gw,
        &a,
        "webrtc-offer",
        json!({"sessionId": "s1", "offer": {"type": "offer", "sdp": "v=0"}, "from": "victim"}),
    )
    .await;

    let to_b = drain(&mut b);
    assert_eq!(to_b.len(), 1);
    // Checked on the serialized text, as written to the socket
    let text = serde_json::to_string(&to_b[0]).unwrap();
    assert_eq!(text.matches("\"from\"").count(), 1);
    let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(frame["event"], "webrtc-offer");
    assert_eq!(frame["data"]["from"], a.id.as_str());
    assert_eq!(frame["data"]["offer"]["sdp"], "v=0");
}

#[tokio::test]
async fn targeted_relay_reaches_only_target() {
    let gw = gateway().await;
    let mut a = gw.connect();
    let mut b = gw.connect();
    let mut d = gw.connect();
    for conn in [&a, &b, &d] {
        send(&gw, conn, "join-audio-session", json!({"sessionId": "s1"})).await;
    }
    drain(&mut a);
    drain(&mut b);
    drain(&mut d);

    send(
        &gw,
        &a,
        "webrtc-offer",
        json!({"sessionId": "s1", "to": d.id.as_str(), "offer": {"sdp": "x"}}),
    )
    .await;

    assert!(drain(&mut b).is_empty());
    match drain(&mut d).as_slice() {
        [ServerEvent::WebrtcOffer(signal)] => assert!(!signal.payload.contains_key("to")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn last_leave_destroys_router_and_state() {
    let gw = gateway().await;
    let mut a = gw.connect();
    send(&gw, &a, "join-audio-session", json!({"sessionId": "s1"})).await;
    send(
        &gw,
        &a,
        "music-sync",
        json!({"sessionId": "s1", "action": "add-track", "track": {"title": "T", "artist": "A", "url": "/t.mp3"}}),
    )
    .await;
    drain(&mut a);

    let s1 = SessionId::from("s1");
    assert!(gw.store().contains(&s1));

    send(&gw, &a, "leave-audio-session", json!({"sessionId": "s1"})).await;
    assert!(gw.pool().router_for(&s1).is_none());
    assert!(!gw.store().contains(&s1));

    // Rejoining builds a fresh router
    send(&gw, &a, "join-audio-session", json!({"sessionId": "s1"})).await;
    assert!(gw.pool().router_for(&s1).is_some());
    match drain(&mut a).as_slice() {
        [ServerEvent::SessionJoined(joined)] => {
            assert!(joined.playback.as_ref().unwrap().playlist.is_empty());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn switching_sessions_leaves_the_old_one() {
    let gw = gateway().await;
    let mut a = gw.connect();
    let mut b = gw.connect();
    send(&gw, &a, "join-audio-session", json!({"sessionId": "s1"})).await;
    send(&gw, &b, "join-audio-session", json!({"sessionId": "s1"})).await;
    drain(&mut a);

    send(&gw, &b, "join-audio-session", json!({"sessionId": "s2"})).await;

    assert!(drain(&mut a)
        .iter()
        .any(|e| matches!(e, ServerEvent::ParticipantLeft(p) if p.participant_id == b.id)));
    assert_eq!(gw.hub().participants(&SessionId::from("s1")), vec![a.id.clone()]);
    assert!(gw.pool().transport_for(&SessionId::from("s1"), &b.id).is_none());
    assert!(gw.pool().transport_for(&SessionId::from("s2"), &b.id).is_some());
    drain(&mut b);
}
