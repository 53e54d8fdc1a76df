mod support;

use std::sync::Arc;
use std::time::Duration;

use meet_signaling::engine::mock::{EngineCall, FailPoint, MOCK_OFFER_SDP, MockEngine};
use meet_signaling::protocol::{IceCandidate, SessionDescription};
use meet_signaling::{
    EngineConnectionState, EngineEvent, JoinError, NegotiationConfig, NegotiationError,
    NegotiationRole, RoomClient, SessionCoordinator, SessionError, SessionOutcome, sdp,
};
use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

use support::{Hit, MockRendezvous, WAIT};

const REMOTE_ANSWER: &str = "v=0\r\n\
m=audio 9 RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 RTP/SAVPF 100 96\r\n\
a=rtpmap:100 H264/90000\r\n\
a=rtpmap:96 VP8/90000\r\n";

fn coordinator(server: &MockRendezvous, engine: &MockEngine) -> SessionCoordinator {
    SessionCoordinator::new(
        RoomClient::new(server.base_url()),
        Arc::new(engine.clone()),
        NegotiationConfig::default(),
    )
}

#[tokio::test]
async fn initiator_session_runs_until_peer_leaves() {
    support::init_tracing();
    let server = Arc::new(MockRendezvous::start().await);
    server.set_join(server.join_response(true, &[])).await;
    let engine = MockEngine::new();

    let session = coordinator(&server, &engine);
    let run = tokio::spawn(async move { session.run("test-room", std::future::pending()).await });

    assert_eq!(server.next_hit().await, Hit::Join { room: "test-room".into() });
    match server.next_hit().await {
        Hit::Message { room, client, body } => {
            assert_eq!((room.as_str(), client.as_str()), ("test-room", "1001"));
            assert_eq!(body["type"], "offer");
            let expected = sdp::prefer_codec(MOCK_OFFER_SDP, "VP8");
            assert_eq!(body["sdp"], expected.as_str());
        }
        other => panic!("expected offer post, got {other:?}"),
    }
    assert_eq!(server.next_frame().await["cmd"], "register");
    assert_eq!(
        engine.ice_servers().first().map(|ice| ice.urls.clone()),
        Some(vec!["stun:stun.example.org:19302".to_string()])
    );

    sleep(Duration::from_millis(100)).await;
    let local = IceCandidate::new("audio", 0, "candidate:local");
    assert!(engine.emit(EngineEvent::IceCandidate(local)));
    assert_eq!(
        server.next_sent_message().await,
        json!({"type": "candidate", "id": "audio", "label": 0, "candidate": "candidate:local"})
    );

    server
        .push_message(json!({"type": "candidate", "id": "video", "label": 1, "candidate": "candidate:remote"}))
        .await;
    server
        .push_message(json!({"type": "answer", "sdp": REMOTE_ANSWER}))
        .await;
    assert!(engine.emit(EngineEvent::ConnectionState(EngineConnectionState::Connected)));
    sleep(Duration::from_millis(100)).await;
    server.push_message(json!({"type": "bye"})).await;

    let summary = timeout(WAIT, run)
        .await
        .expect("session did not finish")
        .expect("session task panicked")
        .expect("session failed");
    assert_eq!(summary.outcome, SessionOutcome::RemoteClosed);
    assert_eq!(summary.role, NegotiationRole::Initiator);
    assert!(summary.connected);

    assert_eq!(server.next_sent_message().await, json!({"type": "bye"}));
    assert_eq!(
        server.next_hit().await,
        Hit::ChannelDelete {
            room: "test-room".into(),
            client: "1001".into()
        }
    );
    assert_eq!(
        server.next_hit().await,
        Hit::Leave {
            room: "test-room".into(),
            client: "1001".into()
        }
    );

    let calls = engine.calls();
    let set_remote = calls
        .iter()
        .position(|call| matches!(call, EngineCall::SetRemote(_)))
        .expect("remote description applied");
    let add = calls
        .iter()
        .position(|call| {
            *call == EngineCall::AddCandidate(IceCandidate::new("video", 1, "candidate:remote"))
        })
        .expect("remote candidate applied");
    assert!(set_remote < add);
    assert_eq!(calls.last(), Some(&EngineCall::Close));
}

#[tokio::test]
async fn responder_answers_stored_offer_over_channel() {
    let server = Arc::new(MockRendezvous::start().await);
    server
        .set_join(server.join_response(
            false,
            &[
                r#"{"type":"offer","sdp":"v=0\r\nm=audio 9 RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n"}"#,
                r#"{"type":"candidate","label":0,"id":"audio","candidate":"candidate:stored"}"#,
            ],
        ))
        .await;
    let engine = MockEngine::new();
    let session = coordinator(&server, &engine);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let run = tokio::spawn(async move {
        session
            .run("test-room", async {
                let _ = stop_rx.await;
            })
            .await
    });

    assert_eq!(server.next_frame().await["cmd"], "register");
    let answer = server.next_sent_message().await;
    assert_eq!(answer["type"], "answer");

    assert!(engine.emit(EngineEvent::ConnectionState(EngineConnectionState::Connected)));
    sleep(Duration::from_millis(100)).await;
    let _ = stop_tx.send(());

    let summary = timeout(WAIT, run)
        .await
        .expect("session did not finish")
        .expect("session task panicked")
        .expect("session failed");
    assert_eq!(summary.outcome, SessionOutcome::LocalShutdown);
    assert_eq!(summary.role, NegotiationRole::Responder);
    assert!(summary.connected);

    let calls = engine.calls();
    assert_eq!(
        calls[..2],
        [
            EngineCall::SetRemote(SessionDescription::offer(
                "v=0\r\nm=audio 9 RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\na=fmtp:111 maxaveragebitrate=32000\r\n"
            )),
            EngineCall::CreateAnswer,
        ]
    );
    assert!(matches!(calls[2], EngineCall::SetLocal(_)));
    assert_eq!(
        calls[3],
        EngineCall::AddCandidate(IceCandidate::new("audio", 0, "candidate:stored"))
    );
}

#[tokio::test]
async fn join_failure_ends_session_before_engine_exists() {
    let server = MockRendezvous::start().await;
    server.set_join(json!({ "result": "FULL" })).await;
    let engine = MockEngine::new();

    let err = coordinator(&server, &engine)
        .run("test-room", std::future::pending())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Join(JoinError::Refused(_))), "{err}");
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn negotiation_failure_tears_down_session() {
    let server = MockRendezvous::start().await;
    server.set_join(server.join_response(true, &[])).await;
    let engine = MockEngine::new();
    engine.fail_on(FailPoint::CreateOffer);

    let err = timeout(
        WAIT,
        coordinator(&server, &engine).run("test-room", std::future::pending()),
    )
    .await
    .expect("session did not finish")
    .unwrap_err();
    assert!(
        matches!(
            err,
            SessionError::Negotiation(NegotiationError::CreateDescription { .. })
        ),
        "{err}"
    );

    assert_eq!(server.next_hit().await, Hit::Join { room: "test-room".into() });
    loop {
        if let Hit::Leave { client, .. } = server.next_hit().await {
            assert_eq!(client, "1001");
            break;
        }
    }
    assert!(engine.is_closed());
}

#[tokio::test]
async fn rejected_post_is_a_channel_error() {
    let server = MockRendezvous::start().await;
    server.set_join(server.join_response(true, &[])).await;
    server.set_message_result("INVALID_ROOM").await;
    let engine = MockEngine::new();

    let err = timeout(
        WAIT,
        coordinator(&server, &engine).run("test-room", std::future::pending()),
    )
    .await
    .expect("session did not finish")
    .unwrap_err();
    assert!(
        matches!(err, SessionError::Channel(meet_signaling::ChannelError::Delivery(_))),
        "{err}"
    );
}
