//! Integration tests for the ephemeral chat service
//!
//! These drive the pairing engine through channel-backed connections and the
//! HTTP surface through `tower::ServiceExt::oneshot`:
//! - Concurrent connects never double-place anyone
//! - Round expiry, skip and reconnect flows end to end
//! - Random event sequences keep the single placement invariant

mod fixtures;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use ephemeral_chat::metrics::MetricsCollector;
use ephemeral_chat::pairing::{Delivery, Placement, RelayOutcome, CLOSE_REPLACED};
use ephemeral_chat::session::InMemorySessionStore;
use ephemeral_chat::transport::{create_router, ApiState};
use ephemeral_chat::types::{DisconnectPolicy, ServerMessage};
use fixtures::{test_engine, StaticSessionResolver, TestClient};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Duration;
use tower::ServiceExt; // for oneshot

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_pair_everyone_once() {
    let engine = test_engine(DisconnectPolicy::KeepUntilRoundEnds);
    let count = 64;

    let handles: Vec<_> = (0..count)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move { TestClient::connect(&engine, &format!("p{}", i)) })
        })
        .collect();

    let mut clients = Vec::new();
    for handle in handles {
        clients.push(handle.await.unwrap());
    }

    let stats = engine.get_stats().unwrap();
    assert_eq!(stats.active_conversations, count / 2);
    assert_eq!(stats.participants_waiting, 0);
    assert_eq!(stats.conversations_created, (count / 2) as u64);
    engine.check_invariants().unwrap();

    // Every client got exactly one pairing, with somebody other than itself
    let mut conversations = HashSet::new();
    for client in &mut clients {
        let paired: Vec<_> = client
            .messages()
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::Paired { .. }))
            .collect();
        assert_eq!(paired.len(), 1, "{} paired {} times", client.id, paired.len());
        conversations.insert(client.conversation(&engine).unwrap());
    }
    assert_eq!(conversations.len(), count / 2);
}

#[tokio::test(start_paused = true)]
async fn test_full_round_then_repair() {
    let engine = test_engine(DisconnectPolicy::KeepUntilRoundEnds);
    let mut alice = TestClient::connect(&engine, "alice");
    let mut bob = TestClient::connect(&engine, "bob");

    let first = alice.conversation(&engine).unwrap();
    assert_eq!(bob.conversation(&engine), Some(first));
    assert!(matches!(alice.messages()[0], ServerMessage::Welcome { .. }));
    bob.messages();

    // Chat inside the round reaches only the peer
    let outcome = engine.relay_chat("alice", first, "hello").unwrap();
    assert_eq!(outcome, RelayOutcome::Delivered { recipients: 1 });
    match &bob.messages()[..] {
        [ServerMessage::Chat { text, .. }] => assert_eq!(text, "hello"),
        other => panic!("unexpected messages: {:?}", other),
    }
    assert!(alice.messages().is_empty());

    tokio::time::sleep(Duration::from_secs(181)).await;

    let received = bob.messages();
    assert_eq!(
        received[0],
        ServerMessage::TimeUp {
            conversation_id: first
        }
    );
    let second = bob.conversation(&engine).unwrap();
    assert_ne!(first, second);

    // Messages to the expired conversation are dropped
    let outcome = engine.relay_chat("alice", first, "late").unwrap();
    assert!(matches!(outcome, RelayOutcome::Dropped(_)));
    engine.check_invariants().unwrap();
}

#[tokio::test]
async fn test_skip_moves_both_sides_on() {
    let engine = test_engine(DisconnectPolicy::KeepUntilRoundEnds);
    let mut a = TestClient::connect(&engine, "a");
    let mut b = TestClient::connect(&engine, "b");
    let mut c = TestClient::connect(&engine, "c");
    let mut d = TestClient::connect(&engine, "d");
    let ab = a.conversation(&engine).unwrap();
    let cd = c.conversation(&engine).unwrap();
    for client in [&mut a, &mut b, &mut c, &mut d] {
        client.messages();
    }

    engine.skip("a").unwrap();
    assert!(b.messages().contains(&ServerMessage::PeerLeft { conversation_id: ab }));

    // c and d are untouched; b and a are the only waiters and pair up again
    assert_eq!(c.conversation(&engine), Some(cd));
    let again = a.conversation(&engine).unwrap();
    assert_ne!(again, ab);
    assert_eq!(b.conversation(&engine), Some(again));
    assert!(d.messages().is_empty());
}

#[tokio::test]
async fn test_reconnect_replaces_connection_and_keeps_round() {
    let engine = test_engine(DisconnectPolicy::EndRound);
    let mut old = TestClient::connect(&engine, "a");
    let _b = TestClient::connect(&engine, "b");
    let conversation_id = old.conversation(&engine).unwrap();

    let mut new = TestClient::connect(&engine, "a");

    // The evicted connection is told to close
    assert!(old.drain().contains(&Delivery::Close {
        code: CLOSE_REPLACED,
        reason: "replaced by a newer connection".to_string()
    }));

    // The new one is welcomed and told about the ongoing round
    let received = new.messages();
    assert!(matches!(received[0], ServerMessage::Welcome { .. }));
    assert!(matches!(
        received[1],
        ServerMessage::Paired { conversation_id: id, .. } if id == conversation_id
    ));

    // A late disconnect from the old handler does not end the round
    old.disconnect(&engine);
    assert_eq!(new.conversation(&engine), Some(conversation_id));
    assert!(engine.is_connected("a").unwrap());
}

#[tokio::test]
async fn test_router_session_flow() {
    let metrics = Arc::new(MetricsCollector::new().unwrap());
    let engine = test_engine(DisconnectPolicy::KeepUntilRoundEnds);
    let sessions =
        InMemorySessionStore::with_ttls(Duration::from_secs(300), Duration::from_secs(86400));
    let app = create_router(ApiState::new(
        engine.clone(),
        sessions,
        metrics,
        Some("wss://chat.example".to_string()),
    ));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/session/anonymous")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let session: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let token = session["token"].as_str().unwrap().to_string();
    assert!(session["websocket_url"]
        .as_str()
        .unwrap()
        .starts_with("wss://chat.example/ws/chat?token="));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/account/register")
                .header("authorization", format!("Bearer {}", token))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"username":"alice"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/me")
                .header("authorization", format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let me: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(me["username"], "alice");

    // The engine shows the registered handle to peers
    let id = me["id"].as_str().unwrap().to_string();
    let _alice = TestClient::connect(&engine, &id);
    let mut peer = TestClient::connect(&engine, "peer");
    assert!(peer.messages().iter().any(|m| matches!(
        m,
        ServerMessage::Paired { peer_handle, .. } if peer_handle == "alice"
    )));
}

#[tokio::test]
async fn test_router_with_custom_resolver() {
    let metrics = Arc::new(MetricsCollector::new().unwrap());
    let engine = test_engine(DisconnectPolicy::KeepUntilRoundEnds);
    engine.register_participant("p1", None).unwrap();

    let sessions =
        InMemorySessionStore::with_ttls(Duration::from_secs(300), Duration::from_secs(86400));
    let mut state = ApiState::new(engine, sessions, metrics, None);
    state.resolver = Arc::new(
        StaticSessionResolver::new()
            .with_token("good", "p1")
            .with_expired("old"),
    );
    let app = create_router(state);

    let skip = |token: &str| {
        Request::builder()
            .method("POST")
            .uri("/session/skip")
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(skip("good")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.clone().oneshot(skip("old")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"], "session_expired");

    let response = app.oneshot(skip("unknown")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[derive(Debug, Clone)]
enum Event {
    Connect(usize),
    Disconnect(usize),
    Skip(usize),
    Chat(usize),
    Elapse(u64),
}

fn event_strategy(participants: usize) -> impl Strategy<Value = Event> {
    prop_oneof![
        3 => (0..participants).prop_map(Event::Connect),
        2 => (0..participants).prop_map(Event::Disconnect),
        2 => (0..participants).prop_map(Event::Skip),
        2 => (0..participants).prop_map(Event::Chat),
        1 => (1u64..200).prop_map(Event::Elapse),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_single_placement_holds(
        end_round in any::<bool>(),
        events in prop::collection::vec(event_strategy(6), 1..60),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        runtime.block_on(async {
            let policy = if end_round {
                DisconnectPolicy::EndRound
            } else {
                DisconnectPolicy::KeepUntilRoundEnds
            };
            let engine = test_engine(policy);
            let mut clients: Vec<Option<TestClient>> = (0..6).map(|_| None).collect();

            for event in events {
                match event {
                    Event::Connect(i) => {
                        clients[i] = Some(TestClient::connect(&engine, &format!("p{}", i)));
                    }
                    Event::Disconnect(i) => {
                        if let Some(client) = clients[i].take() {
                            client.disconnect(&engine);
                        }
                    }
                    Event::Skip(i) => {
                        // Rate limits and unknown participants are expected rejections
                        let _ = engine.skip(&format!("p{}", i));
                    }
                    Event::Chat(i) => {
                        if let Some(client) = &clients[i] {
                            if let Some(id) = client.conversation(&engine) {
                                engine.relay_chat(&client.id, id, "hi").unwrap();
                            }
                        }
                    }
                    Event::Elapse(secs) => {
                        tokio::time::sleep(Duration::from_secs(secs)).await;
                    }
                }

                engine.check_invariants().unwrap();

                // No two connected participants are left waiting side by side
                let connected_waiting = clients
                    .iter()
                    .flatten()
                    .filter(|c| engine.placement_of(&c.id).unwrap() == Placement::Waiting)
                    .count();
                assert!(connected_waiting <= 1, "{} connected waiters", connected_waiting);
            }
        });
    }
}
