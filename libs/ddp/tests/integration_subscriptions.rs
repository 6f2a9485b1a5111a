//! Integration tests for subscriptions, unsubscribe semantics and login

#[macro_use]
mod common;

use common::*;
use ddp::protocol::password_digest;
use ddp::{ConnectionState, Credentials, DdpError, EventHandler, PushEvent};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sink_receives_only_matching_events() {
    verbose_println!("Testing push dispatch...");

    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    let (tx, rx) = crossbeam_channel::unbounded::<PushEvent>();
    let (handle, sub) = tokio::join!(
        client.subscribe("stream-room-messages", vec![json!("GENERAL"), json!(false)], Some(Arc::new(tx))),
        server.ack_subscribe()
    );
    let handle = handle.unwrap();
    assert_eq!(sub["params"], json!(["GENERAL", false]));
    assert_eq!(handle.name(), "stream-room-messages");

    server.push("stream-room-messages", "OTHER-ROOM", json!([{"msg": "not for us"}]));
    server.push("stream-room-messages", "GENERAL", json!([{"msg": "hello"}]));
    server.push("stream-notify-user", "GENERAL", json!([]));

    let event = rx.recv_timeout(STEP_TIMEOUT).unwrap();
    assert_eq!(event.subscription_id, handle.id());
    assert_eq!(event.collection.as_deref(), Some("stream-room-messages"));
    assert_eq!(event.args, vec![json!({"msg": "hello"})]);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(rx.try_recv().is_err(), "unmatched pushes must be dropped");
}

#[tokio::test]
async fn test_late_attached_sink_receives_events() {
    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    let (handle, _) = tokio::join!(
        client.subscribe("room-events", vec![json!("r1")], None),
        server.ack_subscribe()
    );
    let handle = handle.unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let sink: Arc<dyn EventHandler> = Arc::new(move |_: &PushEvent| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(client.on_event(handle.id(), sink.clone()).await.unwrap());
    assert!(!client.on_event("no-such-sub", sink).await.unwrap());

    server.push("room-events", "r1", json!([]));
    server.push("room-events", "r1", json!([]));
    assert!(wait_until(|| count.load(Ordering::SeqCst) == 2).await);
}

#[tokio::test]
async fn test_subscribe_refused_by_server() {
    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    let (result, ()) = tokio::join!(client.subscribe("no-such-publication", vec![], None), async {
        let sub = server.expect("sub").await;
        server.send(json!({
            "msg": "nosub",
            "id": sub["id"],
            "error": {"error": 404, "reason": "Subscription 'no-such-publication' not found"},
        }));
    });

    match result {
        Err(DdpError::Protocol { code, reason }) => {
            assert_eq!(code, "404");
            assert!(reason.contains("not found"));
        }
        other => panic!("expected protocol error, got {:?}", other),
    }

    // Not tracked, so nothing is replayed later
    server.drop_connection();
    let mut server = next_transport(&mut accepted).await;
    server.accept_handshake("session-2").await;
    server.expect_silence(Duration::from_millis(60)).await;
}

#[tokio::test]
async fn test_unsubscribe_acknowledged_by_nosub() {
    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    let (handle, _) = tokio::join!(
        client.subscribe("room-events", vec![json!("r1")], None),
        server.ack_subscribe()
    );
    let handle = handle.unwrap();
    let id = handle.id().to_string();

    let (result, ()) = tokio::join!(handle.unsubscribe(), async {
        let unsub = server.expect("unsub").await;
        assert_eq!(unsub["id"], id.as_str());
        server.send(json!({"msg": "nosub", "id": id}));
    });
    result.unwrap();

    // Gone locally: pushes are dropped and nothing is replayed
    server.drop_connection();
    let mut server = next_transport(&mut accepted).await;
    server.accept_handshake("session-2").await;
    server.expect_silence(Duration::from_millis(60)).await;
}

#[tokio::test]
async fn test_unsubscribe_of_already_gone_subscription_succeeds() {
    verbose_println!("Testing idempotent unsubscribe...");

    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    let (handle, _) = tokio::join!(client.subscribe("room-events", vec![], None), server.ack_subscribe());
    let handle = handle.unwrap();
    let id = handle.id().to_string();

    let (result, ()) = tokio::join!(client.unsubscribe(&id), async {
        server.expect("unsub").await;
        server.send(json!({
            "msg": "nosub",
            "id": id,
            "error": {"error": 404, "reason": "Subscription not found"},
        }));
    });
    assert!(result.is_ok(), "nosub with an error still means unsubscribed");

    // Unknown ids are a no-op as well
    client.unsubscribe(&id).await.unwrap();
    client.unsubscribe("never-existed").await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_in_flight_at_connection_loss_resolves() {
    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    let (handle, _) = tokio::join!(client.subscribe("room-events", vec![], None), server.ack_subscribe());
    let handle = handle.unwrap();

    let (result, ()) = tokio::join!(handle.unsubscribe(), async {
        server.expect("unsub").await;
        server.drop_connection();
    });
    assert!(result.is_ok());

    let mut server = next_transport(&mut accepted).await;
    server.accept_handshake("session-2").await;
    server.expect_silence(Duration::from_millis(60)).await;
}

#[tokio::test]
async fn test_server_stopped_subscription_is_forgotten() {
    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    let (handle, sub) = tokio::join!(client.subscribe("room-events", vec![], None), server.ack_subscribe());
    handle.unwrap();

    server.send(json!({"msg": "nosub", "id": sub["id"]}));
    tokio::time::sleep(Duration::from_millis(20)).await;

    server.drop_connection();
    let mut server = next_transport(&mut accepted).await;
    server.accept_handshake("session-2").await;
    server.expect_silence(Duration::from_millis(60)).await;
}

#[tokio::test]
async fn test_unsubscribe_all_swallows_failures() {
    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    for name in ["a", "b", "c"] {
        let (handle, _) = tokio::join!(client.subscribe(name, vec![], None), server.ack_subscribe());
        handle.unwrap();
    }

    tokio::join!(client.unsubscribe_all(), async {
        let first = server.expect("unsub").await;
        server.expect("unsub").await;
        server.expect("unsub").await;
        server.send(json!({"msg": "nosub", "id": first["id"]}));
        // The other two never get an ack before the transport drops
        server.drop_connection();
    });
}

#[tokio::test]
async fn test_error_frame_refuses_subscribe() {
    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    let (result, ()) = tokio::join!(
        tokio::time::timeout(STEP_TIMEOUT, client.subscribe("room-events", vec![json!(1)], None)),
        async {
            let sub = server.expect("sub").await;
            server.send(json!({"msg": "error", "reason": "Match failed", "offendingMessage": sub}));
        }
    );

    match result.expect("subscribe must settle on an error frame") {
        Err(DdpError::Protocol { code, reason }) => {
            assert_eq!(code, "error");
            assert_eq!(reason, "Match failed");
        }
        other => panic!("expected protocol error, got {:?}", other),
    }

    // Refused subscriptions are not tracked for replay
    server.drop_connection();
    let mut server = next_transport(&mut accepted).await;
    server.accept_handshake("session-2").await;
    server.expect_silence(Duration::from_millis(60)).await;
}

#[tokio::test]
async fn test_unsubscribe_with_string_error_body_succeeds() {
    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    let (handle, _) = tokio::join!(client.subscribe("room-events", vec![], None), server.ack_subscribe());
    let handle = handle.unwrap();
    let id = handle.id().to_string();

    let (result, ()) = tokio::join!(tokio::time::timeout(STEP_TIMEOUT, handle.unsubscribe()), async {
        server.expect("unsub").await;
        server.send(json!({"msg": "nosub", "id": id, "error": "not-found"}));
    });
    assert!(result.expect("unsubscribe must settle").is_ok());
}

#[tokio::test]
async fn test_disconnect_completes_when_unsub_is_never_acked() {
    verbose_println!("Testing disconnect against a silent server...");

    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    let (handle, _) = tokio::join!(client.subscribe("room-events", vec![], None), server.ack_subscribe());
    handle.unwrap();

    let (result, close) = tokio::join!(
        tokio::time::timeout(STEP_TIMEOUT, client.disconnect()),
        async {
            server.expect("unsub").await;
            // Never answered
            server.expect_closed().await
        }
    );
    result.expect("disconnect must not wait forever for nosub").unwrap();

    let (code, reason) = close.expect("transport should be closed");
    assert_eq!(code, 1000);
    assert_eq!(reason, "client disconnect");
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_logout_completes_when_unsub_is_never_acked() {
    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    let (handle, _) = tokio::join!(client.subscribe("room-events", vec![], None), server.ack_subscribe());
    handle.unwrap();

    let (result, ()) = tokio::join!(tokio::time::timeout(STEP_TIMEOUT, client.logout()), async {
        server.expect("unsub").await;
        let logout = server.expect("method").await;
        assert_eq!(logout["method"], "logout");
        server.send(json!({"msg": "result", "id": logout["id"]}));
    });
    result.expect("logout must not wait forever for nosub").unwrap();
    assert!(client.is_connected());
}

// =============================================================================
// Login
// =============================================================================

#[tokio::test]
async fn test_password_login_sends_digest_only() {
    verbose_println!("Testing password digest login...");

    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    let (result, ()) = tokio::join!(client.login(Credentials::password("alice", "hunter2")), async {
        let frame = match server.next_command().await {
            Some(ddp::TransportCommand::Send(text)) => {
                assert!(!text.contains("hunter2"), "plaintext password on the wire");
                serde_json::from_str::<serde_json::Value>(&text).unwrap()
            }
            other => panic!("expected login frame, got {:?}", other),
        };
        assert_eq!(frame["method"], "login");
        let params = &frame["params"][0];
        assert_eq!(params["user"], json!({"username": "alice"}));
        assert_eq!(params["password"]["digest"], password_digest("hunter2"));
        assert_eq!(params["password"]["algorithm"], "sha-256");

        server.send(json!({
            "msg": "result",
            "id": frame["id"],
            "result": {"id": "u1", "token": "tok", "tokenExpires": {"$date": 4102444800000u64}},
        }));
    });

    let login = result.unwrap();
    assert_eq!(login.user_id, "u1");
    assert_eq!(login.token, "tok");
    assert!(login.token_expires.is_some());
    assert!(wait_until(|| client.connection_state() == ConnectionState::Authenticated).await);
    assert_eq!(client.login_result(), Some(login));
}

#[tokio::test]
async fn test_email_login_uses_email_selector() {
    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    let (result, ()) = tokio::join!(client.login(Credentials::password("alice@example.com", "pw")), async {
        let frame = server.expect("method").await;
        assert_eq!(frame["params"][0]["user"], json!({"email": "alice@example.com"}));
        server.send(json!({
            "msg": "result",
            "id": frame["id"],
            "error": {"error": 403, "reason": "User not found", "errorType": "Meteor.Error"},
        }));
    });

    assert!(matches!(result, Err(DdpError::Protocol { .. })));
    assert_eq!(client.connection_state(), ConnectionState::Open);
    assert!(client.login_result().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_login_replays_existing_subscriptions() {
    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    let (handle, anonymous) = tokio::join!(
        client.subscribe("stream-notify-logged", vec![json!("user-status")], None),
        server.ack_subscribe()
    );
    let handle = handle.unwrap();

    let (result, ()) = tokio::join!(client.login(Credentials::resume("stored-token")), async {
        let frame = server.expect("method").await;
        assert_eq!(frame["params"], json!([{"resume": "stored-token"}]));
        server.send(json!({
            "msg": "result",
            "id": frame["id"],
            "result": {"id": "u1", "token": "stored-token"},
        }));
    });
    result.unwrap();

    // The anonymous subscription is torn down and re-issued for the user
    let unsub = server.expect("unsub").await;
    assert_eq!(unsub["id"], anonymous["id"]);
    let replay = server.ack_subscribe().await;
    assert_eq!(replay["name"], "stream-notify-logged");
    assert_eq!(replay["params"], json!(["user-status"]));

    // Handle still refers to the same subscription
    let (tx, rx) = crossbeam_channel::unbounded::<PushEvent>();
    assert!(client.on_event(handle.id(), Arc::new(tx)).await.unwrap());
    server.push("stream-notify-logged", "user-status", json!(["u2", "online"]));
    let event = rx.recv_timeout(STEP_TIMEOUT).unwrap();
    assert_eq!(event.subscription_id, handle.id());
}

#[tokio::test]
async fn test_logout_clears_token_and_subscriptions() {
    let (connector, mut accepted) = MockConnector::new();
    let client = test_builder(&connector).build().unwrap();
    let mut server = connect(&client, &mut accepted).await;

    let (result, ()) = tokio::join!(client.login(Credentials::resume("tok")), async {
        let frame = server.expect("method").await;
        server.send(json!({"msg": "result", "id": frame["id"], "result": {"id": "u1", "token": "tok"}}));
    });
    result.unwrap();
    assert!(wait_until(|| client.connection_state() == ConnectionState::Authenticated).await);

    let (handle, _) = tokio::join!(client.subscribe("room-events", vec![], None), server.ack_subscribe());
    handle.unwrap();

    let (result, ()) = tokio::join!(client.logout(), async {
        let unsub = server.expect("unsub").await;
        server.send(json!({"msg": "nosub", "id": unsub["id"]}));
        let logout = server.expect("method").await;
        assert_eq!(logout["method"], "logout");
        server.send(json!({"msg": "result", "id": logout["id"]}));
    });
    result.unwrap();

    assert!(client.login_result().is_none());
    assert_eq!(client.connection_state(), ConnectionState::Open);

    // No resume attempt on the next connection
    server.drop_connection();
    let mut server = next_transport(&mut accepted).await;
    server.accept_handshake("session-2").await;
    server.expect_silence(Duration::from_millis(60)).await;
}
