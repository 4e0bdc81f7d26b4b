use std::time::Duration;

use chatsync_core::{
    DeliveryState, DeliveryUpdate, MessageBody, MessageRecord, PushEvent, decode_event,
    encode_event,
};
use chatsync_relay::{AppState, build_router};
use futures::StreamExt;
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct Relay {
    address: std::net::SocketAddr,
    state: AppState,
    _shutdown: oneshot::Sender<()>,
}

impl Relay {
    fn ws_url(&self, user_id: &str) -> String {
        format!("ws://{}/ws?userId={user_id}", self.address)
    }
}

async fn start_relay() -> Relay {
    start_relay_with(AppState::new()).await
}

async fn start_relay_with(state: AppState) -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral relay socket");
    let address = listener.local_addr().expect("relay local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let server = axum::serve(listener, build_router(state.clone())).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    Relay {
        address,
        state,
        _shutdown: shutdown_tx,
    }
}

async fn connect_user(relay: &Relay, user_id: &str) -> WsStream {
    let (ws_stream, _) = connect_async(relay.ws_url(user_id))
        .await
        .expect("connect websocket");
    ws_stream
}

/// Next push event, skipping keepalive frames.
async fn recv_event(stream: &mut WsStream, within: Duration) -> Option<PushEvent> {
    timeout(within, async {
        while let Some(next) = stream.next().await {
            match next {
                Ok(Message::Text(text)) => {
                    return Some(decode_event(text.as_str()).expect("decode push frame"));
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Reads until a roster equal to `expected` arrives.
async fn expect_roster(stream: &mut WsStream, expected: &[&str]) {
    loop {
        match recv_event(stream, Duration::from_secs(2)).await {
            Some(PushEvent::Roster(users)) if users == expected => return,
            Some(_) => continue,
            None => panic!("roster {expected:?} never arrived"),
        }
    }
}

fn new_message(id: &str, sender: &str, receiver: &str) -> PushEvent {
    PushEvent::IncomingMessage(MessageRecord {
        id: id.to_owned(),
        sender_id: sender.to_owned(),
        receiver_id: receiver.to_owned(),
        body: MessageBody::text("hello"),
        created_at: chrono::Utc::now(),
        delivery_state: None,
        delivered: false,
        read: false,
        correlation_id: Some("cid-1".to_owned()),
    })
}

#[tokio::test]
async fn roster_is_broadcast_on_join_and_leave() {
    let relay = start_relay().await;

    let mut alice = connect_user(&relay, "alice").await;
    expect_roster(&mut alice, &["alice"]).await;

    let mut bob = connect_user(&relay, "bob").await;
    expect_roster(&mut alice, &["alice", "bob"]).await;
    expect_roster(&mut bob, &["alice", "bob"]).await;

    drop(bob);
    expect_roster(&mut alice, &["alice"]).await;
    assert_eq!(relay.state.online_users().await, vec!["alice".to_owned()]);
}

#[tokio::test]
async fn handshake_without_user_id_is_rejected() {
    let relay = start_relay().await;

    let err = connect_async(format!("ws://{}/ws", relay.address))
        .await
        .expect_err("handshake without userId should fail");
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status().as_u16(), 400),
        other => panic!("unexpected handshake error: {other}"),
    }
    assert_eq!(relay.state.connections_accepted(), 0);
}

#[tokio::test]
async fn http_push_reaches_only_its_target() {
    let relay = start_relay().await;
    let mut alice = connect_user(&relay, "alice").await;
    expect_roster(&mut alice, &["alice"]).await;
    let mut bob = connect_user(&relay, "bob").await;
    expect_roster(&mut bob, &["alice", "bob"]).await;
    expect_roster(&mut alice, &["alice", "bob"]).await;

    let event = new_message("m1", "alice", "bob");
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/push/bob", relay.address))
        .header("content-type", "application/json")
        .body(encode_event(&event).expect("encode event"))
        .send()
        .await
        .expect("push request");
    assert_eq!(response.status().as_u16(), 202);

    assert_eq!(
        recv_event(&mut bob, Duration::from_secs(2)).await,
        Some(event)
    );
    assert_eq!(
        recv_event(&mut alice, Duration::from_millis(300)).await,
        None
    );

    let response = client
        .post(format!("http://{}/push/carol", relay.address))
        .header("content-type", "application/json")
        .body(encode_event(&new_message("m2", "alice", "carol")).expect("encode event"))
        .send()
        .await
        .expect("push request");
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn status_update_push_is_delivered_verbatim() {
    let relay = start_relay().await;
    let mut alice = connect_user(&relay, "alice").await;
    expect_roster(&mut alice, &["alice"]).await;

    let update = PushEvent::MessageDeliveryUpdate(DeliveryUpdate {
        message_id: "m1".to_owned(),
        delivery_state: DeliveryState::Read,
    });
    assert!(relay.state.push_to("alice", &update).await);
    assert_eq!(
        recv_event(&mut alice, Duration::from_secs(2)).await,
        Some(update)
    );
}

#[tokio::test]
async fn disconnect_closes_socket_and_updates_roster() {
    let relay = start_relay().await;
    let mut alice = connect_user(&relay, "alice").await;
    expect_roster(&mut alice, &["alice"]).await;
    let mut bob = connect_user(&relay, "bob").await;
    expect_roster(&mut bob, &["alice", "bob"]).await;

    assert!(relay.state.disconnect("bob").await);
    assert!(!relay.state.disconnect("bob").await);

    assert_eq!(recv_event(&mut bob, Duration::from_secs(2)).await, None);
    expect_roster(&mut alice, &["alice"]).await;
}

#[tokio::test]
async fn second_socket_for_same_user_replaces_the_first() {
    let relay = start_relay().await;
    let mut first = connect_user(&relay, "alice").await;
    expect_roster(&mut first, &["alice"]).await;

    let mut second = connect_user(&relay, "alice").await;
    expect_roster(&mut second, &["alice"]).await;

    assert_eq!(recv_event(&mut first, Duration::from_secs(2)).await, None);
    assert_eq!(relay.state.connections_accepted(), 2);
    assert_eq!(relay.state.online_users().await, vec!["alice".to_owned()]);

    // The replaced socket going away must not take the user offline.
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(relay.state.online_users().await, vec!["alice".to_owned()]);
}

#[tokio::test]
async fn idle_socket_is_pinged_at_the_configured_interval() {
    let relay = start_relay_with(AppState::with_keepalive(Duration::from_millis(100))).await;
    let mut alice = connect_user(&relay, "alice").await;
    expect_roster(&mut alice, &["alice"]).await;

    let pinged = timeout(Duration::from_secs(2), async {
        while let Some(next) = alice.next().await {
            if matches!(next, Ok(Message::Ping(_))) {
                return true;
            }
        }
        false
    })
    .await;
    assert!(matches!(pinged, Ok(true)), "no keepalive ping within 2s");
}
