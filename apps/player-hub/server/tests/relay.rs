//! End-to-end tests: the real router on an ephemeral port, driven through
//! `tokio-tungstenite` clients.

use std::{net::SocketAddr, time::Duration};

use futures_util::{SinkExt, StreamExt};
use player_hub_client::{control_url, player_url, HubEvent};
use player_hub_core::DeviceId;
use player_hub_server::{config::ConnectionSettings, hub::PlayerHub, router, AppState};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type TestResult = Result<(), Box<dyn std::error::Error>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestHub {
    addr: SocketAddr,
    hub: PlayerHub,
}

impl TestHub {
    async fn start() -> Self {
        Self::start_with(ConnectionSettings {
            ping_interval: None,
            idle_timeout: None,
            ..ConnectionSettings::default()
        })
        .await
    }

    async fn start_with(settings: ConnectionSettings) -> Self {
        let hub = PlayerHub::new();
        let app = router(AppState::new(hub.clone(), settings));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, hub }
    }

    fn base(&self) -> String {
        format!("ws://{}", self.addr)
    }

    async fn player(&self, device: &str) -> Socket {
        let url = player_url(&self.base(), &DeviceId::new(device)).unwrap();
        let (socket, _) = connect_async(url.as_str()).await.unwrap();
        let device = DeviceId::new(device);
        let hub = self.hub.clone();
        wait_until(move || hub.is_online(&device)).await;
        socket
    }

    /// Connects a controller and consumes its status snapshot.
    async fn controller(&self, device: &str) -> (Socket, bool) {
        let url = control_url(&self.base(), &DeviceId::new(device)).unwrap();
        let (mut socket, _) = connect_async(url.as_str()).await.unwrap();
        let online = recv_status(&mut socket).await;
        (socket, online)
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(RECV_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn send(socket: &mut Socket, text: &str) {
    socket.send(Message::Text(text.into())).await.unwrap();
}

enum Incoming {
    Text(String),
    Closed(Option<u16>),
}

async fn next_incoming(socket: &mut Socket) -> Incoming {
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return Incoming::Text(text.as_str().to_owned()),
                Some(Ok(Message::Close(frame))) => {
                    return Incoming::Closed(frame.map(|frame| u16::from(frame.code)))
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Incoming::Closed(None),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

async fn recv_text(socket: &mut Socket) -> String {
    match next_incoming(socket).await {
        Incoming::Text(text) => text,
        Incoming::Closed(code) => panic!("socket closed ({code:?}) while expecting text"),
    }
}

async fn recv_json(socket: &mut Socket) -> Value {
    serde_json::from_str(&recv_text(socket).await).unwrap()
}

async fn recv_status(socket: &mut Socket) -> bool {
    let text = recv_text(socket).await;
    HubEvent::decode(&text)
        .online()
        .unwrap_or_else(|| panic!("expected a device status, got {text}"))
}

async fn recv_close_code(socket: &mut Socket) -> Option<u16> {
    match next_incoming(socket).await {
        Incoming::Closed(code) => code,
        Incoming::Text(text) => panic!("expected close, got {text}"),
    }
}

#[tokio::test]
async fn controller_learns_when_player_comes_online() -> TestResult {
    let hub = TestHub::start().await;
    let (mut remote, online) = hub.controller("tv-1").await;
    assert!(!online);

    let _tv = hub.player("tv-1").await;
    assert!(recv_status(&mut remote).await);

    let (_late, online) = hub.controller("tv-1").await;
    assert!(online);
    Ok(())
}

#[tokio::test]
async fn player_frames_fan_out_in_order() -> TestResult {
    let hub = TestHub::start().await;
    let (mut first, _) = hub.controller("tv-2").await;
    let (mut second, _) = hub.controller("tv-2").await;
    let mut tv = hub.player("tv-2").await;
    assert!(recv_status(&mut first).await);
    assert!(recv_status(&mut second).await);

    let frames: Vec<String> = (0..20)
        .map(|n| json!({"jsonrpc": "2.0", "method": "Player.OnProgress", "params": {"t": n}}).to_string())
        .collect();
    for frame in &frames {
        send(&mut tv, frame).await;
    }

    for remote in [&mut first, &mut second] {
        for expected in &frames {
            assert_eq!(&recv_text(remote).await, expected);
        }
    }
    Ok(())
}

#[tokio::test]
async fn requests_round_trip_through_player() -> TestResult {
    let hub = TestHub::start().await;
    let mut tv = hub.player("tv-3").await;
    let (mut remote, online) = hub.controller("tv-3").await;
    assert!(online);

    let request = r#"{"jsonrpc":"2.0","id":1,"method":"Player.PlayUrl","params":{"url":"https://cdn/x.m3u8"}}"#;
    send(&mut remote, request).await;
    assert_eq!(recv_text(&mut tv).await, request);

    let reply = r#"{"jsonrpc":"2.0","id":1,"result":"OK"}"#;
    send(&mut tv, reply).await;
    assert_eq!(recv_text(&mut remote).await, reply);
    Ok(())
}

#[tokio::test]
async fn offline_player_yields_error_for_requests_only() -> TestResult {
    let hub = TestHub::start().await;
    let (mut remote, online) = hub.controller("tv-4").await;
    assert!(!online);

    // A notification gets no answer, so the next frame must be the error for id 7.
    send(&mut remote, r#"{"jsonrpc":"2.0","method":"Player.Stop"}"#).await;
    send(&mut remote, "not json at all").await;
    send(&mut remote, r#"{"jsonrpc":"2.0","id":7,"method":"x"}"#).await;

    assert_eq!(
        recv_json(&mut remote).await,
        json!({"jsonrpc": "2.0", "id": 7, "error": {"code": -32001, "message": "Player is offline"}})
    );
    Ok(())
}

#[tokio::test]
async fn second_player_supersedes_first() -> TestResult {
    let hub = TestHub::start().await;
    let (mut remote, _) = hub.controller("tv-5").await;
    let mut old_tv = hub.player("tv-5").await;
    assert!(recv_status(&mut remote).await);

    let url = player_url(&hub.base(), &DeviceId::new("tv-5"))?;
    let (mut new_tv, _) = connect_async(url.as_str()).await?;
    assert_eq!(recv_close_code(&mut old_tv).await, Some(4000));
    assert!(recv_status(&mut remote).await);

    let request = r#"{"jsonrpc":"2.0","id":"a","method":"Player.GetStatus"}"#;
    send(&mut remote, request).await;
    assert_eq!(recv_text(&mut new_tv).await, request);
    assert!(hub.hub.is_online(&DeviceId::new("tv-5")));
    Ok(())
}

#[tokio::test]
async fn player_disconnect_reports_offline_once() -> TestResult {
    let hub = TestHub::start().await;
    let (mut first, _) = hub.controller("tv-6").await;
    let (mut second, _) = hub.controller("tv-6").await;
    let mut tv = hub.player("tv-6").await;
    assert!(recv_status(&mut first).await);
    assert!(recv_status(&mut second).await);

    tv.close(None).await?;
    drop(tv);

    for remote in [&mut first, &mut second] {
        assert!(!recv_status(remote).await);
        // If a second offline status were queued it would arrive before this reply.
        send(remote, r#"{"jsonrpc":"2.0","id":11,"method":"x"}"#).await;
        let reply = recv_json(remote).await;
        assert_eq!(reply["id"], 11);
        assert_eq!(reply["error"]["code"], -32001);
    }
    Ok(())
}

#[tokio::test]
async fn controller_disconnect_leaves_no_trace() -> TestResult {
    let hub = TestHub::start().await;
    let device = DeviceId::new("tv-7");
    let (mut remote, _) = hub.controller("tv-7").await;
    assert_eq!(hub.hub.controller_count(&device), 1);

    remote.close(None).await?;
    let state = hub.hub.clone();
    wait_until(move || state.snapshot().is_empty()).await;
    Ok(())
}

#[tokio::test]
async fn silent_player_is_dropped_after_idle_timeout() -> TestResult {
    let hub = TestHub::start_with(ConnectionSettings {
        ping_interval: None,
        idle_timeout: Some(Duration::from_millis(300)),
        ..ConnectionSettings::default()
    })
    .await;
    let (remote, _) = hub.controller("tv-8").await;
    let mut tv = hub.player("tv-8").await;

    // The controller pings to stay alive while the player stays silent.
    let (mut remote_tx, mut remote_rx) = remote.split();
    let mut keepalive = tokio::time::interval(Duration::from_millis(100));
    let mut statuses = Vec::new();
    tokio::time::timeout(RECV_TIMEOUT, async {
        while statuses.len() < 2 {
            tokio::select! {
                _ = keepalive.tick() => {
                    remote_tx.send(Message::Ping(Default::default())).await.unwrap();
                }
                frame = remote_rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        statuses.push(HubEvent::decode(text.as_str()).online());
                    }
                    Some(Ok(_)) => {}
                    other => panic!("controller connection ended: {other:?}"),
                },
            }
        }
    })
    .await?;

    assert_eq!(statuses, vec![Some(true), Some(false)]);
    assert_eq!(recv_close_code(&mut tv).await, Some(1008));
    Ok(())
}
