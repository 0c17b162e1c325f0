use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use metrics::{counter, histogram};
use player_hub_core::{DeviceId, Role, CLOSE_POLICY};
use tokio::{
    sync::{mpsc, watch},
    time::{timeout, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::ConnectionSettings,
    connection::{CloseReason, Connection, ConnectionId},
    hub::PlayerHub,
    AppState,
};

const NORMAL_CLOSURE: u16 = 1000;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn player_ws_handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(ws, state, DeviceId::from(device_id), Role::Player)
}

pub async fn control_ws_handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(ws, state, DeviceId::from(device_id), Role::Controller)
}

fn upgrade(ws: WebSocketUpgrade, state: AppState, device_id: DeviceId, role: Role) -> Response {
    let failed_device = device_id.clone();
    ws.on_failed_upgrade(move |err| {
        counter!("player_hub_handshake_failures_total", 1, "role" => role.as_str());
        warn!(device_id = %failed_device, role = %role, error = %err, "websocket upgrade failed");
    })
    .on_upgrade(move |socket| serve_connection(socket, state, device_id, role))
}

#[derive(Debug)]
enum Exit {
    ClientClosed(Option<u16>),
    StreamEnded,
    TransportError,
    IdleTimeout,
    ClosedByHub(CloseReason),
}

impl Exit {
    fn metric_label(&self) -> &'static str {
        match self {
            Exit::ClientClosed(_) => "client_closed",
            Exit::StreamEnded => "stream_ended",
            Exit::TransportError => "transport_error",
            Exit::IdleTimeout => "idle_timeout",
            Exit::ClosedByHub(_) => "closed_by_hub",
        }
    }
}

async fn serve_connection(socket: WebSocket, state: AppState, device_id: DeviceId, role: Role) {
    let settings = state.settings.clone();
    let (conn, outlet) = Connection::open(device_id.clone(), role, settings.outbound_buffer);
    let connection_id = conn.id();
    let started = Instant::now();
    let (ws_tx, ws_rx) = socket.split();

    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        outlet.outbound,
        outlet.closed.clone(),
        settings.ping_interval,
        connection_id,
    ));

    counter!("player_hub_connections_total", 1, "role" => role.as_str());
    info!(
        device_id = %device_id,
        connection_id = %connection_id,
        role = %role,
        "connection established"
    );

    let exit = {
        let _registration = Registration::enter(state.hub.clone(), conn.clone());
        read_loop(&state.hub, &conn, ws_rx, outlet.closed, &settings).await
    };

    if let Exit::IdleTimeout = exit {
        conn.close(CLOSE_POLICY, "idle timeout");
    } else {
        conn.close(NORMAL_CLOSURE, "");
    }
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    counter!(
        "player_hub_connections_closed_total",
        1,
        "role" => role.as_str(),
        "reason" => exit.metric_label()
    );
    histogram!(
        "player_hub_connection_duration_seconds",
        started.elapsed().as_secs_f64(),
        "role" => role.as_str()
    );
    info!(
        device_id = %device_id,
        connection_id = %connection_id,
        role = %role,
        exit = ?exit,
        "connection closed"
    );
}

/// Keeps a connection registered for as long as it is alive.
///
/// Deregistration lives in `Drop` so it runs however the receive loop ends,
/// including panics and task cancellation. A player whose departure leaves
/// the device vacant triggers an offline notification; a superseded player
/// does not, since its successor already announced the device online.
struct Registration {
    hub: PlayerHub,
    conn: Connection,
}

impl Registration {
    fn enter(hub: PlayerHub, conn: Connection) -> Self {
        let device_id = conn.device_id().clone();
        match conn.role() {
            Role::Player => hub.register_player(&device_id, conn.clone()),
            Role::Controller => hub.register_controller(&device_id, conn.clone()),
        }
        Self { hub, conn }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let device_id = self.conn.device_id();
        match self.conn.role() {
            Role::Player => {
                if self.hub.unregister_player(device_id, &self.conn) {
                    self.hub.notify_status(device_id, false);
                }
            }
            Role::Controller => {
                self.hub.unregister_controller(device_id, &self.conn);
            }
        }
    }
}

async fn read_loop(
    hub: &PlayerHub,
    conn: &Connection,
    mut ws_rx: SplitStream<WebSocket>,
    mut closed: watch::Receiver<Option<CloseReason>>,
    settings: &ConnectionSettings,
) -> Exit {
    loop {
        if let Some(reason) = closed.borrow_and_update().clone() {
            return Exit::ClosedByHub(reason);
        }

        let next = tokio::select! {
            biased;
            changed = closed.changed() => {
                if changed.is_err() {
                    return Exit::StreamEnded;
                }
                continue;
            }
            next = next_frame(&mut ws_rx, settings.idle_timeout) => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(FrameError::Idle)) => {
                warn!(
                    device_id = %conn.device_id(),
                    connection_id = %conn.id(),
                    "no frames within idle timeout; dropping connection"
                );
                return Exit::IdleTimeout;
            }
            Some(Err(FrameError::Transport(err))) => {
                warn!(
                    device_id = %conn.device_id(),
                    connection_id = %conn.id(),
                    error = %err,
                    "error receiving frame"
                );
                return Exit::TransportError;
            }
            None => return Exit::StreamEnded,
        };

        match frame {
            Message::Text(text) => route(hub, conn, &text),
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => route(hub, conn, &text),
                Err(_) => debug!(
                    connection_id = %conn.id(),
                    "ignoring non-UTF-8 binary frame"
                ),
            },
            Message::Close(frame) => {
                return Exit::ClientClosed(frame.map(|frame| frame.code));
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

enum FrameError {
    Idle,
    Transport(axum::Error),
}

async fn next_frame(
    ws_rx: &mut SplitStream<WebSocket>,
    idle_timeout: Option<Duration>,
) -> Option<Result<Message, FrameError>> {
    let next = match idle_timeout {
        Some(limit) => match timeout(limit, ws_rx.next()).await {
            Ok(next) => next,
            Err(_) => return Some(Err(FrameError::Idle)),
        },
        None => ws_rx.next().await,
    };
    next.map(|frame| frame.map_err(FrameError::Transport))
}

fn route(hub: &PlayerHub, conn: &Connection, text: &str) {
    match conn.role() {
        Role::Player => {
            hub.route_from_player(conn.device_id(), text);
        }
        Role::Controller => {
            let outcome = hub.route_from_controller(conn.device_id(), conn, text);
            debug!(connection_id = %conn.id(), outcome = ?outcome, "controller frame routed");
        }
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Message>,
    mut closed: watch::Receiver<Option<CloseReason>>,
    ping_interval: Option<Duration>,
    connection_id: ConnectionId,
) {
    let mut pings = ping_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            biased;
            changed = closed.changed() => {
                let reason = closed.borrow_and_update().clone();
                match reason {
                    Some(reason) => {
                        let frame = CloseFrame {
                            code: reason.code,
                            reason: reason.reason,
                        };
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                        break;
                    }
                    None if changed.is_err() => break,
                    None => continue,
                }
            }
            message = outbound.recv() => match message {
                Some(message) => {
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = tick(&mut pings) => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!(connection_id = %connection_id, "writer task finished");
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn device() -> DeviceId {
        DeviceId::new("den")
    }

    fn statuses(rx: &mut crate::connection::ConnectionOutlet) -> Vec<bool> {
        rx.drain_text()
            .iter()
            .map(|frame| {
                let value: Value = serde_json::from_str(frame).unwrap();
                value["params"]["online"].as_bool().unwrap()
            })
            .collect()
    }

    #[test]
    fn vacating_player_reports_offline_once() {
        let hub = PlayerHub::new();
        let (remote, mut remote_rx) = Connection::open(device(), Role::Controller, 8);
        let controller = Registration::enter(hub.clone(), remote);

        let (tv, _tv_rx) = Connection::open(device(), Role::Player, 8);
        let player = Registration::enter(hub.clone(), tv);
        drop(player);

        assert!(!hub.is_online(&device()));
        assert_eq!(statuses(&mut remote_rx), vec![false, true, false]);

        drop(controller);
        assert!(hub.snapshot().is_empty());
    }

    #[test]
    fn superseded_player_leaving_stays_quiet() {
        let hub = PlayerHub::new();
        let (remote, mut remote_rx) = Connection::open(device(), Role::Controller, 8);
        let _controller = Registration::enter(hub.clone(), remote);

        let (old_tv, _old_rx) = Connection::open(device(), Role::Player, 8);
        let old = Registration::enter(hub.clone(), old_tv);
        let (new_tv, _new_rx) = Connection::open(device(), Role::Player, 8);
        let _new = Registration::enter(hub.clone(), new_tv);
        drop(old);

        assert!(hub.is_online(&device()));
        assert_eq!(statuses(&mut remote_rx), vec![false, true, true]);
    }

    #[test]
    fn route_dispatches_by_role() {
        let hub = PlayerHub::new();
        let (remote, mut remote_rx) = Connection::open(device(), Role::Controller, 8);
        let (tv, mut tv_rx) = Connection::open(device(), Role::Player, 8);
        let _controller = Registration::enter(hub.clone(), remote.clone());
        let _player = Registration::enter(hub.clone(), tv.clone());
        remote_rx.drain_text();

        route(&hub, &remote, r#"{"jsonrpc":"2.0","id":3,"method":"Player.GetStatus"}"#);
        assert_eq!(
            tv_rx.drain_text(),
            vec![r#"{"jsonrpc":"2.0","id":3,"method":"Player.GetStatus"}"#]
        );

        let reply = json!({"jsonrpc": "2.0", "id": 3, "result": {"playing": true}}).to_string();
        route(&hub, &tv, &reply);
        assert_eq!(remote_rx.drain_text(), vec![reply]);
    }
}
