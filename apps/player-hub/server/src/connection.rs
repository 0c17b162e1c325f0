use std::{borrow::Cow, fmt, sync::Arc};

use axum::extract::ws::Message;
use player_hub_core::{DeviceId, Role};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: Cow<'static, str>,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
    #[error("outbound queue is full")]
    Backpressure,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SendError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            SendError::Closed => "closed",
            SendError::Backpressure => "backpressure",
            SendError::Encode(_) => "encode",
        }
    }
}

/// Handle to one live WebSocket, as seen by the hub.
///
/// Cloning is cheap; all clones refer to the same socket. Frames are queued on
/// a bounded channel drained by the connection's writer task, so sending never
/// blocks the caller. Closing is signalled separately so that it still gets
/// through when the queue is full.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    device_id: DeviceId,
    role: Role,
    outbound: mpsc::Sender<Message>,
    close: watch::Sender<Option<CloseReason>>,
}

/// Receiving half of a [`Connection`], owned by the socket tasks.
pub struct ConnectionOutlet {
    pub outbound: mpsc::Receiver<Message>,
    pub closed: watch::Receiver<Option<CloseReason>>,
}

impl Connection {
    pub fn open(device_id: DeviceId, role: Role, buffer: usize) -> (Connection, ConnectionOutlet) {
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
        let (close_tx, close_rx) = watch::channel(None);
        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::new(),
                device_id,
                role,
                outbound: outbound_tx,
                close: close_tx,
            }),
        };
        let outlet = ConnectionOutlet {
            outbound: outbound_rx,
            closed: close_rx,
        };
        (connection, outlet)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.inner
            .outbound
            .try_send(Message::Text(text.into()))
            .map_err(|err| match err {
                TrySendError::Full(_) => SendError::Backpressure,
                TrySendError::Closed(_) => SendError::Closed,
            })
    }

    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), SendError> {
        let text = serde_json::to_string(value)?;
        self.send_text(text)
    }

    /// Asks the socket tasks to close with the given code. Only the first
    /// close request is honoured; returns whether this call was it.
    pub fn close(&self, code: u16, reason: impl Into<Cow<'static, str>>) -> bool {
        let reason = CloseReason {
            code,
            reason: reason.into(),
        };
        self.inner.close.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.close.borrow().is_some() || self.inner.outbound.is_closed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("device_id", &self.inner.device_id)
            .field("role", &self.inner.role)
            .finish()
    }
}

impl ConnectionOutlet {
    #[cfg(test)]
    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.closed.borrow().clone()
    }

    #[cfg(test)]
    pub(crate) fn try_recv_text(&mut self) -> Option<String> {
        match self.outbound.try_recv() {
            Ok(Message::Text(text)) => Some(text),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn drain_text(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.try_recv_text()).collect()
    }
}
