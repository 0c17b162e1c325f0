//! Helpers for players and controllers connecting to the hub: endpoint URLs
//! and classification of the frames a controller receives.

use player_hub_core::{
    DeviceId, DeviceStatus, RpcErrorResponse, DEVICE_STATUS_METHOD, PLAYER_OFFLINE_CODE,
};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum HubUrlError {
    #[error("invalid hub base url: {0}")]
    InvalidBase(#[from] url::ParseError),
    #[error("unsupported scheme {0:?}; expected ws, wss, http or https")]
    UnsupportedScheme(String),
    #[error("hub base url cannot carry a path")]
    CannotBeABase,
}

/// Endpoint a TV player connects to, e.g. `wss://hub.example/ws/player/<id>`.
pub fn player_url(base: &str, device_id: &DeviceId) -> Result<Url, HubUrlError> {
    endpoint(base, "player", device_id)
}

/// Endpoint a remote controller connects to, e.g. `wss://hub.example/ws/control/<id>`.
pub fn control_url(base: &str, device_id: &DeviceId) -> Result<Url, HubUrlError> {
    endpoint(base, "control", device_id)
}

fn endpoint(base: &str, role_segment: &str, device_id: &DeviceId) -> Result<Url, HubUrlError> {
    let mut url = Url::parse(base)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(HubUrlError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| HubUrlError::UnsupportedScheme(scheme.to_string()))?;

    url.path_segments_mut()
        .map_err(|_| HubUrlError::CannotBeABase)?
        .pop_if_empty()
        .extend(["ws", role_segment, device_id.as_str()]);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// A frame as seen by a controller.
///
/// Relayed player frames are opaque, so a player that sends something shaped
/// exactly like a hub message will be reported as one.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    DeviceStatus(DeviceStatus),
    PlayerOffline(RpcErrorResponse),
    Relay(String),
}

impl HubEvent {
    pub fn decode(text: &str) -> Self {
        if let Ok(status) = serde_json::from_str::<DeviceStatus>(text) {
            if status.method == DEVICE_STATUS_METHOD {
                return HubEvent::DeviceStatus(status);
            }
        }
        if let Ok(reply) = serde_json::from_str::<RpcErrorResponse>(text) {
            if reply.error.code == PLAYER_OFFLINE_CODE {
                return HubEvent::PlayerOffline(reply);
            }
        }
        HubEvent::Relay(text.to_string())
    }

    /// `Some(online)` for status notifications.
    pub fn online(&self) -> Option<bool> {
        match self {
            HubEvent::DeviceStatus(status) => Some(status.params.online),
            _ => None,
        }
    }
}
