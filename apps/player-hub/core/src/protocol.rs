//! JSON-RPC envelopes generated or inspected by the hub.
//!
//! Everything else that crosses the relay is opaque text and never touches
//! these types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::DeviceId;

pub const JSONRPC_VERSION: &str = "2.0";

/// Method name of the status notification pushed to controllers.
pub const DEVICE_STATUS_METHOD: &str = "PlayerHub.DeviceStatus";

/// Error code returned when a request cannot reach the player.
pub const PLAYER_OFFLINE_CODE: i64 = -32001;
pub const PLAYER_OFFLINE_MESSAGE: &str = "Player is offline";

/// Close code sent to a player replaced by a newer connection for the same device.
pub const CLOSE_SUPERSEDED: u16 = 4000;
/// Close code sent to every connection when the server shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code for connections dropped for falling behind or idling out.
pub const CLOSE_POLICY: u16 = 1008;

/// `{"jsonrpc":"2.0","method":"PlayerHub.DeviceStatus","params":{...}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub jsonrpc: String,
    pub method: String,
    pub params: DeviceStatusParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatusParams {
    pub device_id: DeviceId,
    pub online: bool,
}

impl DeviceStatus {
    pub fn new(device_id: DeviceId, online: bool) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: DEVICE_STATUS_METHOD.to_string(),
            params: DeviceStatusParams { device_id, online },
        }
    }
}

/// JSON-RPC error response with the caller's `id` echoed back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorResponse {
    pub jsonrpc: String,
    pub id: Value,
    pub error: RpcError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcErrorResponse {
    pub fn player_offline(id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error: RpcError {
                code: PLAYER_OFFLINE_CODE,
                message: PLAYER_OFFLINE_MESSAGE.to_string(),
            },
        }
    }
}

/// The only part of a controller frame the hub ever looks at.
///
/// Unknown fields are ignored and a frame that is not a JSON object simply
/// fails to decode, which callers treat as "not a request".
#[derive(Debug, Default, Deserialize)]
pub struct RpcProbe {
    #[serde(default)]
    pub id: Option<Value>,
}

impl RpcProbe {
    pub fn parse(raw: &str) -> Option<Self> {
        // Derived struct impls also accept JSON arrays; only objects are requests.
        let value: Value = serde_json::from_str(raw).ok()?;
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    /// Request id, if the frame uses request semantics. `null` counts as absent.
    pub fn request_id(&self) -> Option<&Value> {
        self.id.as_ref().filter(|id| !id.is_null())
    }
}
