//! Shared primitives for the player hub: device identifiers, connection roles
//! and the handful of JSON-RPC envelopes the hub itself produces or inspects.

mod device;
pub mod protocol;

pub use device::{DeviceId, Role};
pub use protocol::{
    DeviceStatus, DeviceStatusParams, RpcError, RpcErrorResponse, RpcProbe, CLOSE_GOING_AWAY,
    CLOSE_POLICY, CLOSE_SUPERSEDED, DEVICE_STATUS_METHOD, JSONRPC_VERSION, PLAYER_OFFLINE_CODE,
    PLAYER_OFFLINE_MESSAGE,
};
