//! In-memory registry of players and controllers, keyed by device id, plus
//! the routing and status fan-out that runs on top of it.
//!
//! Each device id owns one `DeviceSlot` in a `DashMap`. Status pushes and
//! controller snapshots are made under the slot's shard write lock and only
//! ever report the state the registry holds at that moment, so controllers
//! see statuses in registry order. Sends are `try_send` and never block while
//! a guard is held. No method takes a second guard or iterates the map while
//! holding one.

use std::{borrow::Cow, collections::HashMap, sync::Arc};

use dashmap::DashMap;
use metrics::{counter, gauge};
use player_hub_core::{
    DeviceId, DeviceStatus, Role, RpcErrorResponse, RpcProbe, CLOSE_POLICY, CLOSE_SUPERSEDED,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionId, SendError};

#[derive(Clone, Default)]
pub struct PlayerHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    devices: DashMap<DeviceId, DeviceSlot>,
}

#[derive(Default)]
struct DeviceSlot {
    player: Option<Connection>,
    controllers: HashMap<ConnectionId, Connection>,
}

impl DeviceSlot {
    fn is_empty(&self) -> bool {
        self.player.is_none() && self.controllers.is_empty()
    }

    fn holds_player(&self, conn: &Connection) -> bool {
        self.player.as_ref().map(Connection::id) == Some(conn.id())
    }

    /// Sends to every controller in the slot. Returns the number delivered
    /// and the connections whose send failed; those are not removed.
    fn deliver<F>(&self, device_id: &DeviceId, send: F) -> (usize, Vec<Connection>)
    where
        F: Fn(&Connection) -> Result<(), SendError>,
    {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for conn in self.controllers.values() {
            match send(conn) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    record_send_failure(Role::Controller, &err);
                    warn!(
                        device_id = %device_id,
                        connection_id = %conn.id(),
                        error = %err,
                        "failed to send to controller; evicting"
                    );
                    dead.push(conn.clone());
                }
            }
        }
        (delivered, dead)
    }

    fn evict(&mut self, dead: &[Connection]) -> usize {
        let evicted = dead
            .iter()
            .filter(|conn| self.controllers.remove(&conn.id()).is_some())
            .count();
        for conn in dead {
            conn.close(CLOSE_POLICY, "send failed");
        }
        evicted
    }

    /// Pushes a `PlayerHub.DeviceStatus` notification to the slot's
    /// controllers and evicts the ones that cannot take it.
    fn push_status(&mut self, device_id: &DeviceId, online: bool) -> FanOut {
        let payload = match serde_json::to_string(&DeviceStatus::new(device_id.clone(), online)) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(device_id = %device_id, error = %err, "failed to encode device status");
                return FanOut::default();
            }
        };
        let (delivered, dead) = self.deliver(device_id, |conn| conn.send_text(payload.as_str()));
        let evicted = self.evict(&dead);
        debug!(device_id = %device_id, online, delivered, "device status pushed");
        FanOut { delivered, evicted }
    }
}

/// Result of delivering one frame to every controller of a device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub evicted: usize,
}

/// What happened to a frame sent by a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerRoute {
    /// Handed to the device's player.
    Forwarded,
    /// No player; the sender got a JSON-RPC "Player is offline" error.
    OfflineReply,
    /// No player and nothing to answer (notification or non-JSON frame).
    Dropped,
    /// The player could not take the frame and was deregistered.
    PlayerLost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    pub player_online: bool,
    pub controllers: usize,
}

impl PlayerHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `conn` as the player for `device_id`, closing any previous
    /// player with code 4000, and tells controllers the device is online.
    pub fn register_player(&self, device_id: &DeviceId, conn: Connection) {
        let connection_id = conn.id();
        let (previous, fan_out) = {
            let mut slot = self.inner.devices.entry(device_id.clone()).or_default();
            let previous = slot.player.replace(conn);
            (previous, slot.push_status(device_id, true))
        };

        if let Some(previous) = previous.filter(|old| old.id() != connection_id) {
            previous.close(CLOSE_SUPERSEDED, "superseded");
            counter!("player_hub_players_superseded_total", 1);
            info!(
                device_id = %device_id,
                connection_id = %connection_id,
                superseded = %previous.id(),
                "player replaced an existing connection"
            );
        }
        if fan_out.evicted > 0 {
            self.record_controllers_active();
        }
        self.record_players_online();
        info!(device_id = %device_id, connection_id = %connection_id, "player connected");
    }

    /// Removes `conn` as player for `device_id` if it is still the current
    /// one. Returns `false` for stale or unknown registrations. Callers send
    /// the offline status themselves.
    pub fn unregister_player(&self, device_id: &DeviceId, conn: &Connection) -> bool {
        let removed = self
            .inner
            .devices
            .get_mut(device_id)
            .map(|mut slot| {
                let current = slot.holds_player(conn);
                if current {
                    slot.player = None;
                }
                current
            })
            .unwrap_or(false);
        if removed {
            self.prune(device_id);
            self.record_players_online();
            info!(device_id = %device_id, connection_id = %conn.id(), "player disconnected");
        }
        removed
    }

    /// Adds `conn` to the controllers of `device_id` and sends it the current
    /// online state of the device.
    pub fn register_controller(&self, device_id: &DeviceId, conn: Connection) {
        let (online, total) = {
            let mut slot = self.inner.devices.entry(device_id.clone()).or_default();
            let online = slot.player.is_some();
            if let Err(err) = conn.send_json(&DeviceStatus::new(device_id.clone(), online)) {
                warn!(
                    device_id = %device_id,
                    connection_id = %conn.id(),
                    error = %err,
                    "failed to send status snapshot"
                );
            }
            slot.controllers.insert(conn.id(), conn.clone());
            (online, slot.controllers.len())
        };
        self.record_controllers_active();
        info!(
            device_id = %device_id,
            connection_id = %conn.id(),
            online,
            total,
            "controller connected"
        );
    }

    pub fn unregister_controller(&self, device_id: &DeviceId, conn: &Connection) -> bool {
        let removed = self
            .inner
            .devices
            .get_mut(device_id)
            .map(|mut slot| slot.controllers.remove(&conn.id()).is_some())
            .unwrap_or(false);
        if removed {
            self.prune(device_id);
            self.record_controllers_active();
            info!(device_id = %device_id, connection_id = %conn.id(), "controller disconnected");
        }
        removed
    }

    /// Relays a player frame verbatim to every controller of the device.
    /// Controllers that cannot take it are evicted and closed.
    pub fn route_from_player(&self, device_id: &DeviceId, raw: &str) -> FanOut {
        let (delivered, dead) = match self.inner.devices.get(device_id) {
            Some(slot) => slot.deliver(device_id, |conn| conn.send_text(raw)),
            None => return FanOut::default(),
        };

        let mut fan_out = FanOut {
            delivered,
            evicted: 0,
        };
        if !dead.is_empty() {
            if let Some(mut slot) = self.inner.devices.get_mut(device_id) {
                fan_out.evicted = slot.evict(&dead);
            }
            self.prune(device_id);
            self.record_controllers_active();
        }
        if delivered > 0 {
            counter!(
                "player_hub_frames_forwarded_total",
                delivered as u64,
                "direction" => "to_controllers"
            );
        }
        fan_out
    }

    /// Relays a controller frame verbatim to the device's player, answering
    /// requests with a JSON-RPC error when there is none.
    pub fn route_from_controller(
        &self,
        device_id: &DeviceId,
        origin: &Connection,
        raw: &str,
    ) -> ControllerRoute {
        let player = self
            .inner
            .devices
            .get(device_id)
            .and_then(|slot| slot.player.clone());
        let Some(player) = player else {
            return self.reply_offline(device_id, origin, raw);
        };

        match player.send_text(raw) {
            Ok(()) => {
                counter!("player_hub_frames_forwarded_total", 1, "direction" => "to_player");
                ControllerRoute::Forwarded
            }
            Err(err) => {
                record_send_failure(Role::Player, &err);
                warn!(
                    device_id = %device_id,
                    connection_id = %player.id(),
                    error = %err,
                    "failed to forward frame to player; dropping it"
                );
                if self.unregister_player(device_id, &player) {
                    player.close(CLOSE_POLICY, "send failed");
                    self.notify_status(device_id, false);
                }
                ControllerRoute::PlayerLost
            }
        }
    }

    /// Pushes a `PlayerHub.DeviceStatus` notification to every controller of
    /// the device.
    ///
    /// `online` is checked against the registry under the device's lock. A
    /// report that no longer holds is dropped, since whoever changed the
    /// registry since then has already pushed the newer state.
    pub fn notify_status(&self, device_id: &DeviceId, online: bool) -> FanOut {
        let fan_out = match self.inner.devices.get_mut(device_id) {
            Some(mut slot) if slot.player.is_some() == online => slot.push_status(device_id, online),
            Some(_) => {
                debug!(device_id = %device_id, online, "skipping stale device status");
                return FanOut::default();
            }
            None => return FanOut::default(),
        };
        if fan_out.evicted > 0 {
            self.prune(device_id);
            self.record_controllers_active();
        }
        fan_out
    }

    pub fn is_online(&self, device_id: &DeviceId) -> bool {
        self.inner
            .devices
            .get(device_id)
            .is_some_and(|slot| slot.player.is_some())
    }

    pub fn controller_count(&self, device_id: &DeviceId) -> usize {
        self.inner
            .devices
            .get(device_id)
            .map(|slot| slot.controllers.len())
            .unwrap_or(0)
    }

    /// Every device with a player or at least one controller, sorted by id.
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let mut snapshot: Vec<DeviceSnapshot> = self
            .inner
            .devices
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| DeviceSnapshot {
                device_id: entry.key().clone(),
                player_online: entry.value().player.is_some(),
                controllers: entry.value().controllers.len(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        snapshot
    }

    /// Closes every registered connection. Used on shutdown; the socket tasks
    /// deregister themselves as they wind down.
    pub fn close_all(&self, code: u16, reason: &'static str) -> usize {
        let mut targets = Vec::new();
        for entry in self.inner.devices.iter() {
            targets.extend(entry.value().player.iter().cloned());
            targets.extend(entry.value().controllers.values().cloned());
        }

        targets
            .iter()
            .filter(|conn| conn.close(code, Cow::Borrowed(reason)))
            .count()
    }

    fn reply_offline(&self, device_id: &DeviceId, origin: &Connection, raw: &str) -> ControllerRoute {
        let Some(id) = RpcProbe::parse(raw).and_then(|probe| probe.request_id().cloned()) else {
            debug!(device_id = %device_id, "player offline; dropping controller notification");
            return ControllerRoute::Dropped;
        };

        counter!("player_hub_offline_replies_total", 1);
        if let Err(err) = origin.send_json(&RpcErrorResponse::player_offline(id)) {
            warn!(
                device_id = %device_id,
                connection_id = %origin.id(),
                error = %err,
                "failed to send offline reply"
            );
        }
        ControllerRoute::OfflineReply
    }

    /// Drops the slot once it has neither a player nor controllers. Checked
    /// under the shard lock, so a connection that registered in between
    /// keeps it alive.
    fn prune(&self, device_id: &DeviceId) {
        self.inner
            .devices
            .remove_if(device_id, |_, slot| slot.is_empty());
    }

    fn record_players_online(&self) {
        let online = self
            .inner
            .devices
            .iter()
            .filter(|entry| entry.value().player.is_some())
            .count();
        gauge!("player_hub_players_online", online as f64);
    }

    fn record_controllers_active(&self) {
        let active: usize = self
            .inner
            .devices
            .iter()
            .map(|entry| entry.value().controllers.len())
            .sum();
        gauge!("player_hub_controllers_active", active as f64);
    }
}

fn record_send_failure(role: Role, err: &SendError) {
    counter!(
        "player_hub_send_failures_total",
        1,
        "role" => role.as_str(),
        "reason" => err.metric_label()
    );
}
