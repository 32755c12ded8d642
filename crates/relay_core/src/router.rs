//! Event handlers for robot and UI connections.
//!
//! Every handler mutates the registry and snapshots its fan-out targets
//! under one lock, releases it, then talks to the state cache and sends.
//! Missing fields and unknown targets are soft failures reported as
//! [`Outcome::Dropped`]; only state cache failures are errors.
//!
//! Connection-flag transitions (register and close) for one robot run under a
//! per-robot lock held across the cache read-modify-write, so a late close
//! can never overwrite the state written by a newer registration.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde_json::{Map, Value};
use shared::{
    domain::{ConnectionId, RobotId},
    protocol::{
        CommandToRobot, InboundEvent, OutboundEvent, RegisterRobot, RegisterUi, RobotImage,
        RobotState,
    },
};
use storage::StateCache;
use thiserror::Error;
use tokio::{
    sync::{mpsc, Mutex, OwnedMutexGuard},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::registry::ConnectionRegistry;

pub type PeerSender = mpsc::UnboundedSender<OutboundEvent>;
pub type PeerReceiver = mpsc::UnboundedReceiver<OutboundEvent>;

pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    MissingField(&'static str),
    UnknownTarget(RobotId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Number of peers the event was handed to.
    Delivered(usize),
    Dropped(DropReason),
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("state cache failed for robot '{robot_id}': {cause:#}")]
    Cache {
        robot_id: RobotId,
        cause: anyhow::Error,
    },
    #[error("state cache did not answer within {after:?} for robot '{robot_id}'")]
    CacheTimeout { robot_id: RobotId, after: Duration },
}

#[derive(Default)]
struct RoutingTable {
    registry: ConnectionRegistry,
    peers: HashMap<ConnectionId, PeerSender>,
}

impl RoutingTable {
    fn senders<'a>(
        &self,
        connections: impl IntoIterator<Item = &'a ConnectionId>,
    ) -> Vec<(ConnectionId, PeerSender)> {
        connections
            .into_iter()
            .filter_map(|connection| {
                self.peers
                    .get(connection)
                    .map(|sender| (*connection, sender.clone()))
            })
            .collect()
    }
}

pub struct EventRouter {
    table: Mutex<RoutingTable>,
    transitions: Mutex<HashMap<RobotId, Arc<Mutex<()>>>>,
    cache: Arc<dyn StateCache>,
    cache_timeout: Duration,
}

impl EventRouter {
    pub fn new(cache: Arc<dyn StateCache>) -> Self {
        Self {
            table: Mutex::new(RoutingTable::default()),
            transitions: Mutex::new(HashMap::new()),
            cache,
            cache_timeout: DEFAULT_CACHE_TIMEOUT,
        }
    }

    pub fn with_cache_timeout(mut self, cache_timeout: Duration) -> Self {
        self.cache_timeout = cache_timeout;
        self
    }

    /// Admits a new transport session. Registration waits for the first typed
    /// event; until then the peer only receives global broadcasts.
    pub async fn connect(&self) -> (ConnectionId, PeerReceiver) {
        let connection = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.table.lock().await.peers.insert(connection, tx);
        info!(%connection, "peer connected");
        (connection, rx)
    }

    pub async fn handle(
        &self,
        connection: ConnectionId,
        event: InboundEvent,
    ) -> Result<Outcome, RouterError> {
        match event {
            InboundEvent::RegisterRobot(req) => self.register_robot(connection, req).await,
            InboundEvent::RegisterUi(req) => self.register_ui(connection, req).await,
            InboundEvent::CommandToRobot(req) => self.command_to_robot(connection, req).await,
            InboundEvent::StatusUpdate(fields) => self.status_update(connection, fields).await,
            InboundEvent::RobotImage(req) => self.robot_image(connection, req).await,
        }
    }

    pub async fn register_robot(
        &self,
        connection: ConnectionId,
        req: RegisterRobot,
    ) -> Result<Outcome, RouterError> {
        let Some(robot_id) = req.robot_id.filter(|id| !id.is_empty()) else {
            warn!(%connection, "register_robot without robot_id dropped");
            return Ok(Outcome::Dropped(DropReason::MissingField("robot_id")));
        };

        let _transition = self.transition_guard(&robot_id).await;
        self.table
            .lock()
            .await
            .registry
            .register_robot(connection, robot_id.clone());
        info!(%connection, %robot_id, "robot registered");

        let mut state = self.cached_state(&robot_id).await?.unwrap_or_default();
        state.mark_connected();
        self.store_state(&robot_id, &state).await?;

        let targets = {
            let table = self.table.lock().await;
            table.senders(table.peers.keys())
        };
        Ok(Outcome::Delivered(fan_out(
            &targets,
            &OutboundEvent::Status(state),
        )))
    }

    pub async fn register_ui(
        &self,
        connection: ConnectionId,
        req: RegisterUi,
    ) -> Result<Outcome, RouterError> {
        let Some(identity) = req.email.filter(|email| !email.is_empty()) else {
            warn!(%connection, "register_ui without email dropped");
            return Ok(Outcome::Dropped(DropReason::MissingField("email")));
        };

        let sender = {
            let mut table = self.table.lock().await;
            table
                .registry
                .register_ui(connection, identity.clone(), req.robot_ids.iter().cloned());
            table.peers.get(&connection).cloned()
        };
        info!(
            %connection,
            %identity,
            robots = req.robot_ids.len(),
            "ui registered"
        );

        let Some(sender) = sender else {
            return Ok(Outcome::Delivered(0));
        };
        let targets = [(connection, sender)];
        let mut delivered = 0;
        for robot_id in &req.robot_ids {
            if let Some(state) = self.cached_state(robot_id).await? {
                delivered += fan_out(&targets, &OutboundEvent::Status(state));
            }
        }
        Ok(Outcome::Delivered(delivered))
    }

    pub async fn command_to_robot(
        &self,
        connection: ConnectionId,
        req: CommandToRobot,
    ) -> Result<Outcome, RouterError> {
        let Some(robot_id) = req.robot_id.filter(|id| !id.is_empty()) else {
            warn!(%connection, "command_to_robot without robot_id dropped");
            return Ok(Outcome::Dropped(DropReason::MissingField("robot_id")));
        };
        let Some(command) = req.command else {
            warn!(%connection, %robot_id, "command_to_robot without command dropped");
            return Ok(Outcome::Dropped(DropReason::MissingField("command")));
        };

        let target = {
            let table = self.table.lock().await;
            table
                .registry
                .lookup_robot_connection(&robot_id)
                .and_then(|robot_conn| table.senders([&robot_conn]).pop())
        };
        let Some(target) = target else {
            warn!(%connection, %robot_id, %command, "robot not connected; command dropped");
            return Ok(Outcome::Dropped(DropReason::UnknownTarget(robot_id)));
        };

        let delivered = fan_out(&[target], &OutboundEvent::Command { command });
        if delivered == 0 {
            return Ok(Outcome::Dropped(DropReason::UnknownTarget(robot_id)));
        }
        debug!(%connection, %robot_id, "command relayed");
        Ok(Outcome::Delivered(delivered))
    }

    /// Replaces the cached state with the payload, stamped connected, and
    /// sends it to the robot's subscribers.
    pub async fn status_update(
        &self,
        connection: ConnectionId,
        fields: Map<String, Value>,
    ) -> Result<Outcome, RouterError> {
        let robot_id = match fields.get("robot_id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => RobotId::from(id),
            _ => {
                warn!(%connection, "status_update without robot_id dropped");
                return Ok(Outcome::Dropped(DropReason::MissingField("robot_id")));
            }
        };

        let state = RobotState::from_status_update(fields);
        self.store_state(&robot_id, &state).await?;
        debug!(%connection, %robot_id, "status updated");

        let targets = self.subscriber_senders(&robot_id).await;
        Ok(Outcome::Delivered(fan_out(
            &targets,
            &OutboundEvent::Status(state),
        )))
    }

    /// Relays one camera frame to the robot's subscribers. Frames are never
    /// cached.
    pub async fn robot_image(
        &self,
        connection: ConnectionId,
        req: RobotImage,
    ) -> Result<Outcome, RouterError> {
        let Some(robot_id) = req.robot_id.filter(|id| !id.is_empty()) else {
            warn!(%connection, "robot_image without robot_id dropped");
            return Ok(Outcome::Dropped(DropReason::MissingField("robot_id")));
        };
        let Some(image_base64) = req.image_base64.filter(|data| !data.is_empty()) else {
            warn!(%connection, %robot_id, "robot_image without image_base64 dropped");
            return Ok(Outcome::Dropped(DropReason::MissingField("image_base64")));
        };

        let targets = self.subscriber_senders(&robot_id).await;
        Ok(Outcome::Delivered(fan_out(
            &targets,
            &OutboundEvent::RobotImage {
                robot_id,
                image_base64,
            },
        )))
    }

    /// Close notification. Releases the connection's registrations and marks
    /// every robot it still spoke for as disconnected, telling that robot's
    /// subscribers. A cache failure for one robot does not stop the others.
    pub async fn disconnect(&self, connection: ConnectionId) -> Result<Outcome, RouterError> {
        let (removal, notify) = {
            let mut table = self.table.lock().await;
            table.peers.remove(&connection);
            let removal = table.registry.remove_connection(connection);
            let notify: Vec<_> = removal
                .freed_robots
                .iter()
                .map(|freed| {
                    (
                        freed.robot_id.clone(),
                        table.senders(freed.subscribers.iter()),
                    )
                })
                .collect();
            (removal, notify)
        };
        info!(
            %connection,
            robots = removal.freed_robots.len(),
            identities = removal.ui_identities.len(),
            "peer disconnected"
        );

        let mut delivered = 0;
        let mut first_error = None;
        for (robot_id, targets) in notify {
            match self.mark_disconnected(&robot_id, &targets).await {
                Ok(Some(sent)) => {
                    info!(%robot_id, "robot disconnected");
                    delivered += sent;
                }
                Ok(None) => debug!(%robot_id, "robot re-registered before close settled"),
                Err(err) => {
                    warn!(%robot_id, error = %err, "failed to record disconnect");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(Outcome::Delivered(delivered)),
        }
    }

    pub async fn connected_robots(&self) -> usize {
        self.table.lock().await.registry.connected_robots()
    }

    pub async fn peer_count(&self) -> usize {
        self.table.lock().await.peers.len()
    }

    /// Records the disconnect and tells `targets`, unless another connection
    /// has bound the robot since the registry released it. `None` means
    /// nothing was written or sent.
    async fn mark_disconnected(
        &self,
        robot_id: &RobotId,
        targets: &[(ConnectionId, PeerSender)],
    ) -> Result<Option<usize>, RouterError> {
        let _transition = self.transition_guard(robot_id).await;
        let rebound = self
            .table
            .lock()
            .await
            .registry
            .lookup_robot_connection(robot_id)
            .is_some();
        if rebound {
            return Ok(None);
        }

        let mut state = self.cached_state(robot_id).await?.unwrap_or_default();
        state.mark_disconnected();
        self.store_state(robot_id, &state).await?;
        Ok(Some(fan_out(targets, &OutboundEvent::Status(state))))
    }

    async fn transition_guard(&self, robot_id: &RobotId) -> OwnedMutexGuard<()> {
        let lock = self
            .transitions
            .lock()
            .await
            .entry(robot_id.clone())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    async fn subscriber_senders(&self, robot_id: &RobotId) -> Vec<(ConnectionId, PeerSender)> {
        let table = self.table.lock().await;
        let subscribers = table.registry.lookup_subscribers(robot_id);
        table.senders(subscribers.iter())
    }

    async fn cached_state(&self, robot_id: &RobotId) -> Result<Option<RobotState>, RouterError> {
        match timeout(self.cache_timeout, self.cache.get(robot_id)).await {
            Ok(result) => result.map_err(|cause| RouterError::Cache {
                robot_id: robot_id.clone(),
                cause,
            }),
            Err(_) => Err(RouterError::CacheTimeout {
                robot_id: robot_id.clone(),
                after: self.cache_timeout,
            }),
        }
    }

    async fn store_state(&self, robot_id: &RobotId, state: &RobotState) -> Result<(), RouterError> {
        match timeout(self.cache_timeout, self.cache.set(robot_id, state)).await {
            Ok(result) => result.map_err(|cause| RouterError::Cache {
                robot_id: robot_id.clone(),
                cause,
            }),
            Err(_) => Err(RouterError::CacheTimeout {
                robot_id: robot_id.clone(),
                after: self.cache_timeout,
            }),
        }
    }
}

/// Hands `event` to every target, skipping peers whose writer has gone away.
fn fan_out(targets: &[(ConnectionId, PeerSender)], event: &OutboundEvent) -> usize {
    let mut delivered = 0;
    for (connection, sender) in targets {
        if sender.send(event.clone()).is_ok() {
            delivered += 1;
        } else {
            debug!(%connection, "peer writer closed; skipping");
        }
    }
    delivered
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
