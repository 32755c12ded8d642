//! In-memory routing table: which connection speaks for which robot or
//! operator, and which UI connections follow which robots.
//!
//! The registry is plain data with no locking of its own. [`EventRouter`]
//! owns it behind a single mutex so that a mutation and the subscriber
//! snapshot that depends on it happen in one critical section.
//!
//! [`EventRouter`]: crate::router::EventRouter

use std::collections::{HashMap, HashSet};

use shared::domain::{ConnectionId, RobotId, UiIdentity};

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    robot_connection: HashMap<RobotId, ConnectionId>,
    ui_connections: HashMap<UiIdentity, HashSet<ConnectionId>>,
    connection_subscriptions: HashMap<ConnectionId, HashSet<RobotId>>,
    robot_subscribers: HashMap<RobotId, HashSet<ConnectionId>>,
}

/// A robot binding released by [`ConnectionRegistry::remove_connection`],
/// with the UI connections that were following it at that moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreedRobot {
    pub robot_id: RobotId,
    pub subscribers: HashSet<ConnectionId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removal {
    pub freed_robots: Vec<FreedRobot>,
    pub ui_identities: Vec<UiIdentity>,
    pub unsubscribed: Vec<RobotId>,
}

impl Removal {
    /// True when the connection never registered in any role.
    pub fn is_noop(&self) -> bool {
        self.freed_robots.is_empty() && self.ui_identities.is_empty() && self.unsubscribed.is_empty()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `robot_id` to `connection`. A previous binding is replaced, not
    /// closed; its connection is cleaned up by its own close notification.
    pub fn register_robot(&mut self, connection: ConnectionId, robot_id: RobotId) {
        self.robot_connection.insert(robot_id, connection);
    }

    /// Adds `connection` to the identity's connection set and subscribes it
    /// to every robot in `robot_ids`. Repeated calls union the subscriptions.
    pub fn register_ui(
        &mut self,
        connection: ConnectionId,
        identity: UiIdentity,
        robot_ids: impl IntoIterator<Item = RobotId>,
    ) {
        self.ui_connections
            .entry(identity)
            .or_default()
            .insert(connection);

        let subscriptions = self.connection_subscriptions.entry(connection).or_default();
        for robot_id in robot_ids {
            self.robot_subscribers
                .entry(robot_id.clone())
                .or_default()
                .insert(connection);
            subscriptions.insert(robot_id);
        }
    }

    pub fn lookup_robot_connection(&self, robot_id: &RobotId) -> Option<ConnectionId> {
        self.robot_connection.get(robot_id).copied()
    }

    pub fn lookup_subscribers(&self, robot_id: &RobotId) -> HashSet<ConnectionId> {
        self.robot_subscribers
            .get(robot_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drops every trace of `connection`.
    ///
    /// Robot bindings are released first and carry the subscriber set as it
    /// stood before any UI-side cleanup. A connection that never registered
    /// yields an empty [`Removal`].
    pub fn remove_connection(&mut self, connection: ConnectionId) -> Removal {
        let mut removal = Removal::default();

        let mut freed: Vec<RobotId> = self
            .robot_connection
            .iter()
            .filter(|(_, bound)| **bound == connection)
            .map(|(robot_id, _)| robot_id.clone())
            .collect();
        freed.sort();
        for robot_id in freed {
            self.robot_connection.remove(&robot_id);
            let subscribers = self.lookup_subscribers(&robot_id);
            removal.freed_robots.push(FreedRobot {
                robot_id,
                subscribers,
            });
        }

        self.ui_connections.retain(|identity, connections| {
            if connections.remove(&connection) {
                removal.ui_identities.push(identity.clone());
            }
            !connections.is_empty()
        });
        removal.ui_identities.sort();

        if let Some(robot_ids) = self.connection_subscriptions.remove(&connection) {
            for robot_id in robot_ids {
                if let Some(subscribers) = self.robot_subscribers.get_mut(&robot_id) {
                    subscribers.remove(&connection);
                    if subscribers.is_empty() {
                        self.robot_subscribers.remove(&robot_id);
                    }
                }
                removal.unsubscribed.push(robot_id);
            }
            removal.unsubscribed.sort();
        }

        removal
    }

    pub fn ui_connections(&self, identity: &UiIdentity) -> HashSet<ConnectionId> {
        self.ui_connections
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    pub fn subscriptions(&self, connection: ConnectionId) -> HashSet<RobotId> {
        self.connection_subscriptions
            .get(&connection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connected_robots(&self) -> usize {
        self.robot_connection.len()
    }

    pub fn active_ui_identities(&self) -> usize {
        self.ui_connections.len()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
