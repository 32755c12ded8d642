use std::borrow::Cow;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::domain::{OwnedRobot, RobotId, UiIdentity};

pub const CONNECTION_FIELD: &str = "connection";
pub const CONNECTION_STATUS_FIELD: &str = "connection_status";
pub const CONNECTED: &str = "connected";
pub const DISCONNECTED: &str = "disconnected";

pub const STATUS_EVENT: &str = "status";
pub const COMMAND_EVENT: &str = "command";
pub const ROBOT_IMAGE_EVENT_PREFIX: &str = "robot_image_";

/// Last-known status document of a robot.
///
/// Arbitrary telemetry fields in the order the robot reported them, plus the
/// two connection fields the relay manages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RobotState(pub Map<String, Value>);

impl RobotState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the state written by a `status_update`: the payload replaces the
    /// previous document wholesale and is stamped connected.
    pub fn from_status_update(fields: Map<String, Value>) -> Self {
        let mut state = Self(fields);
        state.0.insert(CONNECTION_FIELD.into(), Value::from(CONNECTED));
        state
    }

    pub fn mark_connected(&mut self) {
        self.0.insert(CONNECTION_STATUS_FIELD.into(), Value::from(1));
        self.0.insert(CONNECTION_FIELD.into(), Value::from(CONNECTED));
    }

    pub fn mark_disconnected(&mut self) {
        self.0.insert(CONNECTION_STATUS_FIELD.into(), Value::from(0));
        self.0.insert(CONNECTION_FIELD.into(), Value::from(DISCONNECTED));
    }

    pub fn robot_id(&self) -> Option<&str> {
        self.0.get("robot_id").and_then(Value::as_str)
    }

    pub fn connection(&self) -> Option<&str> {
        self.0.get(CONNECTION_FIELD).and_then(Value::as_str)
    }

    pub fn connection_status(&self) -> Option<i64> {
        self.0.get(CONNECTION_STATUS_FIELD).and_then(Value::as_i64)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRobot {
    #[serde(default)]
    pub robot_id: Option<RobotId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterUi {
    #[serde(default)]
    pub email: Option<UiIdentity>,
    /// `null`, a non-list, and entries that are not non-empty strings are
    /// skipped rather than failing the whole registration.
    #[serde(default, deserialize_with = "lenient_robot_ids")]
    pub robot_ids: Vec<RobotId>,
}

fn lenient_robot_ids<'de, D>(deserializer: D) -> Result<Vec<RobotId>, D::Error>
where
    D: Deserializer<'de>,
{
    let ids = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(RobotId::from)
            .collect(),
        _ => Vec::new(),
    };
    Ok(ids)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandToRobot {
    #[serde(default)]
    pub robot_id: Option<RobotId>,
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RobotImage {
    #[serde(default)]
    pub robot_id: Option<RobotId>,
    #[serde(default)]
    pub image_base64: Option<String>,
}

/// Events a robot or UI sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    RegisterRobot(RegisterRobot),
    RegisterUi(RegisterUi),
    CommandToRobot(CommandToRobot),
    StatusUpdate(Map<String, Value>),
    RobotImage(RobotImage),
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegisterRobot(_) => "register_robot",
            Self::RegisterUi(_) => "register_ui",
            Self::CommandToRobot(_) => "command_to_robot",
            Self::StatusUpdate(_) => "status_update",
            Self::RobotImage(_) => "robot_image",
        }
    }
}

/// Events the relay sends to connected peers.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    Status(RobotState),
    Command { command: String },
    RobotImage { robot_id: RobotId, image_base64: String },
}

#[derive(Serialize)]
struct CommandPayload<'a> {
    command: &'a str,
}

#[derive(Serialize)]
struct ImagePayload<'a> {
    robot_id: &'a RobotId,
    image_base64: &'a str,
}

impl OutboundEvent {
    /// Image frames use a per-robot name so a UI can tell streams apart
    /// without looking at the payload.
    pub fn event_name(&self) -> Cow<'static, str> {
        match self {
            Self::Status(_) => Cow::Borrowed(STATUS_EVENT),
            Self::Command { .. } => Cow::Borrowed(COMMAND_EVENT),
            Self::RobotImage { robot_id, .. } => {
                Cow::Owned(format!("{ROBOT_IMAGE_EVENT_PREFIX}{robot_id}"))
            }
        }
    }

    pub fn payload(&self) -> serde_json::Result<Value> {
        match self {
            Self::Status(state) => serde_json::to_value(state),
            Self::Command { command } => serde_json::to_value(CommandPayload { command }),
            Self::RobotImage {
                robot_id,
                image_base64,
            } => serde_json::to_value(ImagePayload {
                robot_id,
                image_base64,
            }),
        }
    }

    pub fn to_frame(&self) -> serde_json::Result<WireFrame> {
        Ok(WireFrame {
            event: self.event_name().into_owned(),
            data: self.payload()?,
        })
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.to_frame()?)
    }
}

/// Untyped `{event, data}` envelope as it travels over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnedRobotsResponse {
    pub robots: Vec<OwnedRobot>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveMissionsRequest {
    #[serde(default)]
    pub robot_id: Option<RobotId>,
    #[serde(default)]
    pub missions: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveMissionsResponse {
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissionsResponse {
    pub missions: Vec<Value>,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
