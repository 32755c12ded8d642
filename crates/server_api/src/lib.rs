use std::sync::Arc;

use serde_json::Value;
use shared::{
    domain::{ClaimedIdentity, RobotId},
    error::ApiError,
    protocol::{
        MissionsResponse, OwnedRobotsResponse, RobotState, SaveMissionsRequest,
        SaveMissionsResponse,
    },
};
use storage::{MissionStore, OwnershipStore, StateCache, Storage};
use tracing::{error, info};

pub mod auth;

pub use auth::{claimed_identity, CredentialError};

#[derive(Clone)]
pub struct ApiContext {
    pub cache: Arc<dyn StateCache>,
    pub owners: Arc<dyn OwnershipStore>,
    pub missions: Arc<dyn MissionStore>,
}

impl ApiContext {
    /// One SQLite database standing in for the cache and both document stores.
    pub fn from_storage(storage: Storage) -> Self {
        let storage = Arc::new(storage);
        Self {
            cache: storage.clone(),
            owners: storage.clone(),
            missions: storage,
        }
    }
}

pub async fn robot_state(ctx: &ApiContext, robot_id: &RobotId) -> Result<RobotState, ApiError> {
    ctx.cache
        .get(robot_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("Robot state not found"))
}

pub async fn owned_robots(
    ctx: &ApiContext,
    identity: &ClaimedIdentity,
) -> Result<OwnedRobotsResponse, ApiError> {
    let robots = ctx
        .owners
        .robots_for_owner(identity.as_str())
        .await
        .map_err(internal)?;
    Ok(OwnedRobotsResponse { robots })
}

/// Stores the mission list verbatim, replacing whatever was saved for the
/// same owner and robot.
pub async fn save_missions(
    ctx: &ApiContext,
    identity: &ClaimedIdentity,
    request: SaveMissionsRequest,
) -> Result<SaveMissionsResponse, ApiError> {
    let robot_id = request
        .robot_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::validation("Invalid mission payload"))?;
    let Value::Array(missions) = request.missions else {
        return Err(ApiError::validation("Invalid mission payload"));
    };

    ctx.missions
        .put_missions(identity.as_str(), &robot_id, &missions)
        .await
        .map_err(internal)?;
    info!(%identity, %robot_id, count = missions.len(), "missions saved");
    Ok(SaveMissionsResponse {
        status: "saved".to_string(),
    })
}

/// Never a not-found: an owner with nothing saved gets an empty list.
pub async fn load_missions(
    ctx: &ApiContext,
    identity: &ClaimedIdentity,
    robot_id: &RobotId,
) -> Result<MissionsResponse, ApiError> {
    let stored = ctx
        .missions
        .get_missions(identity.as_str(), robot_id)
        .await
        .map_err(internal)?;
    Ok(MissionsResponse {
        missions: stored.map(|stored| stored.missions).unwrap_or_default(),
    })
}

fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %format!("{err:#}"), "storage call failed");
    ApiError::internal(err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
