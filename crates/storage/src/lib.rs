use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use shared::{
    domain::{OwnedRobot, RobotId},
    protocol::RobotState,
};

pub const DEFAULT_UI_TYPE: &str = "default";

/// Last-known robot state, keyed by robot id.
///
/// A miss is `Ok(None)`; an `Err` means the cache itself could not be reached.
#[async_trait]
pub trait StateCache: Send + Sync {
    async fn get(&self, robot_id: &RobotId) -> Result<Option<RobotState>>;

    /// Overwrites the whole document. Callers wanting a partial update read,
    /// modify and write back.
    async fn set(&self, robot_id: &RobotId, state: &RobotState) -> Result<()>;
}

/// Which robots an operator owns.
#[async_trait]
pub trait OwnershipStore: Send + Sync {
    async fn robots_for_owner(&self, owner: &str) -> Result<Vec<OwnedRobot>>;
}

/// Opaque mission lists stored per (owner, robot).
#[async_trait]
pub trait MissionStore: Send + Sync {
    async fn put_missions(&self, owner: &str, robot_id: &RobotId, missions: &[Value])
        -> Result<()>;

    async fn get_missions(&self, owner: &str, robot_id: &RobotId)
        -> Result<Option<StoredMissions>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMissions {
    pub missions: Vec<Value>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

pub fn state_key(robot_id: &RobotId) -> String {
    format!("robot:{robot_id}:state")
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_acquire_timeout(database_url, Duration::from_secs(5)).await
    }

    pub async fn with_acquire_timeout(database_url: &str, acquire_timeout: Duration) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_cache (
                key        TEXT PRIMARY KEY NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure kv_cache table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS robot_owners (
                email    TEXT NOT NULL,
                robot_id TEXT NOT NULL,
                ui_type  TEXT,
                PRIMARY KEY (email, robot_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure robot_owners table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS robot_missions (
                email      TEXT NOT NULL,
                robot_id   TEXT NOT NULL,
                missions   TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (email, robot_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure robot_missions table exists")?;

        Ok(())
    }

    /// Records that `owner` controls `robot_id`. A `None` ui type reads back
    /// as [`DEFAULT_UI_TYPE`].
    pub async fn assign_robot(
        &self,
        owner: &str,
        robot_id: &RobotId,
        ui_type: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO robot_owners (email, robot_id, ui_type) VALUES (?, ?, ?)
             ON CONFLICT(email, robot_id) DO UPDATE SET ui_type = excluded.ui_type",
        )
        .bind(owner)
        .bind(robot_id.as_str())
        .bind(ui_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unassign_robot(&self, owner: &str, robot_id: &RobotId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM robot_owners WHERE email = ? AND robot_id = ?")
            .bind(owner)
            .bind(robot_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl StateCache for Storage {
    async fn get(&self, robot_id: &RobotId) -> Result<Option<RobotState>> {
        let row = sqlx::query("SELECT value FROM kv_cache WHERE key = ?")
            .bind(state_key(robot_id))
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw = row.get::<String, _>(0);
        let state = serde_json::from_str::<RobotState>(&raw)
            .with_context(|| format!("cached state for robot '{robot_id}' is not a JSON object"))?;
        Ok(Some(state))
    }

    async fn set(&self, robot_id: &RobotId, state: &RobotState) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        sqlx::query(
            "INSERT INTO kv_cache (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(state_key(robot_id))
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl OwnershipStore for Storage {
    async fn robots_for_owner(&self, owner: &str) -> Result<Vec<OwnedRobot>> {
        let rows = sqlx::query(
            "SELECT robot_id, ui_type FROM robot_owners WHERE email = ? ORDER BY robot_id",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| OwnedRobot {
                robot_id: RobotId(r.get::<String, _>(0)),
                ui_type: r
                    .get::<Option<String>, _>(1)
                    .unwrap_or_else(|| DEFAULT_UI_TYPE.to_string()),
            })
            .collect())
    }
}

#[async_trait]
impl MissionStore for Storage {
    async fn put_missions(
        &self,
        owner: &str,
        robot_id: &RobotId,
        missions: &[Value],
    ) -> Result<()> {
        let raw = serde_json::to_string(missions)?;
        sqlx::query(
            "INSERT INTO robot_missions (email, robot_id, missions, updated_at)
             VALUES (?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(email, robot_id) DO UPDATE SET
                missions = excluded.missions,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(owner)
        .bind(robot_id.as_str())
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_missions(
        &self,
        owner: &str,
        robot_id: &RobotId,
    ) -> Result<Option<StoredMissions>> {
        let row = sqlx::query(
            "SELECT missions, updated_at FROM robot_missions WHERE email = ? AND robot_id = ?",
        )
        .bind(owner)
        .bind(robot_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let missions = serde_json::from_str::<Vec<Value>>(&row.get::<String, _>(0))
            .with_context(|| format!("stored missions for robot '{robot_id}' are not a list"))?;
        Ok(Some(StoredMissions {
            missions,
            updated_at: row.get::<DateTime<Utc>, _>(1),
        }))
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
