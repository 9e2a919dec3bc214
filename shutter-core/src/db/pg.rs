use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, Error as SqlxError, PgPool};

use super::{
    ConnectionSessionData, Database, DatabaseError, DeviceData, InstanceData, IntoDatabaseError,
    MembershipData, NewConnectionSession, NewInstance, NewMembership, PositionData, PrimaryKey,
    Result, ShapeData, SystemTokenData, UserData, UserDeviceData,
};

/// A database implementation using PostgreSQL
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Creates a new instance of [PgDatabase], connecting to the given url
    /// and applying pending migrations.
    pub async fn new(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| DatabaseError::Internal(Box::new(e)))?;

        sqlx::migrate!()
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Internal(Box::new(e)))?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn user_by_id(&self, user_id: PrimaryKey) -> Result<UserData> {
        sqlx::query_as::<_, UserData>(
            "SELECT id, username, profile_image_key FROM users
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.not_found_or("user", &user_id.to_string()))
    }

    async fn device_by_uuid(&self, uuid: &str) -> Result<DeviceData> {
        sqlx::query_as::<_, DeviceData>(
            "SELECT id, uuid FROM devices
             WHERE uuid = $1 AND deleted_at IS NULL",
        )
        .bind(uuid)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.not_found_or("device", uuid))
    }

    async fn user_device(
        &self,
        user_id: PrimaryKey,
        device_id: PrimaryKey,
    ) -> Result<UserDeviceData> {
        sqlx::query_as::<_, UserDeviceData>(
            "SELECT id, user_id, device_id FROM user_devices
             WHERE user_id = $1 AND device_id = $2 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .bind(device_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.not_found_or("pairing", &format!("{}:{}", user_id, device_id)))
    }

    async fn are_friends(&self, user_id: PrimaryKey, other_id: PrimaryKey) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM friendships
             WHERE friendship_hash = $1 AND status = 'accepted' AND deleted_at IS NULL",
        )
        .bind(friendship_hash(user_id, other_id))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.any())?;

        Ok(count > 0)
    }

    async fn push_tokens(&self, user_ids: &[PrimaryKey]) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT token FROM push_tokens
             WHERE user_id = ANY($1) AND deleted_at IS NULL",
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.any())
    }

    async fn create_connection_session(
        &self,
        new_session: NewConnectionSession,
    ) -> Result<ConnectionSessionData> {
        sqlx::query_as::<_, ConnectionSessionData>(
            "INSERT INTO connection_sessions (user_id, device_id, uuid)
             VALUES ($1, $2, $3)
             RETURNING id, user_id, device_id, uuid, started_at, ended_at",
        )
        .bind(new_session.user_id)
        .bind(new_session.device_id)
        .bind(new_session.uuid)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.any())
    }

    async fn connection_session(
        &self,
        user_id: PrimaryKey,
        device_id: PrimaryKey,
        uuid: &str,
    ) -> Result<ConnectionSessionData> {
        sqlx::query_as::<_, ConnectionSessionData>(
            "SELECT id, user_id, device_id, uuid, started_at, ended_at FROM connection_sessions
             WHERE user_id = $1 AND device_id = $2 AND uuid = $3 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .bind(device_id)
        .bind(uuid)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.not_found_or("session", uuid))
    }

    async fn open_connection_sessions(
        &self,
        user_id: PrimaryKey,
        device_id: PrimaryKey,
    ) -> Result<Vec<ConnectionSessionData>> {
        sqlx::query_as::<_, ConnectionSessionData>(
            "SELECT id, user_id, device_id, uuid, started_at, ended_at FROM connection_sessions
             WHERE user_id = $1 AND device_id = $2 AND ended_at IS NULL AND deleted_at IS NULL",
        )
        .bind(user_id)
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.any())
    }

    async fn end_connection_session(&self, session_id: PrimaryKey) -> Result<()> {
        sqlx::query(
            "UPDATE connection_sessions SET ended_at = now()
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.any())
        .map(|_| ())
    }

    async fn delete_connection_session(&self, session_id: PrimaryKey) -> Result<()> {
        sqlx::query(
            "UPDATE connection_sessions SET deleted_at = now()
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.any())
        .map(|_| ())
    }

    async fn system_token(&self, token: &str) -> Result<SystemTokenData> {
        sqlx::query_as::<_, SystemTokenData>(
            "SELECT id, token FROM system_tokens
             WHERE token = $1 AND deleted_at IS NULL",
        )
        .bind(token)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.not_found_or("system token", token))
    }

    async fn shape_by_id(&self, shape_id: PrimaryKey) -> Result<ShapeData> {
        sqlx::query_as::<_, ShapeData>(
            "SELECT id, name, number_of_users FROM shapes
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(shape_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.not_found_or("shape", &shape_id.to_string()))
    }

    async fn positions_by_shape(&self, shape_id: PrimaryKey) -> Result<Vec<PositionData>> {
        sqlx::query_as::<_, PositionData>(
            "SELECT id, shape_id, name, owner_position FROM shape_positions
             WHERE shape_id = $1 AND deleted_at IS NULL
             ORDER BY id",
        )
        .bind(shape_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.any())
    }

    async fn create_instance(
        &self,
        new_instance: NewInstance,
        members: Vec<NewMembership>,
    ) -> Result<InstanceData> {
        let mut tx = self.pool.begin().await.map_err(|e| e.any())?;

        let instance = sqlx::query_as::<_, InstanceData>(
            "INSERT INTO snap_instances (user_id, shape_id, hashed_key, timer_seconds)
             VALUES ($1, $2, $3, $4)
             RETURNING
                id, user_id, shape_id, hashed_key,
                timer_started, timer_seconds, timer_started_at, captured_image_key",
        )
        .bind(new_instance.user_id)
        .bind(new_instance.shape_id)
        .bind(new_instance.hashed_key)
        .bind(new_instance.timer_seconds)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| e.any())?;

        for member in members {
            sqlx::query(
                "INSERT INTO snap_instance_members
                    (instance_id, user_id, position_id, is_owner, is_joined, joined_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(instance.id)
            .bind(member.user_id)
            .bind(member.position_id)
            .bind(member.is_owner)
            .bind(member.is_joined)
            .bind(member.joined_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| e.any())?;
        }

        tx.commit().await.map_err(|e| e.any())?;

        Ok(instance)
    }

    async fn instance_by_id(&self, instance_id: PrimaryKey) -> Result<InstanceData> {
        sqlx::query_as::<_, InstanceData>(
            "SELECT
                id, user_id, shape_id, hashed_key,
                timer_started, timer_seconds, timer_started_at, captured_image_key
             FROM snap_instances
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.not_found_or("snap instance", &instance_id.to_string()))
    }

    async fn delete_instance(&self, instance_id: PrimaryKey) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| e.any())?;

        sqlx::query(
            "UPDATE snap_instance_members SET deleted_at = now()
             WHERE instance_id = $1 AND deleted_at IS NULL",
        )
        .bind(instance_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| e.any())?;

        sqlx::query(
            "UPDATE snap_instances SET deleted_at = now()
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(instance_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| e.any())?;

        tx.commit().await.map_err(|e| e.any())
    }

    async fn membership(
        &self,
        instance_id: PrimaryKey,
        user_id: PrimaryKey,
    ) -> Result<MembershipData> {
        sqlx::query_as::<_, MembershipData>(
            "SELECT
                id, instance_id, user_id, position_id,
                is_owner, is_joined, joined_at, image_key
             FROM snap_instance_members
             WHERE instance_id = $1 AND user_id = $2 AND deleted_at IS NULL",
        )
        .bind(instance_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.not_found_or("membership", &format!("{}:{}", instance_id, user_id)))
    }

    async fn memberships_by_instance(
        &self,
        instance_id: PrimaryKey,
    ) -> Result<Vec<MembershipData>> {
        sqlx::query_as::<_, MembershipData>(
            "SELECT
                id, instance_id, user_id, position_id,
                is_owner, is_joined, joined_at, image_key
             FROM snap_instance_members
             WHERE instance_id = $1 AND deleted_at IS NULL
             ORDER BY id",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.any())
    }

    async fn mark_member_joined(
        &self,
        instance_id: PrimaryKey,
        user_id: PrimaryKey,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE snap_instance_members SET is_joined = true, joined_at = $3
             WHERE instance_id = $1 AND user_id = $2 AND deleted_at IS NULL",
        )
        .bind(instance_id)
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| e.any())?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                resource: "membership",
                identifier: format!("{}:{}", instance_id, user_id),
            });
        }

        Ok(())
    }

    async fn joined_member_count(&self, instance_id: PrimaryKey) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM snap_instance_members
             WHERE instance_id = $1 AND is_joined = true AND deleted_at IS NULL",
        )
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.any())
    }

    async fn start_instance_timer(&self, instance_id: PrimaryKey, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE snap_instances SET timer_started = true, timer_started_at = $2
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(instance_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| e.any())?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                resource: "snap instance",
                identifier: instance_id.to_string(),
            });
        }

        Ok(())
    }
}

/// Friendships are stored once per pair, with the lower id first
fn friendship_hash(a: PrimaryKey, b: PrimaryKey) -> String {
    format!("{}_{}", a.min(b), a.max(b))
}

impl IntoDatabaseError for SqlxError {
    fn not_found_or(self, resource: &'static str, identifier: &str) -> DatabaseError {
        match self {
            SqlxError::RowNotFound => DatabaseError::NotFound {
                resource,
                identifier: identifier.to_string(),
            },
            e => e.any(),
        }
    }

    fn any(self) -> DatabaseError {
        DatabaseError::Internal(Box::new(self))
    }
}
