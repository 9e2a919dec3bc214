mod data;
mod pg;

#[cfg(test)]
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use data::*;
pub use pg::*;

#[cfg(test)]
pub use memory::*;

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
    #[error("{resource} with {field} of {value} already exists")]
    Conflict {
        resource: &'static str,
        field: &'static str,
        value: String,
    },
    #[error("{resource} identified by {identifier} not found")]
    NotFound {
        resource: &'static str,
        identifier: String,
    },
}

/// The durable side of the system.
///
/// Everything here is scoped to what the coordinator needs, the wider
/// platform manages these tables through its own services.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    async fn user_by_id(&self, user_id: PrimaryKey) -> Result<UserData>;
    async fn device_by_uuid(&self, uuid: &str) -> Result<DeviceData>;

    /// Returns the pairing proving a user may connect from a device
    async fn user_device(
        &self,
        user_id: PrimaryKey,
        device_id: PrimaryKey,
    ) -> Result<UserDeviceData>;

    /// Returns true if an accepted friendship exists between the two users
    async fn are_friends(&self, user_id: PrimaryKey, other_id: PrimaryKey) -> Result<bool>;

    /// Returns the push tokens registered by any of the given users
    async fn push_tokens(&self, user_ids: &[PrimaryKey]) -> Result<Vec<String>>;

    async fn create_connection_session(
        &self,
        new_session: NewConnectionSession,
    ) -> Result<ConnectionSessionData>;

    /// Returns the session with the given uuid, belonging to the user and device
    async fn connection_session(
        &self,
        user_id: PrimaryKey,
        device_id: PrimaryKey,
        uuid: &str,
    ) -> Result<ConnectionSessionData>;

    /// Returns every session of a user and device that was never closed out
    async fn open_connection_sessions(
        &self,
        user_id: PrimaryKey,
        device_id: PrimaryKey,
    ) -> Result<Vec<ConnectionSessionData>>;

    async fn end_connection_session(&self, session_id: PrimaryKey) -> Result<()>;
    async fn delete_connection_session(&self, session_id: PrimaryKey) -> Result<()>;

    async fn system_token(&self, token: &str) -> Result<SystemTokenData>;

    async fn shape_by_id(&self, shape_id: PrimaryKey) -> Result<ShapeData>;
    async fn positions_by_shape(&self, shape_id: PrimaryKey) -> Result<Vec<PositionData>>;

    /// Creates an instance along with all of its memberships, atomically
    async fn create_instance(
        &self,
        new_instance: NewInstance,
        members: Vec<NewMembership>,
    ) -> Result<InstanceData>;

    async fn instance_by_id(&self, instance_id: PrimaryKey) -> Result<InstanceData>;

    /// Deletes an instance and everything hanging off it, atomically
    async fn delete_instance(&self, instance_id: PrimaryKey) -> Result<()>;

    async fn membership(
        &self,
        instance_id: PrimaryKey,
        user_id: PrimaryKey,
    ) -> Result<MembershipData>;

    async fn memberships_by_instance(
        &self,
        instance_id: PrimaryKey,
    ) -> Result<Vec<MembershipData>>;

    async fn mark_member_joined(
        &self,
        instance_id: PrimaryKey,
        user_id: PrimaryKey,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn joined_member_count(&self, instance_id: PrimaryKey) -> Result<i64>;
    async fn start_instance_timer(&self, instance_id: PrimaryKey, at: DateTime<Utc>) -> Result<()>;
}

#[derive(Debug)]
pub struct NewConnectionSession {
    pub user_id: PrimaryKey,
    pub device_id: PrimaryKey,
    pub uuid: String,
}

#[derive(Debug)]
pub struct NewInstance {
    pub user_id: PrimaryKey,
    pub shape_id: PrimaryKey,
    pub hashed_key: String,
    pub timer_seconds: i32,
}

#[derive(Debug, Clone)]
pub struct NewMembership {
    pub user_id: PrimaryKey,
    pub position_id: PrimaryKey,
    pub is_owner: bool,
    pub is_joined: bool,
    pub joined_at: Option<DateTime<Utc>>,
}

/// Utility to make conversion of errors to [DatabaseError] easier
pub trait IntoDatabaseError {
    /// Returns NotFound if the error is caused by a missing row,
    /// otherwise wraps the error as internal
    fn not_found_or(self, resource: &'static str, identifier: &str) -> DatabaseError;

    /// Wraps the error as internal
    fn any(self) -> DatabaseError;
}
