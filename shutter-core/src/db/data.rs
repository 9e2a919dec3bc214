use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// The type used for primary keys in the database
pub type PrimaryKey = i32;

/// An account on the platform. Accounts are managed by another service,
/// this system only ever reads them.
#[derive(Debug, Clone, FromRow)]
pub struct UserData {
    pub id: PrimaryKey,
    pub username: String,
    pub profile_image_key: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DeviceData {
    pub id: PrimaryKey,
    /// Stable identifier reported by the device itself
    pub uuid: String,
}

/// Proof that a user is allowed to connect from a device
#[derive(Debug, Clone, FromRow)]
pub struct UserDeviceData {
    pub id: PrimaryKey,
    pub user_id: PrimaryKey,
    pub device_id: PrimaryKey,
}

/// Durable record of one live connection
#[derive(Debug, Clone, FromRow)]
pub struct ConnectionSessionData {
    pub id: PrimaryKey,
    pub user_id: PrimaryKey,
    pub device_id: PrimaryKey,
    /// Opaque id handed back to the client at login
    pub uuid: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A token a trusted peer service authenticates with
#[derive(Debug, Clone, FromRow)]
pub struct SystemTokenData {
    pub id: PrimaryKey,
    pub token: String,
}

/// A capture template, deciding how many participants an instance has
/// and which named positions they can take.
#[derive(Debug, Clone, FromRow)]
pub struct ShapeData {
    pub id: PrimaryKey,
    pub name: String,
    pub number_of_users: i32,
}

#[derive(Debug, Clone, FromRow)]
pub struct PositionData {
    pub id: PrimaryKey,
    pub shape_id: PrimaryKey,
    pub name: String,
    /// The slot reserved for whoever creates the instance
    pub owner_position: bool,
}

/// A snap instance as stored. The in-memory registry tracks which of
/// these are live and who is attached to them.
#[derive(Debug, Clone, FromRow)]
pub struct InstanceData {
    pub id: PrimaryKey,
    /// The creator, who also owns the instance
    pub user_id: PrimaryKey,
    pub shape_id: PrimaryKey,
    /// Digest of the session key. The plaintext never reaches the database.
    pub hashed_key: String,
    pub timer_started: bool,
    pub timer_seconds: i32,
    pub timer_started_at: Option<DateTime<Utc>>,
    pub captured_image_key: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MembershipData {
    pub id: PrimaryKey,
    pub instance_id: PrimaryKey,
    pub user_id: PrimaryKey,
    pub position_id: PrimaryKey,
    pub is_owner: bool,
    pub is_joined: bool,
    pub joined_at: Option<DateTime<Utc>>,
    /// Set once the device uploads its part of the capture
    pub image_key: Option<String>,
}
