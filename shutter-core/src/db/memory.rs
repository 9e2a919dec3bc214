use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    ConnectionSessionData, Database, DatabaseError, DeviceData, InstanceData, MembershipData,
    NewConnectionSession, NewInstance, NewMembership, PositionData, PrimaryKey, Result, ShapeData,
    SystemTokenData, UserData, UserDeviceData,
};

/// An in-memory [Database], so registries and services can be
/// exercised without a running PostgreSQL instance.
#[derive(Default)]
pub struct MemoryDatabase {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_id: PrimaryKey,
    users: Vec<UserData>,
    devices: Vec<DeviceData>,
    pairings: Vec<UserDeviceData>,
    friendships: HashSet<(PrimaryKey, PrimaryKey)>,
    sessions: Vec<ConnectionSessionData>,
    system_tokens: Vec<SystemTokenData>,
    shapes: Vec<ShapeData>,
    positions: Vec<PositionData>,
    instances: Vec<InstanceData>,
    members: Vec<MembershipData>,
    push_tokens: Vec<(PrimaryKey, String)>,
    ended_log: Vec<PrimaryKey>,
    removed_log: Vec<PrimaryKey>,
}

impl State {
    fn next(&mut self) -> PrimaryKey {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryDatabase {
    pub fn add_user(&self, username: &str) -> UserData {
        let mut state = self.state.lock();
        let user = UserData {
            id: state.next(),
            username: username.to_string(),
            profile_image_key: None,
        };

        state.users.push(user.clone());
        user
    }

    pub fn add_device(&self, uuid: &str) -> DeviceData {
        let mut state = self.state.lock();
        let device = DeviceData {
            id: state.next(),
            uuid: uuid.to_string(),
        };

        state.devices.push(device.clone());
        device
    }

    pub fn pair(&self, user_id: PrimaryKey, device_id: PrimaryKey) {
        let mut state = self.state.lock();
        let id = state.next();

        state.pairings.push(UserDeviceData {
            id,
            user_id,
            device_id,
        });
    }

    pub fn befriend(&self, user_id: PrimaryKey, other_id: PrimaryKey) {
        let mut state = self.state.lock();

        state
            .friendships
            .insert((user_id.min(other_id), user_id.max(other_id)));
    }

    pub fn add_system_token(&self, token: &str) {
        let mut state = self.state.lock();
        let id = state.next();

        state.system_tokens.push(SystemTokenData {
            id,
            token: token.to_string(),
        });
    }

    /// Adds a shape along with its positions. The first position is the owner's.
    pub fn add_shape(&self, name: &str, positions: &[&str]) -> ShapeData {
        let mut state = self.state.lock();
        let shape = ShapeData {
            id: state.next(),
            name: name.to_string(),
            number_of_users: positions.len() as i32,
        };

        state.shapes.push(shape.clone());

        for (index, position) in positions.iter().enumerate() {
            let id = state.next();
            let shape_id = shape.id;

            state.positions.push(PositionData {
                id,
                shape_id,
                name: position.to_string(),
                owner_position: index == 0,
            });
        }

        shape
    }

    /// Seeds a session row that was never closed, as if the process crashed
    /// while the connection was up.
    pub fn add_orphan_session(
        &self,
        user_id: PrimaryKey,
        device_id: PrimaryKey,
        uuid: &str,
    ) -> ConnectionSessionData {
        let mut state = self.state.lock();
        let session = ConnectionSessionData {
            id: state.next(),
            user_id,
            device_id,
            uuid: uuid.to_string(),
            started_at: Utc::now(),
            ended_at: None,
        };

        state.sessions.push(session.clone());
        session
    }

    pub fn set_member_image(&self, instance_id: PrimaryKey, user_id: PrimaryKey, key: &str) {
        let mut state = self.state.lock();

        if let Some(member) = state
            .members
            .iter_mut()
            .find(|m| m.instance_id == instance_id && m.user_id == user_id)
        {
            member.image_key = Some(key.to_string());
        }
    }

    pub fn set_profile_image(&self, user_id: PrimaryKey, key: &str) {
        let mut state = self.state.lock();

        if let Some(user) = state.users.iter_mut().find(|u| u.id == user_id) {
            user.profile_image_key = Some(key.to_string());
        }
    }

    pub fn session_rows(&self) -> Vec<ConnectionSessionData> {
        self.state.lock().sessions.clone()
    }

    /// Ids of sessions that were closed out, in order
    pub fn ended_sessions(&self) -> Vec<PrimaryKey> {
        self.state.lock().ended_log.clone()
    }

    /// Ids of sessions that were removed, in order
    pub fn removed_sessions(&self) -> Vec<PrimaryKey> {
        self.state.lock().removed_log.clone()
    }

    pub fn instance_rows(&self) -> Vec<InstanceData> {
        self.state.lock().instances.clone()
    }

    pub fn membership_rows(&self) -> Vec<MembershipData> {
        self.state.lock().members.clone()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn user_by_id(&self, user_id: PrimaryKey) -> Result<UserData> {
        self.state
            .lock()
            .users
            .iter()
            .find(|u| u.id == user_id)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "user",
                identifier: user_id.to_string(),
            })
    }

    async fn device_by_uuid(&self, uuid: &str) -> Result<DeviceData> {
        self.state
            .lock()
            .devices
            .iter()
            .find(|d| d.uuid == uuid)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "device",
                identifier: uuid.to_string(),
            })
    }

    async fn user_device(
        &self,
        user_id: PrimaryKey,
        device_id: PrimaryKey,
    ) -> Result<UserDeviceData> {
        self.state
            .lock()
            .pairings
            .iter()
            .find(|p| p.user_id == user_id && p.device_id == device_id)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "pairing",
                identifier: format!("{}:{}", user_id, device_id),
            })
    }

    async fn are_friends(&self, user_id: PrimaryKey, other_id: PrimaryKey) -> Result<bool> {
        let pair = (user_id.min(other_id), user_id.max(other_id));

        Ok(self.state.lock().friendships.contains(&pair))
    }

    async fn push_tokens(&self, user_ids: &[PrimaryKey]) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .push_tokens
            .iter()
            .filter(|(user_id, _)| user_ids.contains(user_id))
            .map(|(_, token)| token.clone())
            .collect())
    }

    async fn create_connection_session(
        &self,
        new_session: NewConnectionSession,
    ) -> Result<ConnectionSessionData> {
        let mut state = self.state.lock();
        let session = ConnectionSessionData {
            id: state.next(),
            user_id: new_session.user_id,
            device_id: new_session.device_id,
            uuid: new_session.uuid,
            started_at: Utc::now(),
            ended_at: None,
        };

        state.sessions.push(session.clone());
        Ok(session)
    }

    async fn connection_session(
        &self,
        user_id: PrimaryKey,
        device_id: PrimaryKey,
        uuid: &str,
    ) -> Result<ConnectionSessionData> {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|s| s.user_id == user_id && s.device_id == device_id && s.uuid == uuid)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "session",
                identifier: uuid.to_string(),
            })
    }

    async fn open_connection_sessions(
        &self,
        user_id: PrimaryKey,
        device_id: PrimaryKey,
    ) -> Result<Vec<ConnectionSessionData>> {
        Ok(self
            .state
            .lock()
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.device_id == device_id && s.ended_at.is_none())
            .cloned()
            .collect())
    }

    async fn end_connection_session(&self, session_id: PrimaryKey) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(session) = state.sessions.iter_mut().find(|s| s.id == session_id) {
            session.ended_at = Some(Utc::now());
            state.ended_log.push(session_id);
        }

        Ok(())
    }

    async fn delete_connection_session(&self, session_id: PrimaryKey) -> Result<()> {
        let mut state = self.state.lock();

        state.sessions.retain(|s| s.id != session_id);
        state.removed_log.push(session_id);

        Ok(())
    }

    async fn system_token(&self, token: &str) -> Result<SystemTokenData> {
        self.state
            .lock()
            .system_tokens
            .iter()
            .find(|t| t.token == token)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "system token",
                identifier: token.to_string(),
            })
    }

    async fn shape_by_id(&self, shape_id: PrimaryKey) -> Result<ShapeData> {
        self.state
            .lock()
            .shapes
            .iter()
            .find(|s| s.id == shape_id)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "shape",
                identifier: shape_id.to_string(),
            })
    }

    async fn positions_by_shape(&self, shape_id: PrimaryKey) -> Result<Vec<PositionData>> {
        Ok(self
            .state
            .lock()
            .positions
            .iter()
            .filter(|p| p.shape_id == shape_id)
            .cloned()
            .collect())
    }

    async fn create_instance(
        &self,
        new_instance: NewInstance,
        members: Vec<NewMembership>,
    ) -> Result<InstanceData> {
        let mut state = self.state.lock();
        let instance = InstanceData {
            id: state.next(),
            user_id: new_instance.user_id,
            shape_id: new_instance.shape_id,
            hashed_key: new_instance.hashed_key,
            timer_started: false,
            timer_seconds: new_instance.timer_seconds,
            timer_started_at: None,
            captured_image_key: None,
        };

        state.instances.push(instance.clone());

        for member in members {
            let id = state.next();
            let instance_id = instance.id;

            state.members.push(MembershipData {
                id,
                instance_id,
                user_id: member.user_id,
                position_id: member.position_id,
                is_owner: member.is_owner,
                is_joined: member.is_joined,
                joined_at: member.joined_at,
                image_key: None,
            });
        }

        Ok(instance)
    }

    async fn instance_by_id(&self, instance_id: PrimaryKey) -> Result<InstanceData> {
        self.state
            .lock()
            .instances
            .iter()
            .find(|i| i.id == instance_id)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "snap instance",
                identifier: instance_id.to_string(),
            })
    }

    async fn delete_instance(&self, instance_id: PrimaryKey) -> Result<()> {
        let mut state = self.state.lock();

        state.members.retain(|m| m.instance_id != instance_id);
        state.instances.retain(|i| i.id != instance_id);

        Ok(())
    }

    async fn membership(
        &self,
        instance_id: PrimaryKey,
        user_id: PrimaryKey,
    ) -> Result<MembershipData> {
        self.state
            .lock()
            .members
            .iter()
            .find(|m| m.instance_id == instance_id && m.user_id == user_id)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "membership",
                identifier: format!("{}:{}", instance_id, user_id),
            })
    }

    async fn memberships_by_instance(
        &self,
        instance_id: PrimaryKey,
    ) -> Result<Vec<MembershipData>> {
        Ok(self
            .state
            .lock()
            .members
            .iter()
            .filter(|m| m.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn mark_member_joined(
        &self,
        instance_id: PrimaryKey,
        user_id: PrimaryKey,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock();

        let member = state
            .members
            .iter_mut()
            .find(|m| m.instance_id == instance_id && m.user_id == user_id)
            .ok_or(DatabaseError::NotFound {
                resource: "membership",
                identifier: format!("{}:{}", instance_id, user_id),
            })?;

        member.is_joined = true;
        member.joined_at = Some(at);

        Ok(())
    }

    async fn joined_member_count(&self, instance_id: PrimaryKey) -> Result<i64> {
        Ok(self
            .state
            .lock()
            .members
            .iter()
            .filter(|m| m.instance_id == instance_id && m.is_joined)
            .count() as i64)
    }

    async fn start_instance_timer(&self, instance_id: PrimaryKey, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock();

        let instance = state
            .instances
            .iter_mut()
            .find(|i| i.id == instance_id)
            .ok_or(DatabaseError::NotFound {
                resource: "snap instance",
                identifier: instance_id.to_string(),
            })?;

        instance.timer_started = true;
        instance.timer_started_at = Some(at);

        Ok(())
    }
}
