mod registry;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    util::random_string, ClientHandle, Database, DatabaseError, NewInstance, NewMembership,
    Notification, PrimaryKey, ShutterContext, UserData,
};

pub use registry::*;

/// Length of the plaintext key handed to the creator
const KEY_LENGTH: usize = 64;
/// How long the countdown runs once everyone joined
const DEFAULT_TIMER_SECONDS: i32 = 10;

/// Drives snap instances through their lifecycle: created, joined by
/// every invitee, then captured or dissolved.
pub struct InstanceManager<Db> {
    context: ShutterContext<Db>,
    registry: InstanceRegistry,
}

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("User is already in a snap instance")]
    AlreadyInInstance,
    #[error("Snap instance not found")]
    InstanceNotFound,
    #[error("Shape not found")]
    ShapeNotFound,
    #[error("Invited user {0} does not exist")]
    UserNotFound(PrimaryKey),
    #[error("The same user cannot be invited twice")]
    DuplicateInvitee,
    #[error("The owner cannot invite themselves")]
    SelfInvite,
    #[error("This shape requires exactly {expected} invited users")]
    WrongParticipantCount { expected: usize },
    #[error("Users can only sync with their friends")]
    NotFriends,
    #[error("Position {0} is not available for this shape")]
    PositionUnavailable(String),
    #[error("User is not invited to this snap instance")]
    NotInvited,
    #[error("User already joined this snap instance")]
    AlreadyJoined,
    #[error("User has not joined this snap instance")]
    NotJoined,
    #[error("User is not in a snap instance")]
    NotInInstance,
    #[error("Only the owner can delete a snap instance")]
    NotOwner,
    #[error("Could not create the snap instance")]
    CreateFailed(#[source] DatabaseError),
    #[error("Snap instance state is inconsistent: {0}")]
    Inconsistent(&'static str),
    #[error(transparent)]
    Registry(#[from] InstanceRegistryError),
    #[error(transparent)]
    Db(DatabaseError),
}

/// What a creator asks for: a shape, and a friend for each open position
#[derive(Debug)]
pub struct NewInstanceRequest {
    pub shape_id: PrimaryKey,
    pub invitees: Vec<InviteeSlot>,
}

#[derive(Debug)]
pub struct InviteeSlot {
    pub user_id: PrimaryKey,
    pub position: String,
}

pub struct CreatedInstance {
    /// The plaintext key. Only ever sent to participants.
    pub key: String,
    pub snapshot: InstanceSnapshot,
}

pub struct JoinOutcome {
    /// True when this join completed the quorum and started the timer
    pub timer_started: bool,
    pub snapshot: InstanceSnapshot,
}

/// Everything needed to notify connections after an instance went away
pub struct DissolvedInstance {
    pub key: String,
    pub reason: DissolveReason,
    /// The connections that were attached when the instance went away
    pub evicted: Vec<(PrimaryKey, ClientHandle)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DissolveReason {
    OwnerLeft,
    ParticipantLeft,
    OwnerDisconnected,
    ParticipantDisconnected,
    DeletedByOwner,
    CaptureFailed,
    Published,
}

impl DissolveReason {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::OwnerLeft => "Snap instance deleted because the owner left",
            Self::ParticipantLeft => "Snap instance deleted because a user left",
            Self::OwnerDisconnected => "Snap instance deleted because the owner disconnected",
            Self::ParticipantDisconnected => {
                "Snap instance deleted because a user disconnected"
            }
            Self::DeletedByOwner => "Snap instance deleted by the owner",
            Self::CaptureFailed => "Snap instance deleted because the capture failed",
            Self::Published => "Snap instance published",
        }
    }
}

/// Wire view of an instance, shaped for broadcast payloads
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub id: PrimaryKey,
    pub key: String,
    pub shape: SnapshotShape,
    pub users: Vec<SnapshotUser>,
    pub timer: SnapshotTimer,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotShape {
    pub id: PrimaryKey,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotUser {
    pub id: PrimaryKey,
    pub username: String,
    pub position: String,
    pub is_owner: bool,
    pub is_joined: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_picture_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTimer {
    pub started: bool,
    pub seconds: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl InstanceSnapshot {
    /// The headline one participant sees in an instance broadcast
    pub fn title_for(&self, viewer_id: PrimaryKey) -> String {
        if self.timer.started {
            let others: Vec<_> = self
                .users
                .iter()
                .filter(|u| u.id != viewer_id)
                .map(|u| u.username.as_str())
                .collect();

            format!("You and {} sync in {{{{timer}}}}", others.join(", "))
        } else {
            let waiting: Vec<_> = self
                .users
                .iter()
                .filter(|u| !u.is_joined)
                .map(|u| u.username.as_str())
                .collect();

            format!("Wait for {} to join...", waiting.join(", "))
        }
    }
}

impl<Db> InstanceManager<Db>
where
    Db: Database,
{
    pub fn new(context: &ShutterContext<Db>) -> Self {
        Self {
            context: context.clone(),
            registry: InstanceRegistry::default(),
        }
    }

    /// Creates an instance, pre-joins the creator as its owner, and
    /// invites a friend for every remaining position of the shape.
    pub async fn create(
        &self,
        creator: &UserData,
        request: NewInstanceRequest,
        handle: ClientHandle,
    ) -> Result<CreatedInstance, InstanceError> {
        if self.registry.instance_of(creator.id).is_some() {
            return Err(InstanceError::AlreadyInInstance);
        }

        let shape = self
            .context
            .database
            .shape_by_id(request.shape_id)
            .await
            .map_err(|e| match e {
                DatabaseError::NotFound { .. } => InstanceError::ShapeNotFound,
                e => InstanceError::Db(e),
            })?;

        let positions = self
            .context
            .database
            .positions_by_shape(shape.id)
            .await
            .map_err(InstanceError::Db)?;

        let owner_position = positions
            .iter()
            .find(|p| p.owner_position)
            .cloned()
            .ok_or(InstanceError::Inconsistent("shape has no owner position"))?;

        let mut open_positions: Vec<_> =
            positions.into_iter().filter(|p| !p.owner_position).collect();

        if shape.number_of_users as usize != open_positions.len() + 1 {
            return Err(InstanceError::Inconsistent(
                "shape positions do not match its size",
            ));
        }

        let mut seen = HashSet::new();
        for invitee in &request.invitees {
            if !seen.insert(invitee.user_id) {
                return Err(InstanceError::DuplicateInvitee);
            }

            if invitee.user_id == creator.id {
                return Err(InstanceError::SelfInvite);
            }
        }

        let expected = shape.number_of_users as usize - 1;
        if request.invitees.len() != expected {
            return Err(InstanceError::WrongParticipantCount { expected });
        }

        let mut memberships = vec![NewMembership {
            user_id: creator.id,
            position_id: owner_position.id,
            is_owner: true,
            is_joined: true,
            joined_at: Some(Utc::now()),
        }];

        for invitee in &request.invitees {
            self.context
                .database
                .user_by_id(invitee.user_id)
                .await
                .map_err(|e| match e {
                    DatabaseError::NotFound { .. } => InstanceError::UserNotFound(invitee.user_id),
                    e => InstanceError::Db(e),
                })?;

            let friends = self
                .context
                .database
                .are_friends(creator.id, invitee.user_id)
                .await
                .map_err(InstanceError::Db)?;

            if !friends {
                return Err(InstanceError::NotFriends);
            }

            let wanted = invitee.position.to_uppercase();
            let index = open_positions
                .iter()
                .position(|p| p.name.to_uppercase() == wanted)
                .ok_or_else(|| InstanceError::PositionUnavailable(invitee.position.clone()))?;

            // Taken out of the pool, so two invitees can't share a position
            let position = open_positions.swap_remove(index);

            memberships.push(NewMembership {
                user_id: invitee.user_id,
                position_id: position.id,
                is_owner: false,
                is_joined: false,
                joined_at: None,
            });
        }

        let key = random_string(KEY_LENGTH);
        let invited: Vec<_> = request.invitees.iter().map(|i| i.user_id).collect();

        let instance = self
            .context
            .database
            .create_instance(
                NewInstance {
                    user_id: creator.id,
                    shape_id: shape.id,
                    hashed_key: hash_key(&key),
                    timer_seconds: DEFAULT_TIMER_SECONDS,
                },
                memberships,
            )
            .await
            .map_err(InstanceError::CreateFailed)?;

        if let Err(e) = self.registry.register(&key, instance.clone()) {
            self.context
                .database
                .delete_instance(instance.id)
                .await
                .map_err(InstanceError::Db)?;

            return Err(InstanceError::Registry(e));
        }

        if let Err(e) = self.registry.attach(&key, creator.id, handle) {
            self.registry.remove(&key);
            self.context
                .database
                .delete_instance(instance.id)
                .await
                .map_err(InstanceError::Db)?;

            return Err(match e {
                InstanceRegistryError::AlreadyAttached => InstanceError::AlreadyInInstance,
                e => InstanceError::Registry(e),
            });
        }

        info!(
            "User {} created a {} instance {}",
            creator.username, shape.name, instance.id
        );

        self.notify(invited, Notification::sync_invite(&key, &creator.username));

        let snapshot = self.snapshot(&key, false).await?;

        Ok(CreatedInstance { key, snapshot })
    }

    /// Joins an invited user, starting the countdown if they were the
    /// last one missing.
    pub async fn join(
        &self,
        key: &str,
        user: &UserData,
        handle: ClientHandle,
    ) -> Result<JoinOutcome, InstanceError> {
        if self.registry.instance_of(user.id).is_some() {
            return Err(InstanceError::AlreadyInInstance);
        }

        let instance = self.registry.get(key).ok_or(InstanceError::InstanceNotFound)?;
        let _guard = instance.ops.lock().await;

        // The instance may have been torn down while waiting for the lock
        if !self.registry.contains(key) {
            return Err(InstanceError::InstanceNotFound);
        }

        let data = instance.data();

        let membership = self
            .context
            .database
            .membership(data.id, user.id)
            .await
            .map_err(|e| match e {
                DatabaseError::NotFound { .. } => InstanceError::NotInvited,
                e => InstanceError::Db(e),
            })?;

        if membership.is_joined {
            return Err(InstanceError::AlreadyJoined);
        }

        let shape = self
            .context
            .database
            .shape_by_id(data.shape_id)
            .await
            .map_err(InstanceError::Db)?;

        self.registry
            .attach(key, user.id, handle)
            .map_err(|e| match e {
                InstanceRegistryError::AlreadyAttached => InstanceError::AlreadyInInstance,
                e => InstanceError::Registry(e),
            })?;

        let now = Utc::now();

        if let Err(e) = self
            .context
            .database
            .mark_member_joined(data.id, user.id, now)
            .await
        {
            let _ = self.registry.detach(key, user.id);
            return Err(InstanceError::Db(e));
        }

        let joined = self
            .context
            .database
            .joined_member_count(data.id)
            .await
            .map_err(InstanceError::Db)?;

        let timer_started = joined == shape.number_of_users as i64;

        if timer_started {
            self.context
                .database
                .start_instance_timer(data.id, now)
                .await
                .map_err(InstanceError::Db)?;

            instance.mark_timer_started(now);

            info!("Instance {} reached quorum, the timer is running", data.id);
        } else {
            self.notify(
                vec![data.user_id],
                Notification::sync_accepted(key, &user.username),
            );
        }

        let snapshot = self.snapshot(key, false).await?;

        Ok(JoinOutcome {
            timer_started,
            snapshot,
        })
    }

    /// Takes a user out of their current instance. Any departure
    /// dissolves the whole instance for everyone.
    pub async fn leave(&self, user: &UserData) -> Result<DissolvedInstance, InstanceError> {
        let key = self
            .registry
            .instance_of(user.id)
            .ok_or(InstanceError::NotInInstance)?;

        let instance = self
            .registry
            .get(&key)
            .ok_or(InstanceError::InstanceNotFound)?;
        let _guard = instance.ops.lock().await;

        if !self.registry.contains(&key) {
            return Err(InstanceError::InstanceNotFound);
        }

        let data = instance.data();

        let membership = self
            .context
            .database
            .membership(data.id, user.id)
            .await
            .map_err(|e| match e {
                DatabaseError::NotFound { .. } => InstanceError::NotInInstance,
                e => InstanceError::Db(e),
            })?;

        if !membership.is_joined {
            return Err(InstanceError::NotJoined);
        }

        self.context
            .database
            .delete_instance(data.id)
            .await
            .map_err(InstanceError::Db)?;

        let evicted = self.registry.remove(&key).unwrap_or_default();

        info!("User {} left, instance {} dissolved", user.username, data.id);

        let reason = if data.user_id == user.id {
            DissolveReason::OwnerLeft
        } else {
            DissolveReason::ParticipantLeft
        };

        Ok(DissolvedInstance {
            key,
            reason,
            evicted,
        })
    }

    /// Deletes an instance on behalf of its owner
    pub async fn delete_by_owner(
        &self,
        key: &str,
        user: &UserData,
    ) -> Result<DissolvedInstance, InstanceError> {
        let instance = self.registry.get(key).ok_or(InstanceError::InstanceNotFound)?;
        let _guard = instance.ops.lock().await;

        if !self.registry.contains(key) {
            return Err(InstanceError::InstanceNotFound);
        }

        let data = instance.data();

        if data.user_id != user.id {
            return Err(InstanceError::NotOwner);
        }

        self.context
            .database
            .delete_instance(data.id)
            .await
            .map_err(InstanceError::Db)?;

        let evicted = self.registry.remove(key).unwrap_or_default();

        info!("Owner {} deleted instance {}", user.username, data.id);

        Ok(DissolvedInstance {
            key: key.to_string(),
            reason: DissolveReason::DeletedByOwner,
            evicted,
        })
    }

    /// Tears down the instance a user was in when their connection
    /// dropped. The disconnected user is left out of the eviction list,
    /// their connection can't receive it anyway.
    pub async fn handle_disconnect(
        &self,
        user: &UserData,
    ) -> Result<Option<DissolvedInstance>, InstanceError> {
        let Some(key) = self.registry.instance_of(user.id) else {
            return Ok(None);
        };

        let Some(instance) = self.registry.get(&key) else {
            return Ok(None);
        };

        let _guard = instance.ops.lock().await;

        if !self.registry.contains(&key) {
            return Ok(None);
        }

        let data = instance.data();

        self.context
            .database
            .delete_instance(data.id)
            .await
            .map_err(InstanceError::Db)?;

        let mut evicted = self.registry.remove(&key).unwrap_or_default();
        evicted.retain(|(user_id, _)| *user_id != user.id);

        let reason = if data.user_id == user.id {
            DissolveReason::OwnerDisconnected
        } else {
            DissolveReason::ParticipantDisconnected
        };

        info!(
            "Instance {} dissolved after {} disconnected",
            data.id, user.username
        );

        Ok(Some(DissolvedInstance {
            key,
            reason,
            evicted,
        }))
    }

    /// Tears down an instance on behalf of a trusted peer, after the
    /// capture failed or the result was published.
    pub async fn dissolve_by_system(
        &self,
        key: &str,
        reason: DissolveReason,
    ) -> Result<DissolvedInstance, InstanceError> {
        let instance = self.registry.get(key).ok_or(InstanceError::InstanceNotFound)?;
        let _guard = instance.ops.lock().await;

        if !self.registry.contains(key) {
            return Err(InstanceError::InstanceNotFound);
        }

        let data = instance.data();

        self.context
            .database
            .delete_instance(data.id)
            .await
            .map_err(InstanceError::Db)?;

        let evicted = self.registry.remove(key).unwrap_or_default();

        info!("Instance {} dissolved: {}", data.id, reason.describe());

        Ok(DissolvedInstance {
            key: key.to_string(),
            reason,
            evicted,
        })
    }

    /// Builds the wire view of a live instance, with capture images
    /// signed into fetchable urls when asked for.
    pub async fn snapshot(
        &self,
        key: &str,
        with_images: bool,
    ) -> Result<InstanceSnapshot, InstanceError> {
        let instance = self.registry.get(key).ok_or(InstanceError::InstanceNotFound)?;

        let data = self
            .context
            .database
            .instance_by_id(instance.data().id)
            .await
            .map_err(InstanceError::Db)?;

        let shape = self
            .context
            .database
            .shape_by_id(data.shape_id)
            .await
            .map_err(InstanceError::Db)?;

        let positions = self
            .context
            .database
            .positions_by_shape(shape.id)
            .await
            .map_err(InstanceError::Db)?;

        let memberships = self
            .context
            .database
            .memberships_by_instance(data.id)
            .await
            .map_err(InstanceError::Db)?;

        let mut users = Vec::with_capacity(memberships.len());

        for membership in memberships {
            let user = self
                .context
                .database
                .user_by_id(membership.user_id)
                .await
                .map_err(InstanceError::Db)?;

            let position = positions
                .iter()
                .find(|p| p.id == membership.position_id)
                .map(|p| p.name.clone())
                .ok_or(InstanceError::Inconsistent("membership has no position"))?;

            let image_url = if with_images {
                membership
                    .image_key
                    .as_deref()
                    .map(|key| self.context.media.signed_url(key))
            } else {
                None
            };

            users.push(SnapshotUser {
                id: user.id,
                username: user.username,
                position,
                is_owner: membership.is_owner,
                is_joined: membership.is_joined,
                profile_picture_url: user
                    .profile_image_key
                    .as_deref()
                    .map(|key| self.context.media.signed_url(key)),
                image_url,
            });
        }

        Ok(InstanceSnapshot {
            id: data.id,
            key: key.to_string(),
            shape: SnapshotShape {
                id: shape.id,
                name: shape.name,
            },
            users,
            timer: SnapshotTimer {
                started: data.timer_started,
                seconds: data.timer_seconds,
                started_at: data.timer_started_at,
            },
        })
    }

    /// Every connection attached to the instance with the given key
    pub fn participants(&self, key: &str) -> Vec<(PrimaryKey, ClientHandle)> {
        self.registry.participants(key)
    }

    /// Fire and forget, a failed push never fails the operation itself
    fn notify(&self, user_ids: Vec<PrimaryKey>, notification: Notification) {
        if user_ids.is_empty() {
            return;
        }

        let notifier = self.context.notifier.clone();

        tokio::spawn(async move {
            if let Err(err) = notifier.notify(&user_ids, notification).await {
                warn!("Failed to deliver push notification: {err}");
            }
        });
    }
}

/// One-way digest stored in place of the plaintext key
fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());

    hex::encode(hasher.finalize())
}
