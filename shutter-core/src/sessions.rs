use std::collections::HashMap;

use dashmap::{mapref::entry::Entry, DashMap};
use log::info;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    AuthError, ClientHandle, ClientId, Database, DatabaseError, DeviceData, NewConnectionSession,
    PrimaryKey, ShutterContext, UserData,
};

/// One logical seat: a user connecting from a specific device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: PrimaryKey,
    pub device_uuid: String,
}

/// The identity a connection logged in as.
#[derive(Debug, Clone)]
pub struct SessionBinding {
    pub user: UserData,
    pub device: DeviceData,
    pub session_id: String,
}

/// One entry of the snapshot handed out to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedClient {
    pub user_id: PrimaryKey,
    pub device_uuid: String,
    pub session_id: String,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Auth(AuthError),
    #[error("Device not found")]
    DeviceNotFound,
    #[error("Device is not paired with this user")]
    PairingNotFound,
    #[error("User is already connected on this device")]
    AlreadyConnected,
    #[error(transparent)]
    Db(DatabaseError),
}

struct SessionEntry {
    user: UserData,
    device: DeviceData,
    session_id: String,
}

/// Tracks which user and device every logged-in connection belongs to,
/// mirroring each one into a durable session row.
///
/// At most one live connection exists per seat.
pub struct SessionRegistry<Db> {
    context: ShutterContext<Db>,
    entries: DashMap<SessionKey, SessionEntry>,
    by_client: DashMap<ClientId, SessionKey>,
}

impl<Db> SessionRegistry<Db>
where
    Db: Database,
{
    pub fn new(context: &ShutterContext<Db>) -> Self {
        Self {
            context: context.clone(),
            entries: DashMap::new(),
            by_client: DashMap::new(),
        }
    }

    /// Logs a connection in, binding it to the resolved user and device.
    ///
    /// A connection that cannot present a prior session id is treated as a
    /// fresh start, and any session rows left open for the seat are
    /// closed out first. Those rows can only exist if the process died
    /// without running teardown.
    pub async fn login(
        &self,
        credential: &str,
        device_uuid: &str,
        prior_session_id: Option<&str>,
        handle: ClientHandle,
    ) -> Result<SessionBinding, SessionError> {
        let user = self
            .context
            .auth
            .resolve_credential(credential)
            .await
            .map_err(SessionError::Auth)?;

        let device = self
            .context
            .database
            .device_by_uuid(device_uuid)
            .await
            .map_err(|e| match e {
                DatabaseError::NotFound { .. } => SessionError::DeviceNotFound,
                e => SessionError::Db(e),
            })?;

        self.context
            .database
            .user_device(user.id, device.id)
            .await
            .map_err(|e| match e {
                DatabaseError::NotFound { .. } => SessionError::PairingNotFound,
                e => SessionError::Db(e),
            })?;

        let key = SessionKey {
            user_id: user.id,
            device_uuid: device.uuid.clone(),
        };

        if self.entries.contains_key(&key) {
            return Err(SessionError::AlreadyConnected);
        }

        if prior_session_id.is_none() {
            self.recover_seat(&user, &device).await?;
        }

        let session = self
            .context
            .database
            .create_connection_session(NewConnectionSession {
                user_id: user.id,
                device_id: device.id,
                uuid: Uuid::new_v4().to_string(),
            })
            .await
            .map_err(SessionError::Db)?;

        let inserted = match self.entries.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(SessionEntry {
                    user: user.clone(),
                    device: device.clone(),
                    session_id: session.uuid.clone(),
                });
                true
            }
        };

        if !inserted {
            // Lost the seat to a concurrent login, take the row back out.
            self.close_row(session.id).await?;
            return Err(SessionError::AlreadyConnected);
        }

        self.by_client.insert(handle.id(), key);

        info!("User {} logged in from device {}", user.username, device.uuid);

        Ok(SessionBinding {
            user,
            device,
            session_id: session.uuid,
        })
    }

    /// Unbinds a connection and closes out its durable row. Connections
    /// that never logged in are a no-op.
    pub async fn logout(&self, client_id: ClientId) -> Result<Option<SessionBinding>, SessionError> {
        let Some((_, key)) = self.by_client.remove(&client_id) else {
            return Ok(None);
        };

        let Some((_, entry)) = self.entries.remove(&key) else {
            return Ok(None);
        };

        let row = self
            .context
            .database
            .connection_session(entry.user.id, entry.device.id, &entry.session_id)
            .await;

        match row {
            Ok(row) => self.close_row(row.id).await?,
            // The row may already be gone if another login swept the seat
            Err(DatabaseError::NotFound { .. }) => {}
            Err(e) => return Err(SessionError::Db(e)),
        }

        info!(
            "User {} logged out from device {}",
            entry.user.username, entry.device.uuid
        );

        Ok(Some(SessionBinding {
            user: entry.user,
            device: entry.device,
            session_id: entry.session_id,
        }))
    }

    /// Authorization gate for user actions. Any failure to resolve is `false`.
    pub async fn is_logged(&self, credential: &str, device_uuid: &str) -> bool {
        let Ok(user) = self.context.auth.resolve_credential(credential).await else {
            return false;
        };

        self.entries.contains_key(&SessionKey {
            user_id: user.id,
            device_uuid: device_uuid.to_string(),
        })
    }

    /// The identity a connection is bound to, if it logged in
    pub fn binding(&self, client_id: ClientId) -> Option<SessionBinding> {
        let key = self.by_client.get(&client_id)?;
        let entry = self.entries.get(&key)?;

        Some(SessionBinding {
            user: entry.user.clone(),
            device: entry.device.clone(),
            session_id: entry.session_id.clone(),
        })
    }

    /// Snapshot of every logged-in seat, keyed by `{userId}_{deviceUuid}`
    pub fn connected(&self) -> HashMap<String, ConnectedClient> {
        self.entries
            .iter()
            .map(|entry| {
                let key = entry.key();

                (
                    format!("{}_{}", key.user_id, key.device_uuid),
                    ConnectedClient {
                        user_id: key.user_id,
                        device_uuid: key.device_uuid.clone(),
                        session_id: entry.session_id.clone(),
                    },
                )
            })
            .collect()
    }

    /// Closes out rows left open by a crash, so the seat starts clean
    async fn recover_seat(&self, user: &UserData, device: &DeviceData) -> Result<(), SessionError> {
        let orphaned = self
            .context
            .database
            .open_connection_sessions(user.id, device.id)
            .await
            .map_err(SessionError::Db)?;

        for row in orphaned {
            info!(
                "Closing orphaned session {} of user {} after a restart",
                row.uuid, user.username
            );

            self.close_row(row.id).await?;
        }

        Ok(())
    }

    async fn close_row(&self, session_id: PrimaryKey) -> Result<(), SessionError> {
        self.context
            .database
            .end_connection_session(session_id)
            .await
            .map_err(SessionError::Db)?;

        self.context
            .database
            .delete_connection_session(session_id)
            .await
            .map_err(SessionError::Db)
    }
}

/// Tracks trusted peer services, like the capture pipeline, that log in
/// with an encrypted system token instead of a user credential.
pub struct SystemRegistry<Db> {
    context: ShutterContext<Db>,
    peers: DashMap<String, ClientHandle>,
    by_client: DashMap<ClientId, String>,
}

impl<Db> SystemRegistry<Db>
where
    Db: Database,
{
    pub fn new(context: &ShutterContext<Db>) -> Self {
        Self {
            context: context.clone(),
            peers: DashMap::new(),
            by_client: DashMap::new(),
        }
    }

    /// Logs a peer in. Peers reconnect after silent drops, so a repeat
    /// login with an already bound token succeeds without rebinding.
    pub async fn login_system(
        &self,
        credential: &str,
        handle: ClientHandle,
    ) -> Result<(), SessionError> {
        let token = self
            .context
            .auth
            .resolve_system_credential(credential)
            .await
            .map_err(SessionError::Auth)?;

        if self.peers.contains_key(&token) {
            return Ok(());
        }

        info!("System peer logged in");

        self.by_client.insert(handle.id(), token.clone());
        self.peers.insert(token, handle);

        Ok(())
    }

    /// Authorization gate for system actions. Only checks against peers
    /// that are currently bound, without touching the database.
    pub fn is_logged_system(&self, credential: &str) -> bool {
        let Ok(token) = self.context.auth.decrypt_system_token(credential) else {
            return false;
        };

        self.peers.contains_key(&token)
    }

    /// Unbinds whatever token the connection logged in with
    pub fn unbind(&self, client_id: ClientId) -> bool {
        let Some((_, token)) = self.by_client.remove(&client_id) else {
            return false;
        };

        self.peers.remove(&token);
        info!("System peer logged out");

        true
    }
}
