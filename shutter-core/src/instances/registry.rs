use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::{ClientHandle, InstanceData, PrimaryKey};

/// One live snap instance: the row it was created from, along with the
/// connections currently attached to it.
pub struct ActiveInstance {
    data: Mutex<InstanceData>,
    members: Mutex<HashMap<PrimaryKey, ClientHandle>>,
    /// Serializes join, leave and delete for this instance
    pub(crate) ops: AsyncMutex<()>,
}

impl ActiveInstance {
    fn new(data: InstanceData) -> Self {
        Self {
            data: Mutex::new(data),
            members: Mutex::new(HashMap::new()),
            ops: AsyncMutex::new(()),
        }
    }

    pub fn data(&self) -> InstanceData {
        self.data.lock().clone()
    }

    pub(crate) fn mark_timer_started(&self, at: DateTime<Utc>) {
        let mut data = self.data.lock();

        data.timer_started = true;
        data.timer_started_at = Some(at);
    }

    /// Every attached connection, along with the user it belongs to
    pub fn participants(&self) -> Vec<(PrimaryKey, ClientHandle)> {
        self.members
            .lock()
            .iter()
            .map(|(user_id, handle)| (*user_id, handle.clone()))
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum InstanceRegistryError {
    #[error("An instance with this key is already registered")]
    KeyTaken,
    #[error("Snap instance is not registered")]
    NotRegistered,
    #[error("User already has a connection attached to an instance")]
    AlreadyAttached,
    #[error("User has no connection attached to this instance")]
    NotAttached,
}

/// Every live instance in the process, keyed by the plaintext session key.
///
/// The user index enforces that a user is in at most one instance.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: DashMap<String, Arc<ActiveInstance>>,
    by_user: DashMap<PrimaryKey, String>,
}

impl InstanceRegistry {
    pub fn register(
        &self,
        key: &str,
        data: InstanceData,
    ) -> Result<Arc<ActiveInstance>, InstanceRegistryError> {
        match self.instances.entry(key.to_string()) {
            Entry::Occupied(_) => Err(InstanceRegistryError::KeyTaken),
            Entry::Vacant(slot) => {
                let instance = Arc::new(ActiveInstance::new(data));
                slot.insert(instance.clone());

                Ok(instance)
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<ActiveInstance>> {
        self.instances.get(key).map(|i| i.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.instances.contains_key(key)
    }

    /// The key of the instance a user is currently part of, if any
    pub fn instance_of(&self, user_id: PrimaryKey) -> Option<String> {
        self.by_user.get(&user_id).map(|key| key.clone())
    }

    pub fn attach(
        &self,
        key: &str,
        user_id: PrimaryKey,
        handle: ClientHandle,
    ) -> Result<(), InstanceRegistryError> {
        let instance = self.get(key).ok_or(InstanceRegistryError::NotRegistered)?;

        match self.by_user.entry(user_id) {
            Entry::Occupied(_) => return Err(InstanceRegistryError::AlreadyAttached),
            Entry::Vacant(slot) => {
                slot.insert(key.to_string());
            }
        }

        instance.members.lock().insert(user_id, handle);
        Ok(())
    }

    pub fn detach(&self, key: &str, user_id: PrimaryKey) -> Result<(), InstanceRegistryError> {
        let instance = self.get(key).ok_or(InstanceRegistryError::NotRegistered)?;

        if instance.members.lock().remove(&user_id).is_none() {
            return Err(InstanceRegistryError::NotAttached);
        }

        self.by_user.remove_if(&user_id, |_, value| value == key);
        Ok(())
    }

    pub fn participants(&self, key: &str) -> Vec<(PrimaryKey, ClientHandle)> {
        self.get(key)
            .map(|instance| instance.participants())
            .unwrap_or_default()
    }

    /// Removes an instance outright, detaching everyone attached to it.
    /// Removing a key that is not registered is a no-op, so teardown
    /// paths can race freely.
    pub fn remove(&self, key: &str) -> Option<Vec<(PrimaryKey, ClientHandle)>> {
        let (_, instance) = self.instances.remove(key)?;
        let members = instance.participants();

        for (user_id, _) in &members {
            self.by_user.remove_if(user_id, |_, value| value == key);
        }

        Some(members)
    }
}
