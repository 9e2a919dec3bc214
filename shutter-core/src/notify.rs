use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{Database, PrimaryKey};

/// Expo caps its send endpoint at 100 messages per request
const EXPO_CHUNK_SIZE: usize = 100;
const DEFAULT_EXPO_URL: &str = "https://exp.host/--/api/v2/push/send";

/// A push notification as the apps render it
#[derive(Debug, Clone)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Routing hint the apps use to open the right screen
    pub kind: &'static str,
    /// Key of the instance the notification is about
    pub key: String,
}

impl Notification {
    pub fn sync_invite(key: &str, username: &str) -> Self {
        Self {
            title: "Shutter".to_string(),
            body: format!("{username} wants to sync with you"),
            kind: "JOIN_SNAP_INSTANCE",
            key: key.to_string(),
        }
    }

    pub fn sync_accepted(key: &str, username: &str) -> Self {
        Self {
            title: "Shutter".to_string(),
            body: format!("{username} accepted your sync"),
            kind: "JOIN_SNAP_INSTANCE",
            key: key.to_string(),
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct NotifyError(pub String);

/// Delivers notifications to users over whatever transport is configured
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        user_ids: &[PrimaryKey],
        notification: Notification,
    ) -> Result<(), NotifyError>;
}

/// Sends pushes through the Expo push service
pub struct ExpoNotifier<Db> {
    db: Arc<Db>,
    http: reqwest::Client,
    url: String,
}

impl<Db> ExpoNotifier<Db>
where
    Db: Database,
{
    pub fn new(db: &Arc<Db>, url: Option<String>) -> Self {
        Self {
            db: db.clone(),
            http: reqwest::Client::new(),
            url: url.unwrap_or_else(|| DEFAULT_EXPO_URL.to_string()),
        }
    }
}

#[async_trait]
impl<Db> Notifier for ExpoNotifier<Db>
where
    Db: Database,
{
    async fn notify(
        &self,
        user_ids: &[PrimaryKey],
        notification: Notification,
    ) -> Result<(), NotifyError> {
        let tokens = self
            .db
            .push_tokens(user_ids)
            .await
            .map_err(|e| NotifyError(e.to_string()))?;

        if tokens.is_empty() {
            return Ok(());
        }

        for chunk in expo_messages(&tokens, &notification).chunks(EXPO_CHUNK_SIZE) {
            self.http
                .post(&self.url)
                .json(&chunk)
                .send()
                .await
                .map_err(|e| NotifyError(e.to_string()))?
                .error_for_status()
                .map_err(|e| NotifyError(e.to_string()))?;
        }

        Ok(())
    }
}

/// Discards everything. Used when no push transport is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(
        &self,
        _user_ids: &[PrimaryKey],
        _notification: Notification,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// One Expo message per device token
fn expo_messages(tokens: &[String], notification: &Notification) -> Vec<Value> {
    tokens
        .iter()
        .map(|token| {
            json!({
                "to": token,
                "sound": "default",
                "title": notification.title,
                "body": notification.body,
                "data": {
                    "type": notification.kind,
                    "key": notification.key,
                },
            })
        })
        .collect()
}
