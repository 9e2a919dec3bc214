mod auth;
mod client;
mod db;
mod instances;
mod media;
mod messages;
mod notify;
mod sessions;
mod util;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

pub use auth::*;
pub use client::*;
pub use db::*;
pub use instances::*;
pub use media::*;
pub use messages::*;
pub use notify::*;
pub use sessions::*;
pub use util::Id;

/// The shutter coordination system, facilitating login sessions, snap
/// instances, and the notifications around them.
pub struct Shutter<Db> {
    pub sessions: SessionRegistry<Db>,
    pub system: SystemRegistry<Db>,
    pub instances: InstanceManager<Db>,
}

/// A type passed to the components of the system, to access the database
/// and the shared services.
pub struct ShutterContext<Db> {
    pub database: Arc<Db>,
    pub auth: Arc<Auth<Db>>,
    pub notifier: Arc<dyn Notifier>,
    pub media: Arc<dyn UrlSigner>,
}

/// Everything [Shutter] needs to know at startup
pub struct ShutterConfig {
    /// Secret the account service signs bearer tokens with
    pub token_secret: String,
    /// 256 bit key system tokens are sealed with
    pub system_secret: Vec<u8>,
    /// Overrides the Expo push endpoint, mainly for local mocks
    pub push_url: Option<String>,
    pub media_base_url: String,
    pub media_secret: String,
    pub media_ttl_seconds: i64,
}

impl<Db> Shutter<Db>
where
    Db: Database,
{
    pub fn new(database: Db, config: ShutterConfig) -> Self {
        let database = Arc::new(database);

        let auth = Arc::new(Auth::new(
            &database,
            config.token_secret,
            config.system_secret,
        ));

        let notifier: Arc<dyn Notifier> =
            Arc::new(ExpoNotifier::new(&database, config.push_url));

        let media: Arc<dyn UrlSigner> = Arc::new(HmacUrlSigner::new(
            &config.media_base_url,
            &config.media_secret,
            config.media_ttl_seconds,
        ));

        let context = ShutterContext {
            database,
            auth,
            notifier,
            media,
        };

        Self {
            sessions: SessionRegistry::new(&context),
            system: SystemRegistry::new(&context),
            instances: InstanceManager::new(&context),
        }
    }
}

impl<Db> Clone for ShutterContext<Db>
where
    Db: Database,
{
    fn clone(&self) -> Self {
        Self {
            database: self.database.clone(),
            auth: self.auth.clone(),
            notifier: self.notifier.clone(),
            media: self.media.clone(),
        }
    }
}
