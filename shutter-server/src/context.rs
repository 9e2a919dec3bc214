use std::sync::Arc;

use axum::extract::FromRef;
use shutter_core::{PgDatabase, Shutter};

use crate::gateway::Gateway;

#[derive(Clone, FromRef)]
pub struct ServerContext {
    pub shutter: Arc<Shutter<PgDatabase>>,
    pub gateway: Arc<Gateway>,
}
