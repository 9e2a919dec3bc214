use std::sync::Arc;

use colored::Colorize;
use log::{error, info};
use shutter_core::{DatabaseError, PgDatabase, Shutter};
use shutter_server::{init_logger, run_server, Config, ConfigError, Gateway, ServerContext};
use thiserror::Error;

#[derive(Debug, Error)]
enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Could not initialize database: {0}")]
    Database(#[from] DatabaseError),
}

impl StartError {
    fn hint(&self) -> String {
        match self {
            StartError::Config(_) => {
                "Check the SHUTTER_* environment variables and try again.".to_string()
            }
            StartError::Database(_) => {
                "This is a database error. Make sure the Postgres instance is reachable and migrations can run, then try again.".to_string()
            }
        }
    }
}

#[tokio::main]
async fn main() {
    init_logger();

    if let Err(error) = start().await {
        error!(
            "{} Read the error below to troubleshoot the issue.",
            "Shutter failed to start!".bold().red()
        );
        error!("{error}");
        error!("{}", format!("Hint: {}", error.hint()).dimmed().italic());
    }
}

async fn start() -> Result<(), StartError> {
    let config = Config::from_env()?;

    info!("Connecting to database...");
    let database = PgDatabase::new(&config.database_url).await?;

    let shutter = Shutter::new(database, config.shutter());

    let context = ServerContext {
        shutter: Arc::new(shutter),
        gateway: Gateway::new(),
    };

    info!("Initialized successfully.");

    run_server(context, config.port).await;

    Ok(())
}
