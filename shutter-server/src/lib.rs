use std::net::{Ipv6Addr, SocketAddr};

use axum::{routing::get, Router};
use log::info;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

mod config;
mod context;
mod dispatch;
mod errors;
mod gateway;
mod logging;
mod protocol;

pub use config::*;
pub use context::*;
pub use gateway::Gateway;
pub use logging::*;

/// The default port the server will listen on.
pub const DEFAULT_PORT: u16 = 8999;

/// Starts the shutter server
pub async fn run_server(context: ServerContext, port: u16) {
    let addr: SocketAddr = (Ipv6Addr::UNSPECIFIED, port).into();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    context.gateway.run();

    let router = Router::new()
        .route("/gateway", get(gateway::upgrade))
        .route("/health", get(health))
        .layer(cors)
        .with_state(context);

    let listener = TcpListener::bind(&addr).await.expect("listens on address");

    info!("Listening on port {port}");

    axum::serve(listener, router.into_make_service())
        .await
        .expect("server runs until shutdown");
}

async fn health() -> &'static str {
    "ok"
}
