pub mod dispatch;
pub mod protocol;
pub mod queue;
pub mod queue_telemetry;
pub mod routes;
pub mod state;

pub use dispatch::{CommandOutcome, Dispatcher};
pub use protocol::ConnectionDriver;
pub use queue::{OutgoingQueue, MIN_QUEUE_CAPACITY};
pub use queue_telemetry::QueueTelemetry;
pub use state::AppState;

use anyhow::Result;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .nest("/api", routes::api_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr, "deepresearch-server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
