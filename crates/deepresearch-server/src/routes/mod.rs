pub mod ws;

use axum::Router;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new().nest("/session", ws::router())
}
