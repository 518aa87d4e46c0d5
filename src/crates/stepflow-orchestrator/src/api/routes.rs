//! Router assembly: `AppState` plus `Router::with_state`, grounded on the
//! teacher's `api/routes.rs` shape.

use super::handlers;
use crate::Runtime;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
}

pub fn create_router(runtime: Arc<Runtime>) -> Router {
    let state = AppState { runtime };

    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/runs", post(handlers::create_run).get(handlers::list_runs))
        .route("/runs/:run_id", get(handlers::get_state))
        .route("/runs/:run_id/pause", post(handlers::pause))
        .route("/runs/:run_id/resume", post(handlers::resume))
        .route("/runs/:run_id/cancel", post(handlers::cancel))
        .route("/runs/:run_id/inject_node", post(handlers::inject_node))
        .route("/runs/:run_id/interrupt", post(handlers::interrupt))
        .route("/runs/:run_id/events", get(handlers::subscribe_events))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::engine::ScriptedEngine;
    use crate::oracle::ScriptedOracle;

    #[test]
    fn router_builds_without_panicking() {
        let runtime = Arc::new(Runtime::new(
            RuntimeConfig::default(),
            Arc::new(ScriptedEngine::new()),
            Arc::new(ScriptedOracle::unavailable()),
        ));
        let _router = create_router(runtime);
    }
}
