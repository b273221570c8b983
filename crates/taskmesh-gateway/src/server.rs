use crate::control::ControlPlane;
use crate::middleware::{auth_middleware, AuthConfig};
use crate::routes::{self, AppState};
use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use taskmesh_core::protocol::HTTP_API_PREFIX;
use tracing::info;

/// Builds the control-surface router.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the router without authentication.
    pub fn build(plane: Arc<ControlPlane>) -> Router {
        Self::build_with_auth(plane, AuthConfig::default())
    }

    /// Build the router; when `auth` has keys, every route but `/health`
    /// requires one.
    pub fn build_with_auth(plane: Arc<ControlPlane>, auth: AuthConfig) -> Router {
        let protected = Router::<AppState>::new()
            .route("/status", get(routes::status))
            .route("/workers/stats", get(routes::worker_stats))
            .route("/registry/workers/register", post(routes::register_worker))
            .route("/registry/workers/unregister", post(routes::unregister_worker))
            .route("/registry/workers/heartbeat", post(routes::heartbeat))
            .route("/registry/workers", get(routes::list_workers))
            .route("/registry/workers/{worker_id}", get(routes::get_worker))
            .route("/registry/discover", post(routes::discover))
            .route("/registry/stats", get(routes::registry_stats))
            .route("/registry/config", get(routes::registry_config))
            .route("/service-discovery/find", get(routes::find_worker))
            .route("/service-discovery/find-all", post(routes::find_all))
            .route("/tasks/submit", post(routes::submit_task))
            .route("/tasks/submit/batch", post(routes::submit_batch))
            .route("/tasks/cancel", post(routes::cancel_task))
            .route("/tasks/result/{task_id}", get(routes::get_result))
            .route(
                "/tasks/results",
                get(routes::all_results).delete(routes::clear_results),
            )
            .route("/tasks/poll", post(routes::poll))
            .route("/tasks/progress", post(routes::progress))
            .route("/tasks/report", post(routes::report))
            .route("/queue/stats", get(routes::queue_stats))
            .route("/queue/tasks", get(routes::queue_tasks))
            .route("/execute", post(routes::execute));

        let protected = if auth.is_enabled() {
            info!(keys = auth.api_keys.len(), "API key authentication enabled");
            protected.layer(axum_mw::from_fn_with_state(Arc::new(auth), auth_middleware))
        } else {
            protected
        };

        let api = Router::new()
            .route("/health", get(routes::health))
            .merge(protected);

        Router::new().nest(HTTP_API_PREFIX, api).with_state(plane)
    }
}
