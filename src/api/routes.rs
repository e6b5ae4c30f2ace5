use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.max_upload_size as usize;

    let mut router = Router::new()
        // Attachments
        .route("/attachments", get(handlers::list_attachments))
        .route(
            "/attachments",
            post(handlers::create_attachment).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/attachments/:id", delete(handlers::delete_attachment))
        .route("/attachments/:id", get(handlers::get_attachment))
        // Content (range-aware download)
        .route(
            "/attachments/:id/versions/:version/content",
            get(handlers::serve_content),
        )
        // Administrative RPCs; authorization happens upstream of this
        // service.
        .route("/attachments/:id/storage", put(handlers::move_attachment))
        .route("/attachments/:id/name", put(handlers::rename_attachment))
        .route(
            "/attachments/:id/revalidate",
            post(handlers::revalidate_attachment),
        )
        // Internal
        .route("/_internal/health", get(handlers::health));

    // Test-only routes
    if state.config.test_mode {
        tracing::warn!("Test mode enabled — purge route is available.");
        router = router.route("/admin/purge", delete(handlers::admin_purge));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
