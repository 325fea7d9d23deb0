use axum::http::HeaderValue;
use axum::{
    routing::{get, patch, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::state::AppState;

pub mod documents;
pub mod generations;
pub mod health;
pub mod sessions;
pub mod stickers;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = if let Some(origins) = state.config.cors_allowed_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .filter_map(|value| {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| {
                    trimmed
                        .parse::<HeaderValue>()
                        .expect("invalid CORS allowed origin")
                })
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    };

    let documents_routes = Router::new()
        .route("/", post(documents::register_document))
        .route("/:content_hash", get(documents::get_document))
        .route(
            "/:content_hash/references/:ref_id",
            axum::routing::put(documents::add_reference)
                .delete(documents::remove_reference),
        );

    let generations_routes = Router::new()
        .route("/", post(generations::request_generation))
        .route("/:id", get(generations::get_generation));

    let sessions_routes = Router::new()
        .route("/", post(sessions::start_session))
        .route(
            "/:id",
            get(sessions::poll_status).delete(sessions::cancel_session),
        )
        .route("/:id/window", patch(sessions::update_window))
        .route("/:id/state", patch(sessions::update_state));

    let stickers_routes = Router::new()
        .route("/:id", get(stickers::get_sticker))
        .route("/:id/refresh", post(stickers::refresh_sticker))
        .route("/:id/version", post(stickers::switch_version));

    let files_routes = Router::new().route("/:file_id/stickers", get(stickers::list_for_file));

    Router::new()
        .nest("/api/documents", documents_routes)
        .nest("/api/generations", generations_routes)
        .nest("/api/sessions", sessions_routes)
        .nest("/api/stickers", stickers_routes)
        .nest("/api/files", files_routes)
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
}
