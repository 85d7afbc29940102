pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use triage_core::scheduler::Scheduler;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(scheduler: Arc<Scheduler>) -> Router {
    let app_state = state::AppState::new(scheduler);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(routes::health::healthz))
        // Collections
        .route(
            "/api/collections",
            get(routes::collections::list_collections),
        )
        .route(
            "/api/collections/{id}",
            get(routes::collections::get_collection),
        )
        .route(
            "/api/collections/{id}/refresh",
            post(routes::collections::refresh_collection),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Start the background update loop and the JSON API on
/// `127.0.0.1:<port>`. Both stop when `cancel` fires.
pub async fn serve(
    scheduler: Arc<Scheduler>,
    port: u16,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    serve_on(scheduler, listener, cancel).await
}

/// Like [`serve`], on a pre-bound listener (useful with port 0).
pub async fn serve_on(
    scheduler: Arc<Scheduler>,
    listener: tokio::net::TcpListener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let app = build_router(Arc::clone(&scheduler));

    let updater = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    tracing::info!(
        name = scheduler.triage().name(),
        "triage server listening on http://{addr}"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await?;

    cancel.cancel();
    if let Err(e) = updater.await {
        tracing::error!(error = %e, "update loop panicked");
    }
    Ok(())
}
