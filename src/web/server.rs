use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::api::{get_request, process_document, queue_document, root, AppState};

/// Build the document API router.
pub fn create_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/process_document", post(process_document))
        .route("/queue_document", post(queue_document))
        .route("/requests/:id", get(get_request))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the document API on `listen` until `shutdown` resolves.
pub async fn run_server<F>(
    state: AppState,
    listen: &str,
    max_upload_bytes: usize,
    shutdown: F,
) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state, max_upload_bytes);

    let listener = TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "Document API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Web server shutting down gracefully");
        })
        .await
}
