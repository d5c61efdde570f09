use anyhow::{Context as _, Result};
use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use tokio::sync::oneshot;

use crate::probe;

/// Fixed local port of the diagnostics page.
pub(crate) const ADMIN_PORT: u16 = 3486;

/// Serves the admin page until `stop` fires. Failures here are purely
/// informational and never take the gateway down.
pub(crate) async fn serve(stop: oneshot::Receiver<()>) -> Result<()> {
    let app = router();

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", ADMIN_PORT))
        .await
        .with_context(|| format!("Failed to bind admin port {ADMIN_PORT}"))?;

    tracing::info!(port = ADMIN_PORT, "Admin page available");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = stop.await;
        })
        .await
        .context("Admin server failed")?;

    Ok(())
}

fn router() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/icons/{name}", get(icon))
        .route("/api/speed", get(speed))
}

async fn index() -> Html<&'static str> {
    Html(include_str!("admin/index.html"))
}

async fn speed() -> Json<probe::Report> {
    Json(probe::run().await)
}

async fn icon(Path(name): Path<String>) -> Response {
    let body = match name.as_str() {
        "google.svg" => include_str!("admin/icons/google.svg"),
        "youtube.svg" => include_str!("admin/icons/youtube.svg"),
        "github.svg" => include_str!("admin/icons/github.svg"),
        "baidu.svg" => include_str!("admin/icons/baidu.svg"),
        _ => return StatusCode::NOT_FOUND.into_response(),
    };

    ([(header::CONTENT_TYPE, "image/svg+xml")], body).into_response()
}
