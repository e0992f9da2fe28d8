//! Liveness endpoints for hosting platforms that probe an HTTP port.
//! Shares no state with the bot.

use axum::{http::StatusCode, routing::get, Router};
use std::net::SocketAddr;
use tracing::info;

pub const LIVENESS_TEXT: &str = "Gemini relay bot is running";

async fn handle_root() -> &'static str {
    LIVENESS_TEXT
}

async fn handle_health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

pub fn router() -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
}

/// Serve the liveness routes on `0.0.0.0:port` until the task is dropped.
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Health: listening on http://{}", addr);
    axum::serve(listener, router()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_path(path: &str) -> (StatusCode, String) {
        let response = router()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn root_reports_liveness() {
        assert_eq!(get_path("/").await, (StatusCode::OK, LIVENESS_TEXT.to_string()));
    }

    #[tokio::test]
    async fn health_is_ok() {
        assert_eq!(get_path("/health").await, (StatusCode::OK, "OK".to_string()));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        assert_eq!(get_path("/nope").await.0, StatusCode::NOT_FOUND);
    }
}
