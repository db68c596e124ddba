use axum::{routing::get, serve, Json, Router};
use axum_macros::debug_handler;
use reqwest::StatusCode;
use serde_derive::Serialize;
use tokio::net::TcpListener;
use tracing::info;

/// Serve the liveness route until the process is terminated. Health checks
/// are the only http surface; all real work happens in the polling tasks.
pub(crate) async fn start_http_server(port: u16) -> Result<(), std::io::Error> {
    let router = Router::new().route("/health", get(get_health));

    let port = std::env::var("PORT").unwrap_or(port.to_string());
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("now listening on port {}", port);

    serve(listener, router).await
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
}

#[debug_handler]
async fn get_health() -> (StatusCode, Json<Health>) {
    (StatusCode::OK, Json(Health { status: "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn the_health_route_reports_ok() {
        let (status, Json(body)) = get_health().await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "ok");
    }
}
