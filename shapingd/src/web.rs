use crate::api::shaping::{self, ShapingApiState};
use crate::command::Options;
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use log::info;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        "{} {} -> {} ({} ms)",
        method,
        uri,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

/// Serve the HTTP API until `shutdown_notify` fires.
pub async fn start_server(
    options: Options,
    state: ShapingApiState,
    shutdown_notify: Arc<tokio::sync::Notify>,
) -> Result<(), anyhow::Error> {
    let mut app = shaping::router(state);
    if options.web_log() {
        app = app.layer(middleware::from_fn(log_request));
    }

    let addr = format!("0.0.0.0:{}", options.port());
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_notify.notified().await;
            info!("Web server received shutdown signal, stopping...");
        })
        .await?;

    Ok(())
}
