//! Local HTTP status endpoint.
//!
//! A single-purpose server bound on all interfaces: `GET /` (and `HEAD /`)
//! returns the typed view of the latest sample as JSON. There is no
//! authentication; this is a local debugging surface. The server runs on its
//! own task and never blocks the sampling loop.

use std::net::SocketAddr;

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::store::Snapshot;

async fn stats(State(rx): State<watch::Receiver<Snapshot>>) -> impl IntoResponse {
    Json(rx.borrow().typed_view())
}

/// Spawn the status server. Returns the bound address.
///
/// New connections are refused once `shutdown` fires; in-flight requests are
/// allowed to finish.
pub async fn spawn_status_server(
    port: u16,
    snapshot_rx: watch::Receiver<Snapshot>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<SocketAddr> {
    let app = Router::new()
        .route("/", get(stats))
        .with_state(snapshot_rx)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    let addr = listener.local_addr()?;

    info!("status server listening on {addr}");

    tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            // Either an explicit shutdown or the monitor dropping its sender
            // side ends the server.
            let _ = shutdown.wait_for(|stop| *stop).await;
        });
        if let Err(e) = serve.await {
            tracing::error!("status server error: {e}");
        }
    });

    Ok(addr)
}
