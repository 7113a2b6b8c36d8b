//! Router assembly and the serving loop.

use std::net::SocketAddr;

use axum::middleware;
use axum::routing::{any, get, post, MethodRouter};
use axum::Router;
use bundler_core::error::Result;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::handler;
use crate::lifecycle::DrainController;
use crate::lint;
use crate::proxy;
use crate::state::AppState;

/// Create the application router.
pub fn create_app(state: AppState) -> Router {
    // Installer writes are linted on their way to the upstream; every other
    // method goes straight through.
    let installer: MethodRouter<AppState> = post(proxy::forward)
        .put(proxy::forward)
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            lint::lint_installer,
        ))
        .fallback(proxy::forward);

    Router::new()
        .route("/bundle/:installer_id", any(handler::bundle))
        .route(
            "/bundle/version/:kurl_version/:installer_id",
            any(handler::bundle),
        )
        .route("/healthz", get(handler::healthz))
        .route("/installer", installer.clone())
        .route("/installer/*rest", installer)
        .fallback(proxy::forward)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the drain controller requests shutdown and every open
/// connection has finished.
pub async fn serve(listener: TcpListener, state: AppState, drain: DrainController) -> Result<()> {
    let app = create_app(state);

    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Listening");
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { drain.shutdown_requested().await })
    .await?;

    Ok(())
}
