//! Bundle and health endpoints.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bundler_core::error::Result;
use bundler_core::BundleManifest;
use bundler_runtime::{body_channel, ArchiveComposer, ImagePrefetch, InstallerTarget};
use serde::{Deserialize, Serialize};

use crate::error::{bundle_error_response, report_error};
use crate::state::AppState;

/// Health endpoint payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthzResponse {
    pub is_alive: bool,
    pub active_streams: i64,
    pub version: String,
}

pub async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        is_alive: true,
        active_streams: state.streams.active(),
        version: state.config.version.clone(),
    })
}

/// `/bundle/:installer_id` and `/bundle/version/:kurl_version/:installer_id`.
pub async fn bundle(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    headers: HeaderMap,
    Path(params): Path<HashMap<String, String>>,
) -> Response {
    let guard = state.streams.begin();

    if method == Method::OPTIONS {
        return preflight();
    }
    if method != Method::GET && method != Method::HEAD {
        return (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response();
    }

    let target = InstallerTarget::new(
        params.get("installer_id").map(String::as_str).unwrap_or_default(),
        params.get("kurl_version").map(String::as_str),
    );
    let remote = connect.map(|ConnectInfo(addr)| addr.ip());
    tracing::info!(method = %method, installer = %target, "Bundle request");

    let manifest = match prepare(&state, &target, &headers, remote).await {
        Ok(manifest) => manifest,
        Err(e) => {
            report_error(&e, &target.to_string());
            return bundle_error_response(&e);
        }
    };

    if method == Method::HEAD {
        return (bundle_headers(), ()).into_response();
    }

    let prefetch = match ImagePrefetch::start(
        manifest.images.clone(),
        state.images.clone(),
        &state.config.scratch_dir,
    )
    .await
    {
        Ok(prefetch) => prefetch,
        Err(e) => {
            report_error(&e, &target.to_string());
            return bundle_error_response(&e);
        }
    };

    let (writer, body) = body_channel();
    let layers = state.layers.clone();
    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        let started = Instant::now();
        let sources = manifest.source_count();

        match ArchiveComposer::new(writer).compose(&manifest, layers.as_ref(), prefetch) {
            Ok(()) => tracing::info!(
                installer = %target,
                sources,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Bundle complete"
            ),
            Err(e) => report_error(&e, &target.to_string()),
        }
    });

    (bundle_headers(), Body::from_stream(body)).into_response()
}

/// Everything that can still fail with an HTTP status: resolve the
/// manifest, check every image against the allowlist, then probe every
/// layer. Nothing is downloaded if an image is rejected.
async fn prepare(
    state: &AppState,
    target: &InstallerTarget,
    headers: &HeaderMap,
    remote: Option<IpAddr>,
) -> Result<BundleManifest> {
    let manifest = state.resolver.resolve(target, headers, remote).await?;
    state.allowlist.check_all(&manifest.images)?;
    for url in &manifest.layers {
        state.layers.probe(url).await?;
    }
    Ok(manifest)
}

fn bundle_headers() -> [(header::HeaderName, HeaderValue); 3] {
    [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static("binary/octet-stream"),
        ),
        (
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ),
        (
            header::CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment"),
        ),
    ]
}

fn preflight() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET"),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "Access-Control-Allow-Origin, Content-Type",
            ),
            (header::ACCESS_CONTROL_MAX_AGE, "86400"),
        ],
    )
        .into_response()
}
