//! Shared fixtures: an in-process upstream installer API, a fake image
//! fetcher and bundle decoding helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bundler_core::error::{BundleError, Result};
use bundler_core::BundlerConfig;
use bundler_runtime::ImageFetcher;
use bundler_server::lifecycle::StreamTracker;
use bundler_server::AppState;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;

pub const SLOW_LAYER_DELAY: Duration = Duration::from_millis(400);

/// One request seen by the upstream fallback.
#[derive(Debug, Clone)]
pub struct Proxied {
    pub method: String,
    pub uri: String,
    pub body: Vec<u8>,
}

pub struct Fixtures {
    manifests: HashMap<String, serde_json::Value>,
    layers: HashMap<String, Vec<u8>>,
    pub layer_requests: AtomicUsize,
    pub manifest_headers: Mutex<Vec<HeaderMap>>,
    pub proxied: Mutex<Vec<Proxied>>,
}

impl Fixtures {
    fn new(base: &str) -> Self {
        let layer = |name: &str| format!("{}/layers/{}", base, name);

        let mut manifests = HashMap::new();
        manifests.insert(
            "/bundle/complete".to_string(),
            json!({
                "layers": [layer("weave"), layer("kubernetes")],
                "files": { "install.sh": "#!/bin/bash\n", "join.sh": "join" },
                "images": ["nginx:1.25", "ghcr.io/org/app:v1"],
            }),
        );
        manifests.insert(
            "/bundle/version/v2024.01.02-0/pinned".to_string(),
            json!({ "files": { "version.txt": "v2024.01.02-0" } }),
        );
        manifests.insert(
            "/bundle/disallowed".to_string(),
            json!({
                "layers": [layer("weave")],
                "images": ["nginx:1.25", "quay.io/org/app:1"],
            }),
        );
        manifests.insert(
            "/bundle/flaky".to_string(),
            json!({
                "layers": [layer("weave"), layer("flaky")],
                "files": { "install.sh": "#!/bin/bash\n" },
            }),
        );
        manifests.insert(
            "/bundle/missing-layer".to_string(),
            json!({ "layers": [layer("gone")] }),
        );
        manifests.insert(
            "/bundle/bad-image".to_string(),
            json!({
                "files": { "install.sh": "#!/bin/bash\n" },
                "images": ["nginx:1.25", "ttl.sh/fails:1h"],
            }),
        );
        manifests.insert(
            "/bundle/slow".to_string(),
            json!({
                "layers": [layer("slow-weave")],
                "images": ["nginx:1.25"],
            }),
        );

        let mut layers = HashMap::new();
        layers.insert(
            "weave".to_string(),
            gz_layer(&[("addons/weave/install.yaml", "kind: DaemonSet\n")]),
        );
        layers.insert(
            "kubernetes".to_string(),
            gz_layer(&[("./packages/kubernetes/1.29/images.txt", "kube-proxy\n")]),
        );

        Self {
            manifests,
            layers,
            layer_requests: AtomicUsize::new(0),
            manifest_headers: Mutex::new(Vec::new()),
            proxied: Mutex::new(Vec::new()),
        }
    }
}

pub struct MockUpstream {
    pub base: String,
    pub fixtures: Arc<Fixtures>,
}

impl MockUpstream {
    pub fn layer_requests(&self) -> usize {
        self.fixtures.layer_requests.load(Ordering::SeqCst)
    }

    pub fn proxied(&self) -> Vec<Proxied> {
        self.fixtures.proxied.lock().unwrap().clone()
    }

    pub fn manifest_headers(&self) -> Vec<HeaderMap> {
        self.fixtures.manifest_headers.lock().unwrap().clone()
    }
}

async fn manifest(State(f): State<Arc<Fixtures>>, uri: Uri, headers: HeaderMap) -> Response {
    f.manifest_headers.lock().unwrap().push(headers);
    match uri.path() {
        "/bundle/broken" => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
        "/bundle/garbage" => (StatusCode::OK, "not json").into_response(),
        path => match f.manifests.get(path) {
            Some(manifest) => Json(manifest.clone()).into_response(),
            None => (StatusCode::NOT_FOUND, "installer not found\n").into_response(),
        },
    }
}

async fn layer(
    State(f): State<Arc<Fixtures>>,
    method: Method,
    UrlPath(name): UrlPath<String>,
) -> Response {
    f.layer_requests.fetch_add(1, Ordering::SeqCst);

    if name.starts_with("flaky") {
        return if method == Method::HEAD {
            StatusCode::OK.into_response()
        } else {
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        };
    }

    let (name, slow) = match name.strip_prefix("slow-") {
        Some(rest) => (rest.to_string(), true),
        None => (name.clone(), false),
    };
    if slow && method == Method::GET {
        tokio::time::sleep(SLOW_LAYER_DELAY).await;
    }

    match f.layers.get(&name) {
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn echo(State(f): State<Arc<Fixtures>>, method: Method, uri: Uri, body: Bytes) -> Response {
    f.proxied.lock().unwrap().push(Proxied {
        method: method.to_string(),
        uri: uri.to_string(),
        body: body.to_vec(),
    });
    (
        StatusCode::CREATED,
        [("x-upstream", "yes")],
        format!("upstream:{}", String::from_utf8_lossy(&body)),
    )
        .into_response()
}

/// Start the fake installer API on an ephemeral port.
pub async fn spawn_upstream() -> MockUpstream {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let fixtures = Arc::new(Fixtures::new(&base));

    let router = Router::new()
        .route("/bundle/*rest", get(manifest))
        .route("/layers/:name", get(layer))
        .fallback(echo)
        .with_state(fixtures.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    MockUpstream { base, fixtures }
}

/// Writes `image:<reference>` to the destination; references containing
/// `fails` are rejected like a missing manifest.
#[derive(Default)]
pub struct FakeFetcher {
    pub calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageFetcher for FakeFetcher {
    async fn fetch(&self, image: &str, dest: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(image.to_string());
        if image.contains("fails") {
            return Err(BundleError::ImagePull {
                image: image.to_string(),
                message: "manifest unknown".to_string(),
            });
        }
        tokio::fs::write(dest, format!("image:{}", image)).await?;
        Ok(())
    }
}

pub fn config_for(upstream: &MockUpstream, scratch: &Path) -> BundlerConfig {
    BundlerConfig {
        upstream_url: upstream.base.clone(),
        scratch_dir: scratch.to_path_buf(),
        version: "test-build".to_string(),
        ..Default::default()
    }
}

pub fn app_state(upstream: &MockUpstream, scratch: &Path, fetcher: Arc<FakeFetcher>) -> AppState {
    AppState::from_config(config_for(upstream, scratch))
        .unwrap()
        .with_image_fetcher(fetcher)
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn gz_layer(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, name, body.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// A bundle as seen by a standard tar reader.
pub struct DecodedBundle {
    pub names: Vec<String>,
    pub bodies: Vec<Vec<u8>>,
    pub error: Option<io::Error>,
}

impl DecodedBundle {
    pub fn body_of(&self, name: &str) -> Option<&[u8]> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.bodies.get(i))
            .map(Vec::as_slice)
    }
}

pub fn decode_bundle(bytes: &[u8]) -> DecodedBundle {
    let mut decoded = DecodedBundle {
        names: Vec::new(),
        bodies: Vec::new(),
        error: None,
    };
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes));
    let entries = match archive.entries() {
        Ok(entries) => entries,
        Err(e) => {
            decoded.error = Some(e);
            return decoded;
        }
    };
    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                decoded.error = Some(e);
                break;
            }
        };
        decoded
            .names
            .push(entry.path().unwrap().display().to_string());
        let mut body = Vec::new();
        if let Err(e) = entry.read_to_end(&mut body) {
            decoded.error = Some(e);
            break;
        }
        decoded.bodies.push(body);
    }
    decoded
}

/// Wait for in-flight streams to release their guards.
pub async fn wait_for_idle(tracker: &StreamTracker) {
    for _ in 0..200 {
        if tracker.active() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("active streams never returned to zero: {}", tracker.active());
}

pub fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

/// Wait for the prefetch worker and the composer to release the scratch directory.
pub async fn wait_for_empty_dir(dir: &Path) {
    for _ in 0..200 {
        if dir_is_empty(dir) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scratch directory was never removed: {}", dir.display());
}
