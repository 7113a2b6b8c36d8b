//! Reverse proxy to the upstream installer API.
//!
//! Every request the bundler does not handle itself is forwarded as is and
//! the upstream response is streamed back.

use std::net::SocketAddr;

use axum::body::{Body, HttpBody};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use bundler_runtime::resolver::{forwarded_headers, is_hop_by_hop};

use crate::state::AppState;

const BODY_CHANNEL_DEPTH: usize = 8;

/// Forward a request to the upstream and relay its response.
pub async fn forward(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.upstream(), path);
    let remote = connect.map(|ConnectInfo(addr)| addr.ip());

    let mut upstream = state
        .proxy_client
        .request(parts.method.clone(), &url)
        .headers(forwarded_headers(&parts.headers, remote));
    if body.size_hint().exact() != Some(0) {
        upstream = upstream.body(stream_body(body));
    }

    let response = match upstream.send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(method = %parts.method, url = %url, error = %e, "Proxy request failed");
            return (StatusCode::BAD_GATEWAY, format!("error forwarding request: {}", e))
                .into_response();
        }
    };

    tracing::debug!(
        method = %parts.method,
        url = %url,
        status = response.status().as_u16(),
        "Proxied request"
    );

    let status = response.status();
    let headers = end_to_end(response.headers());
    let mut relayed = Response::new(Body::from_stream(response.bytes_stream()));
    *relayed.status_mut() = status;
    *relayed.headers_mut() = headers;
    relayed
}

fn end_to_end(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Adapt an incoming body into an outgoing one without buffering it.
fn stream_body(body: Body) -> reqwest::Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, axum::Error>>(BODY_CHANNEL_DEPTH);
    tokio::spawn(async move {
        let mut chunks = body.into_data_stream();
        while let Some(chunk) = chunks.next().await {
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });
    reqwest::Body::wrap_stream(ReceiverStream::new(rx))
}
