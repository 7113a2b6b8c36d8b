//! Installer lint interception.
//!
//! `POST`/`PUT` requests under `/installer` that ask for it
//! (`austere=true`, without `skipValidation=true`) are linted before they
//! reach the upstream. Requests with lint findings are answered here.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bundler_core::error::{BundleError, Result};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// Largest installer body buffered for linting.
pub const LINT_BODY_LIMIT: usize = 10 * 1024 * 1024;

const CORS_METHODS: &str = "GET,HEAD,PUT,PATCH,POST,DELETE";

/// One lint finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LintMessage {
    pub message: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Validates installer YAML.
#[async_trait]
pub trait InstallerLinter: Send + Sync {
    /// Lint findings for `yaml`; empty when the installer is valid.
    async fn lint(&self, yaml: &[u8]) -> Result<Vec<LintMessage>>;
}

/// Linter backed by a remote lint endpoint.
#[derive(Debug, Clone)]
pub struct HttpLinter {
    client: reqwest::Client,
    url: String,
}

impl HttpLinter {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl InstallerLinter for HttpLinter {
    async fn lint(&self, yaml: &[u8]) -> Result<Vec<LintMessage>> {
        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "text/yaml")
            .body(yaml.to_vec())
            .send()
            .await
            .map_err(|e| BundleError::Lint(format!("error calling {}: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BundleError::Lint(format!(
                "{} responded with status {}",
                self.url, status
            )));
        }

        response
            .json::<Vec<LintMessage>>()
            .await
            .map_err(|e| BundleError::Lint(format!("error decoding lint result: {}", e)))
    }
}

/// Whether the query asks for linting.
pub fn lint_requested(query: &HashMap<String, String>) -> bool {
    query.get("austere").map(String::as_str) == Some("true")
        && query.get("skipValidation").map(String::as_str) != Some("true")
}

/// Middleware applied to installer writes.
pub async fn lint_installer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() != Method::POST && request.method() != Method::PUT {
        return next.run(request).await;
    }

    let query = Query::<HashMap<String, String>>::try_from_uri(request.uri())
        .map(|Query(q)| q)
        .unwrap_or_default();
    if !lint_requested(&query) {
        return next.run(request).await;
    }

    let Some(linter) = state.linter.clone() else {
        return next.run(request).await;
    };

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, LINT_BODY_LIMIT).await {
        Ok(body) => body,
        Err(e) => return internal_error("error copying request body", &e.to_string()),
    };

    match linter.lint(&body).await {
        Ok(messages) if messages.is_empty() => {
            next.run(Request::from_parts(parts, Body::from(body))).await
        }
        Ok(messages) => lint_rejection(&messages),
        Err(e) => internal_error("unexpected error linting installer", &e.to_string()),
    }
}

fn set_cors(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
}

fn internal_error(context: &str, err: &str) -> Response {
    let message = format!("{}: {}", context, err);
    tracing::error!("{}", message);
    let mut response = (StatusCode::INTERNAL_SERVER_ERROR, message).into_response();
    set_cors(&mut response);
    response
}

/// 400 response listing every finding, with the first one up front.
///
/// The body is JSON even though the content type says YAML; installer API
/// clients rely on that pairing.
fn lint_rejection(messages: &[LintMessage]) -> Response {
    let body = serde_json::json!({
        "error": {
            "message": messages[0].message,
            "messages": messages,
        }
    });

    let mut response = (StatusCode::BAD_REQUEST, body.to_string()).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/yaml; charset=utf-8"),
    );
    set_cors(&mut response);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_lint_requested() {
        assert!(lint_requested(&query(&[("austere", "true")])));
        assert!(!lint_requested(&query(&[])));
        assert!(!lint_requested(&query(&[("austere", "1")])));
        assert!(!lint_requested(&query(&[
            ("austere", "true"),
            ("skipValidation", "true")
        ])));
        assert!(lint_requested(&query(&[
            ("austere", "true"),
            ("skipValidation", "false")
        ])));
    }

    #[test]
    fn test_lint_message_keeps_extra_fields() {
        let messages: Vec<LintMessage> = serde_json::from_str(
            r#"[{"message":"unknown add-on","type":"unknown-addon","field":"spec.foo"}]"#,
        )
        .unwrap();
        assert_eq!(messages[0].message, "unknown add-on");
        assert_eq!(messages[0].extra["type"], "unknown-addon");

        let encoded = serde_json::to_value(&messages[0]).unwrap();
        assert_eq!(encoded["field"], "spec.foo");
    }

    #[tokio::test]
    async fn test_lint_rejection_shape() {
        let messages = vec![
            LintMessage {
                message: "first".to_string(),
                extra: Default::default(),
            },
            LintMessage {
                message: "second".to_string(),
                extra: Default::default(),
            },
        ];
        let response = lint_rejection(&messages);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/yaml; charset=utf-8"
        );
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["message"], "first");
        assert_eq!(body["error"]["messages"][1]["message"], "second");
    }
}
