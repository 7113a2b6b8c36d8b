//! HTTP mapping for bundle errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bundler_core::error::BundleError;

/// Status code for an error raised before any archive bytes were sent.
pub fn status_for(err: &BundleError) -> StatusCode {
    match err {
        BundleError::NotFound { .. } => StatusCode::NOT_FOUND,
        BundleError::DisallowedImage(_) | BundleError::InvalidReference(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert a pre-stream error into a plain-text response.
///
/// A not-found body from the upstream is forwarded unchanged.
pub fn bundle_error_response(err: &BundleError) -> Response {
    let status = status_for(err);
    match err {
        BundleError::NotFound { body } => (status, body.clone()).into_response(),
        other => (status, other.to_string()).into_response(),
    }
}

/// Log an error for the operator.
///
/// Client disconnects are expected when downloads are cancelled and are
/// logged at warn level only.
pub fn report_error(err: &BundleError, installer: &str) {
    if err.is_client_disconnect() {
        tracing::warn!(installer = %installer, error = %err, "Client went away during bundle stream");
    } else {
        tracing::error!(installer = %installer, error = %err, "Bundle request failed");
    }
}
