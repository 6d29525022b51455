//! Per-route wrappers. Each route opts into them explicitly.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;

use super::{HttpRequest, HttpResponse};
use crate::CensusError;

/// Turns a core result into a response: `{"data": ...}` with
/// `success_status`, or `{"error": ...}` with the status owned by the error.
pub(super) fn translate_errors<T: Serialize>(
    route: &'static str,
    success_status: u16,
    result: Result<T, CensusError>,
) -> HttpResponse {
    match result {
        Ok(value) => match serde_json::to_string(&json!({ "data": value })) {
            Ok(body) => HttpResponse::json(success_status, body),
            Err(err) => {
                tracing::error!(route, error = %err, "failed to encode response");
                HttpResponse::internal_server_error("failed to encode response")
            }
        },
        Err(err) => {
            let status = err.status_code();
            if status >= 500 {
                tracing::error!(route, status, error = %err, "request failed");
            } else {
                tracing::debug!(route, status, error = %err, "request rejected");
            }
            HttpResponse::error_with_status(status, &err.to_string())
        }
    }
}

/// Guards routes that take a JSON body.
pub(super) fn require_json(request: &HttpRequest, route: &str) -> Result<(), HttpResponse> {
    let is_json = request
        .header("content-type")
        .is_some_and(|value| value.to_ascii_lowercase().contains("application/json"));
    if is_json {
        Ok(())
    } else {
        Err(HttpResponse::bad_request(&format!(
            "content-type must include application/json for {route}"
        )))
    }
}

pub(super) fn parse_json_body<T: DeserializeOwned>(request: &HttpRequest) -> Result<T, HttpResponse> {
    let body = std::str::from_utf8(&request.body)
        .map_err(|_| HttpResponse::bad_request("request body must be valid UTF-8"))?;
    serde_json::from_str(body)
        .map_err(|err| HttpResponse::bad_request(&format!("invalid JSON body: {err}")))
}
