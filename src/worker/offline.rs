//! Responses synthesized when neither the network nor a tier can answer.

use chrono::Utc;
use serde_json::json;

use crate::http::Response;

/// Marks an API error body generated by the worker.
pub const OFFLINE_RESPONSE_HEADER: &str = "x-offline-response";
/// Marks a placeholder image generated by the worker.
pub const OFFLINE_PLACEHOLDER_HEADER: &str = "x-offline-placeholder";

const PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200" viewBox="0 0 200 200"><rect width="200" height="200" fill="#f1f3f5"/><path d="M70 125l20-25 15 18 10-12 15 19z" fill="#ced4da"/><circle cx="120" cy="80" r="10" fill="#ced4da"/><text x="100" y="160" font-family="sans-serif" font-size="14" fill="#868e96" text-anchor="middle">Offline</text></svg>"##;

/// Placeholder served for images that are neither cached nor reachable.
pub fn placeholder_image() -> Response {
  Response::new(200, PLACEHOLDER_SVG)
    .with_header("content-type", "image/svg+xml")
    .with_header("cache-control", "no-store")
    .with_header(OFFLINE_PLACEHOLDER_HEADER, "true")
}

/// 503 body served for API requests with no network and no cached copy.
pub fn offline_api_response(message: &str) -> Response {
  let body = json!({
    "error": "Offline",
    "message": message,
    "offline": true,
    "timestamp": Utc::now().timestamp_millis(),
  });

  Response::new(503, body.to_string())
    .with_header("content-type", "application/json")
    .with_header("cache-control", "no-store")
    .with_header(OFFLINE_RESPONSE_HEADER, "true")
}
