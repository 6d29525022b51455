use std::collections::HashMap;

use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    /// Header names are stored lower-cased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: &str, target: &str) -> Self {
        Self {
            method: method.to_string(),
            target: target.to_string(),
            ..Self::default()
        }
    }

    pub fn with_json_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.headers
            .insert("content-type".to_string(), "application/json".to_string());
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    pub fn json(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: "application/json",
            body,
        }
    }

    pub fn ok_json(body: String) -> Self {
        Self::json(200, body)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::error_with_status(400, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::error_with_status(404, message)
    }

    pub fn method_not_allowed(message: &str) -> Self {
        Self::error_with_status(405, message)
    }

    pub fn internal_server_error(message: &str) -> Self {
        Self::error_with_status(500, message)
    }

    pub fn error_with_status(status: u16, message: &str) -> Self {
        Self::json(status, json!({ "error": message }).to_string())
    }
}
