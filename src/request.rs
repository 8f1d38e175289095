//! Request/response context (§3) — created per request by C6, destroyed
//! when the response ends.

use std::collections::HashMap;

use axum::http::{Extensions, HeaderMap, StatusCode};
use serde_json::Value;

use crate::errors::TitanError;
use crate::options::Options;

/// A single coerced query value, per the §4.6 precedence: number > boolean
/// > array > string.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Number(f64),
    Bool(bool),
    Array(Vec<String>),
    String(String),
}

impl QueryValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            QueryValue::String(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ParsedBody {
    Json(Value),
    Form(HashMap<String, String>),
    Text(String),
    Bytes(Vec<u8>),
    Empty,
}

/// Per-request context. Carries everything the handler and middleware
/// chain need; `storage` is a typed heterogeneous scratch map, not part of
/// any stable cross-request contract.
pub struct RequestContext {
    pub pathname: String,
    pub method: String,
    pub headers: HeaderMap,
    pub query: HashMap<String, QueryValue>,
    body: Option<ParsedBody>,
    pub params: HashMap<String, String>,
    pub storage: Extensions,
    pub options: Options,
    pub request_id: String,
}

impl RequestContext {
    pub fn new(
        pathname: String,
        method: String,
        headers: HeaderMap,
        query: HashMap<String, QueryValue>,
        options: Options,
        request_id: String,
    ) -> Self {
        RequestContext {
            pathname,
            method,
            headers,
            query,
            body: None,
            params: HashMap::new(),
            storage: Extensions::new(),
            options,
            request_id,
        }
    }

    /// Memoize the parsed body; subsequent calls return the cached value.
    pub fn set_body_once(&mut self, body: ParsedBody) {
        if self.body.is_none() {
            self.body = Some(body);
        }
    }

    pub fn body(&self) -> Option<&ParsedBody> {
        self.body.as_ref()
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.storage.get::<T>()
    }

    pub fn set<T: Send + Sync + 'static>(&mut self, value: T) {
        self.storage.insert(value);
    }
}

/// Per-response state. Once `done` is set, all mutations fail fast.
pub struct ResponseContext {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    done: bool,
}

impl ResponseContext {
    pub fn new() -> Self {
        ResponseContext { status: StatusCode::OK, headers: HeaderMap::new(), body: Vec::new(), done: false }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Mutate the status code. Fails fast (panics) if the response is
    /// already done — per §3, "once set, all subsequent mutations fail
    /// fast."
    pub fn set_status(&mut self, status: StatusCode) {
        assert!(!self.done, "cannot mutate a response that has already ended");
        self.status = status;
    }

    pub fn set_header(&mut self, name: &str, value: String) {
        assert!(!self.done, "cannot mutate a response that has already ended");
        if let (Ok(name), Ok(value)) = (axum::http::HeaderName::from_bytes(name.as_bytes()), value.parse()) {
            self.headers.insert(name, value);
        }
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    /// `json` — serializes, sets status 200 if unset, and marks done.
    pub fn json(&mut self, value: &Value) {
        assert!(!self.done, "cannot mutate a response that has already ended");
        if !self.has_header("content-type") {
            self.set_header("content-type", "application/json; charset=utf-8".to_string());
        }
        self.body = serde_json::to_vec(value).unwrap_or_default();
        self.done = true;
    }

    /// `send` — dispatches by runtime type per §4.6.
    pub fn send_text(&mut self, text: &str) {
        assert!(!self.done, "cannot mutate a response that has already ended");
        if !self.has_header("content-type") {
            self.set_header("content-type", "text/plain; charset=utf-8".to_string());
        }
        self.body = text.as_bytes().to_vec();
        self.done = true;
    }

    pub fn send_bytes(&mut self, bytes: Vec<u8>) {
        assert!(!self.done, "cannot mutate a response that has already ended");
        if !self.has_header("content-type") {
            self.set_header("content-type", "application/octet-stream".to_string());
        }
        self.body = bytes;
        self.done = true;
    }

    pub fn redirect(&mut self, location: &str, status: StatusCode) {
        assert!(!self.done, "cannot mutate a response that has already ended");
        self.status = status;
        self.set_header("location", location.to_string());
        self.done = true;
    }

    /// Called by the pipeline when a handler returns without marking the
    /// response done: an empty body is acceptable.
    pub fn finish_if_not_done(&mut self) {
        self.done = true;
    }

    pub fn error(&mut self, err: &TitanError, include_stack: bool) {
        self.status = err.status();
        self.set_header("content-type", "application/json; charset=utf-8".to_string());
        self.body = serde_json::to_vec(&err.envelope(include_stack)).unwrap_or_default();
        self.done = true;
    }
}

impl Default for ResponseContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply query coercion rules from §4.6: number > boolean > array > string.
pub fn coerce_query(
    raw: Vec<(String, String)>,
    number_enabled: bool,
    boolean_enabled: bool,
    array_enabled: bool,
    array_delimiter: &str,
) -> HashMap<String, QueryValue> {
    let mut out = HashMap::new();
    for (key, value) in raw {
        let coerced = if number_enabled && value.parse::<f64>().map(|n| n.is_finite()).unwrap_or(false) {
            QueryValue::Number(value.parse().unwrap())
        } else if boolean_enabled && (value == "true" || value == "false") {
            QueryValue::Bool(value == "true")
        } else if array_enabled && !array_delimiter.is_empty() && value.contains(array_delimiter) {
            QueryValue::Array(value.split(array_delimiter).map(String::from).collect())
        } else {
            QueryValue::String(value)
        };
        out.insert(key, coerced);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_coercion_precedence() {
        let raw = vec![
            ("n".to_string(), "42".to_string()),
            ("b".to_string(), "true".to_string()),
            ("a".to_string(), "x,y,z".to_string()),
            ("s".to_string(), "plain".to_string()),
        ];
        let q = coerce_query(raw, true, true, true, ",");
        assert_eq!(q["n"], QueryValue::Number(42.0));
        assert_eq!(q["b"], QueryValue::Bool(true));
        assert_eq!(q["a"], QueryValue::Array(vec!["x".into(), "y".into(), "z".into()]));
        assert_eq!(q["s"], QueryValue::String("plain".into()));
    }

    #[test]
    fn coercion_disabled_falls_back_to_string() {
        let raw = vec![("n".to_string(), "42".to_string())];
        let q = coerce_query(raw, false, false, false, ",");
        assert_eq!(q["n"], QueryValue::String("42".into()));
    }

    #[test]
    #[should_panic]
    fn mutation_after_done_panics() {
        let mut res = ResponseContext::new();
        res.send_text("done");
        res.send_text("again");
    }

    #[test]
    fn json_sets_default_content_type_and_status() {
        let mut res = ResponseContext::new();
        res.json(&serde_json::json!({"message": "hi"}));
        assert!(res.is_done());
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers().get("content-type").unwrap(), "application/json; charset=utf-8");
    }
}
