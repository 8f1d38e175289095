//! Request Pipeline (C6) — parse the request, match a route, run the
//! middleware chains, invoke the handler, write the response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use axum::http::{HeaderMap, Method};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::TitanError;
use crate::hooks::{HookBus, HookName};
use crate::loader::ModuleLoader;
use crate::middleware::{run_chain, ChainEntry, ChainKind, HandlerFn, HandlerResult, MiddlewareFn, Next, RouteInfo};
use crate::options::{Env, Options};
use crate::request::{coerce_query, ParsedBody, QueryValue, RequestContext, ResponseContext};
use crate::route_convention::RouteDescriptor;

/// Published by the build worker; readers take a reference to an immutable
/// snapshot, so a request that began reading version N observes version N
/// for its whole lifetime (§5).
pub type RouteTable = Arc<Vec<RouteDescriptor>>;

pub struct PipelineState {
    route_table: RwLock<Arc<Vec<RouteDescriptor>>>,
    pub loader: Arc<ModuleLoader>,
    pub hooks: Arc<HookBus>,
    options: RwLock<Arc<Options>>,
    pub global_middlewares: Vec<ChainEntry>,
    request_counter: AtomicU64,
}

impl PipelineState {
    pub fn new(loader: Arc<ModuleLoader>, hooks: Arc<HookBus>, options: Options) -> Self {
        PipelineState {
            route_table: RwLock::new(Arc::new(Vec::new())),
            loader,
            hooks,
            options: RwLock::new(Arc::new(options)),
            global_middlewares: Vec::new(),
            request_counter: AtomicU64::new(0),
        }
    }

    /// Atomically swap in a freshly built route table (P4): a request that
    /// has already read the old `Arc` keeps observing it to completion.
    pub fn publish_routes(&self, table: Vec<RouteDescriptor>) {
        *self.route_table.write().unwrap() = Arc::new(table);
    }

    fn load_routes(&self) -> Arc<Vec<RouteDescriptor>> {
        self.route_table.read().unwrap().clone()
    }

    pub fn publish_options(&self, options: Options) {
        *self.options.write().unwrap() = Arc::new(options);
    }

    fn load_options(&self) -> Arc<Options> {
        self.options.read().unwrap().clone()
    }

    /// Current options snapshot, for callers outside the pipeline (the HTTP
    /// binding layer needs `server.request.max_body_size` before `dispatch`
    /// is even reachable).
    pub fn current_options(&self) -> Arc<Options> {
        self.load_options()
    }

    /// Current route table snapshot, for the telemetry collaborator's
    /// `get-routes`/`get-manifest` replies.
    pub fn current_routes(&self) -> Arc<Vec<RouteDescriptor>> {
        self.load_routes()
    }

    fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:x}", Uuid::new_v4(), n)
    }
}

fn parse_query(raw_query: Option<&str>, options: &Options) -> HashMap<String, QueryValue> {
    let pairs: Vec<(String, String)> = raw_query
        .map(|q| {
            q.split('&')
                .filter(|p| !p.is_empty())
                .filter_map(|pair| {
                    let mut it = pair.splitn(2, '=');
                    let key = it.next()?;
                    let value = it.next().unwrap_or("");
                    Some((urlencoding_decode(key), urlencoding_decode(value)))
                })
                .collect()
        })
        .unwrap_or_default();

    let qp = &options.server.request.query_parser;
    coerce_query(pairs, qp.number.enabled, qp.boolean.enabled, qp.array.enabled, &qp.array.delimiter)
}

fn urlencoding_decode(s: &str) -> String {
    // Minimal percent-decoding; `+` is left as-is (not form-encoded space)
    // since this is the URL query string, not a urlencoded form body.
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Find the descriptor matching `(method, env, pathname)`. Zero matches is
/// `NotFound`; more than one is `Conflict` with a diagnostic (§4.6 step 3).
fn match_route<'a>(
    table: &'a [RouteDescriptor],
    method: &str,
    env: Env,
    pathname: &str,
) -> Result<&'a RouteDescriptor, TitanError> {
    let matches: Vec<&RouteDescriptor> = table
        .iter()
        .filter(|d| {
            let method_ok = d.method_gate.map(|m| m.matches(method)).unwrap_or(true);
            let env_ok = d.env_gate.map(|e| e.as_str() == env.as_str()).unwrap_or(true);
            let path_ok = d.match_regex.as_ref().map(|re| re.is_match(pathname)).unwrap_or(false);
            method_ok && env_ok && path_ok
        })
        .collect();

    match matches.len() {
        0 => Err(TitanError::not_found(format!("no route matches {method} {pathname}"))),
        1 => Ok(matches[0]),
        _ => {
            let listed: Vec<&str> = matches.iter().map(|d| d.path_template.as_str()).collect();
            Err(TitanError::new(
                crate::errors::ErrorKind::Conflict,
                format!("multiple routes matched {method} {pathname}: {}", listed.join(", ")),
            )
            .with_data(serde_json::json!({ "matched": listed })))
        }
    }
}

fn validate_descriptor(d: &RouteDescriptor) -> Result<(), TitanError> {
    if d.path_template.is_empty() || d.output_path.is_empty() || d.match_regex.is_none() {
        return Err(TitanError::internal(format!(
            "route descriptor for {} is malformed",
            d.source_path
        )));
    }
    Ok(())
}

fn request_envelope(req: &RequestContext) -> Value {
    let headers: serde_json::Map<String, Value> = req
        .headers
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
        .collect();

    let query: serde_json::Map<String, Value> = req
        .query
        .iter()
        .map(|(k, v)| {
            let jv = match v {
                QueryValue::Number(n) => serde_json::json!(n),
                QueryValue::Bool(b) => serde_json::json!(b),
                QueryValue::Array(a) => serde_json::json!(a),
                QueryValue::String(s) => serde_json::json!(s),
            };
            (k.clone(), jv)
        })
        .collect();

    let body = match req.body() {
        Some(ParsedBody::Json(v)) => v.clone(),
        Some(ParsedBody::Form(m)) => serde_json::to_value(m).unwrap_or(Value::Null),
        Some(ParsedBody::Text(t)) => Value::String(t.clone()),
        Some(ParsedBody::Bytes(b)) => Value::String(String::from_utf8_lossy(b).into_owned()),
        Some(ParsedBody::Empty) | None => Value::Null,
    };

    serde_json::json!({
        "method": req.method,
        "path": req.pathname,
        "headers": headers,
        "query": query,
        "params": req.params,
        "body": body,
        "requestId": req.request_id,
    })
}

/// Apply a handler/middleware's JSON response envelope to the response
/// context, following the same `_isResponse`/`error` convention the
/// teacher's original dispatcher used for its action results.
fn apply_response_envelope(res: &mut ResponseContext, value: &Value) -> Result<(), TitanError> {
    if let Some(err) = value.get("error") {
        let message = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
        return Err(TitanError::internal(message).with_data(serde_json::json!({ "originalError": err })));
    }

    if value.get("_isResponse").and_then(Value::as_bool).unwrap_or(false) {
        if let Some(status) = value.get("status").and_then(Value::as_u64) {
            if let Ok(code) = axum::http::StatusCode::from_u16(status as u16) {
                res.set_status(code);
            }
        }
        if let Some(headers) = value.get("headers").and_then(Value::as_object) {
            for (k, v) in headers {
                if let Some(vs) = v.as_str() {
                    res.set_header(k, vs.to_string());
                }
            }
        }
        if let Some(location) = value.get("redirect").and_then(Value::as_str) {
            res.redirect(location, res.status());
            return Ok(());
        }
        match value.get("body") {
            Some(Value::String(s)) => res.send_text(s),
            Some(other) => res.json(other),
            None => res.finish_if_not_done(),
        }
        return Ok(());
    }

    res.json(value);
    Ok(())
}

/// Returns true if `"next": true` appears in a middleware's JSON response,
/// signalling the FFI boundary's equivalent of calling `next()`.
fn wants_next(value: &Value) -> bool {
    value.get("_next").and_then(Value::as_bool).unwrap_or(false)
}

fn build_route_middleware_chain(module: Arc<crate::loader::LoadedModule>) -> Vec<ChainEntry> {
    module
        .middleware_names()
        .iter()
        .cloned()
        .map(|name| {
            let module = module.clone();
            let call_name = name.clone();
            let mw: MiddlewareFn = Arc::new(move |req: &mut RequestContext, res: &mut ResponseContext, next: &Next| -> HandlerResult {
                let envelope = request_envelope(req);
                let result = module.call_named(&call_name, &envelope)?;
                if wants_next(&result) {
                    next.call(req, res)
                } else {
                    apply_response_envelope(res, &result)
                }
            });
            (name, mw)
        })
        .collect()
}

/// Run the full pipeline for one request and return the populated
/// `ResponseContext`. Body parsing (content-length guard, content-type
/// dispatch) is performed by the caller (HTTP binding layer) before this is
/// invoked, per §4.6 step order; `body` here is already the memoized parse.
pub async fn dispatch(
    state: &PipelineState,
    method: Method,
    pathname: String,
    raw_query: Option<&str>,
    headers: HeaderMap,
    body: ParsedBody,
    env: Env,
    dev_mode: bool,
) -> axum::response::Response {
    let options = state.load_options();
    let query = parse_query(raw_query, &options);
    let request_id = state.next_request_id();

    let mut req = RequestContext::new(
        pathname.clone(),
        method.as_str().to_string(),
        headers,
        query,
        (*options).clone(),
        request_id.clone(),
    );
    req.set_body_once(body);
    let mut res = ResponseContext::new();
    let start = std::time::Instant::now();

    state.hooks.fire(HookName::RequestBefore, serde_json::json!({ "requestId": request_id })).await;

    let outcome = run_pipeline_body(state, &mut req, &mut res, &pathname, env).await;

    if let Err(err) = &outcome {
        let err = err.clone().with_request_id(request_id.clone());
        state
            .hooks
            .fire(
                HookName::RequestError,
                serde_json::json!({ "requestId": request_id, "message": err.message, "status": err.status().as_u16() }),
            )
            .await;
        res.error(&err, dev_mode);
    } else {
        res.finish_if_not_done();
    }

    state.hooks.fire(HookName::RequestAfter, serde_json::json!({ "requestId": request_id })).await;

    let elapsed = start.elapsed();
    log_request(method.as_str(), &pathname, res.status().as_u16(), elapsed);

    response_from_context(&res, elapsed)
}

fn log_request(method: &str, path: &str, status: u16, elapsed: std::time::Duration) {
    use crate::utils::{gray, green, red, white};
    let status_label = if status >= 500 {
        red(&status.to_string())
    } else if status >= 400 {
        white(&status.to_string())
    } else {
        green(&status.to_string())
    };
    println!(
        "{} {} {} {}",
        status_label,
        white(&format!("{method} {path}")),
        gray("in"),
        gray(&format!("{elapsed:.2?}")),
    );
}

async fn run_pipeline_body(
    state: &PipelineState,
    req: &mut RequestContext,
    res: &mut ResponseContext,
    pathname: &str,
    env: Env,
) -> Result<(), TitanError> {
    let noop: Box<HandlerFn> = Box::new(|_req, _res| Ok(()));
    run_chain(&state.global_middlewares, &*noop, req, res, &state.hooks, ChainKind::Global, None)?;
    if res.is_done() {
        return Ok(());
    }

    let table = state.load_routes();
    let descriptor = match_route(&table, &req.method, env, pathname)?.clone();
    validate_descriptor(&descriptor)?;

    if let Some(params) = descriptor.capture_params(pathname) {
        req.params = params.into_iter().collect();
    }

    let module = state.loader.load(&descriptor.output_path)?;
    let route_chain = build_route_middleware_chain(module.clone());
    let route_info = RouteInfo {
        path: descriptor.path_template.clone(),
        method: descriptor.method_gate.map(|m| m.as_str().to_string()),
        dynamic: descriptor.dynamic,
    };

    let handler: Box<HandlerFn> = Box::new(move |req, res| {
        let envelope = request_envelope(req);
        let result = module.call_handler(&envelope)?;
        apply_response_envelope(res, &result)
    });

    run_chain(&route_chain, &*handler, req, res, &state.hooks, ChainKind::Route, Some(&route_info))
}

fn response_from_context(res: &ResponseContext, elapsed: std::time::Duration) -> axum::response::Response {
    let mut builder = axum::http::Response::builder().status(res.status());
    if let Some(builder_headers) = builder.headers_mut() {
        *builder_headers = res.headers().clone();
    }
    builder = builder.header("X-Powered-By", "titan-server");
    builder = builder.header("Server-Timing", format!("reply;dur={:.2}", elapsed.as_secs_f64() * 1000.0));
    builder.body(axum::body::Body::from(Bytes::copy_from_slice(res.body_bytes()))).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route_convention::convert;
    use std::path::Path;

    #[test]
    fn zero_matches_is_not_found() {
        let table: Vec<RouteDescriptor> = vec![];
        let result = match_route(&table, "GET", Env::Dev, "/missing");
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[test]
    fn single_match_is_ok() {
        let table = vec![convert(Path::new("hello.get.rs"), "s".into(), "o".into(), "")];
        let result = match_route(&table, "GET", Env::Dev, "/hello");
        assert!(result.is_ok());
    }

    #[test]
    fn ambiguous_match_is_conflict() {
        let table = vec![
            convert(Path::new("a/[id].get.rs"), "s1".into(), "o1".into(), ""),
            convert(Path::new("a/[name].get.rs"), "s2".into(), "o2".into(), ""),
        ];
        let result = match_route(&table, "GET", Env::Dev, "/a/42");
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().status(), axum::http::StatusCode::CONFLICT);
    }

    #[test]
    fn env_gate_excludes_wrong_environment() {
        let table = vec![convert(Path::new("debug.dev.get.rs"), "s".into(), "o".into(), "")];
        assert!(match_route(&table, "GET", Env::Prod, "/debug").is_err());
        assert!(match_route(&table, "GET", Env::Dev, "/debug").is_ok());
    }
}
