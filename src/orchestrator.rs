//! Dev Orchestrator (C10) — the state machine owning the watcher, the build
//! queue, the running HTTP server and the telemetry publisher.
//!
//! Grounded in the teacher's `RuntimeManager`: a single task serializes every
//! state transition, and every other component talks to it by sending a
//! message rather than mutating shared state directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Router;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::compiler::{self, CompilationCache};
use crate::config::{self, CliOverrides};
use crate::env_file;
use crate::errors::{BuildError, ErrorKind, TitanError};
use crate::event_bus::{Event, EventBus, EventKind};
use crate::hooks::{HookBus, HookName};
use crate::loader::ModuleLoader;
use crate::manifest;
use crate::options::{Command, CorsOptions, Env, Options};
use crate::pipeline::{self, PipelineState};
use crate::request::ParsedBody;
use crate::route_scanner;
use crate::telemetry;
use crate::utils::{blue, gray, green, red, yellow};
use crate::watcher;

const MAX_RELOAD_ATTEMPTS: u32 = 3;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Uninitialized,
    Initializing,
    Running,
    Restarting,
    Stopping,
}

/// Outcome of one generation: either the process should stop, or a critical
/// config change requires a full `Initializing → Running` cycle again.
enum Generation {
    Stopped,
    Restart,
}

enum OrchestratorEvent {
    FileChanged(PathBuf),
    FileAddedOrDeleted,
    EnvChanged,
    ConfigChanged,
}

fn cdylib_extension() -> &'static str {
    if cfg!(target_os = "windows") {
        "dll"
    } else if cfg!(target_os = "macos") {
        "dylib"
    } else {
        "so"
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn config_file_names() -> Vec<String> {
    ["titan.config.toml", "titan.config.yaml", "titan.config.yml", "titan.config.json"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn forward_file_event(
    tx: mpsc::UnboundedSender<OrchestratorEvent>,
    config_names: Vec<String>,
) -> crate::event_bus::Subscriber {
    Arc::new(move |event: &Event| {
        let path = event.payload.get("path").and_then(Value::as_str).unwrap_or_default();
        let file_name = Path::new(path).file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let msg = if config_names.iter().any(|n| n == file_name) {
            OrchestratorEvent::ConfigChanged
        } else {
            OrchestratorEvent::FileChanged(PathBuf::from(path))
        };
        let _ = tx.send(msg);
    })
}

fn forward_added_deleted(tx: mpsc::UnboundedSender<OrchestratorEvent>) -> crate::event_bus::Subscriber {
    Arc::new(move |_event: &Event| {
        let _ = tx.send(OrchestratorEvent::FileAddedOrDeleted);
    })
}

fn forward_env_changed(tx: mpsc::UnboundedSender<OrchestratorEvent>) -> crate::event_bus::Subscriber {
    Arc::new(move |_event: &Event| {
        let _ = tx.send(OrchestratorEvent::EnvChanged);
    })
}

/// Drives the full lifecycle of one `dev` or `start` invocation. `build` is
/// handled separately (see `cli.rs`): a single generation with no watcher,
/// no server, no telemetry.
pub struct Orchestrator {
    project_root: PathBuf,
    command: Command,
    env: Env,
    overrides: CliOverrides,
    watch: bool,
    tls: Option<crate::cli::TlsConfig>,
    state: OrchestratorState,
}

impl Orchestrator {
    pub fn new(
        project_root: PathBuf,
        command: Command,
        env: Env,
        overrides: CliOverrides,
        watch: bool,
        tls: Option<crate::cli::TlsConfig>,
    ) -> Self {
        Orchestrator { project_root, command, env, overrides, watch, tls, state: OrchestratorState::Uninitialized }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Run generations until a clean shutdown. A critical config change
    /// ends one generation with `Generation::Restart` and the loop begins
    /// the next one from `Initializing`.
    pub async fn run(mut self) -> Result<(), BuildError> {
        loop {
            match self.run_one_generation().await? {
                Generation::Stopped => return Ok(()),
                Generation::Restart => continue,
            }
        }
    }

    async fn run_one_generation(&mut self) -> Result<Generation, BuildError> {
        self.state = OrchestratorState::Initializing;
        tracing::info!("{}", blue("[titan] initializing"));

        env_file::load(&self.project_root);
        let mut options = config::load(&self.project_root, &self.overrides, self.command, self.env)
            .map_err(|e| BuildError::Scan(e.to_string()))?;

        let mut output_root = self.project_root.join(&options.build.output_root);
        let mut routes_root = self.project_root.join(&options.build.routes_subtree);

        let event_bus = Arc::new(EventBus::new());
        let hooks = Arc::new(HookBus::new());
        let loader = Arc::new(ModuleLoader::new(self.command == Command::Dev));
        let pipeline_state = Arc::new(PipelineState::new(loader.clone(), hooks.clone(), options.clone()));

        let (tx, mut rx) = mpsc::unbounded_channel::<OrchestratorEvent>();

        let mut cache = CompilationCache::load(&output_root).await;
        cache = self
            .run_full_build(&options, &routes_root, &output_root, &event_bus, &pipeline_state, cache)
            .await?;

        let file_watcher = if self.watch {
            event_bus.subscribe(&EventKind::FileChanged, forward_file_event(tx.clone(), config_file_names()));
            event_bus.subscribe(&EventKind::FileAdded, forward_added_deleted(tx.clone()));
            event_bus.subscribe(&EventKind::FileDeleted, forward_added_deleted(tx.clone()));
            event_bus.subscribe(&EventKind::EnvChanged, forward_env_changed(tx.clone()));
            Some(
                watcher::start(
                    self.project_root.clone(),
                    output_root.clone(),
                    watcher::DEFAULT_STABILITY_WINDOW,
                    event_bus.clone(),
                )
                .map_err(|e| BuildError::Scan(e.to_string()))?,
            )
        } else {
            None
        };

        let telemetry_handle = telemetry::spawn(&options, event_bus.clone(), pipeline_state.clone());

        let dev_mode = self.command == Command::Dev;
        let app = build_router(pipeline_state.clone(), self.env, dev_mode, &options.cors);
        let addr: SocketAddr = format!("{}:{}", options.server.host, options.server.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| BuildError::Scan(e.to_string()))?;

        event_bus
            .emit(Event { kind: EventKind::ServerStarting, payload: serde_json::json!({ "addr": addr.to_string() }) })
            .await;

        let server_handle = axum_server::Handle::new();
        let server_task = match &self.tls {
            Some(tls) => {
                let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                    .await
                    .map_err(|e| BuildError::Scan(format!("failed to load TLS cert/key: {e}")))?;
                let server_handle = server_handle.clone();
                tokio::spawn(async move {
                    let _ = axum_server::bind_rustls(addr, tls_config)
                        .handle(server_handle)
                        .serve(app.into_make_service())
                        .await;
                })
            }
            None => {
                let server_handle = server_handle.clone();
                tokio::spawn(async move {
                    let _ = axum_server::bind(addr).handle(server_handle).serve(app.into_make_service()).await;
                })
            }
        };

        event_bus
            .emit(Event { kind: EventKind::ServerStarted, payload: serde_json::json!({ "addr": addr.to_string() }) })
            .await;
        tracing::info!("{} {}", green("[titan] listening on"), addr);

        self.state = OrchestratorState::Running;
        let mut reload_attempts: u32 = 0;

        let outcome = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("{}", yellow("[titan] shutdown signal received"));
                    break Generation::Stopped;
                }
                maybe_event = rx.recv() => {
                    let Some(event) = maybe_event else { break Generation::Stopped };
                    match event {
                        OrchestratorEvent::FileChanged(_) | OrchestratorEvent::FileAddedOrDeleted => {
                            match self
                                .run_full_build(&options, &routes_root, &output_root, &event_bus, &pipeline_state, cache.clone())
                                .await
                            {
                                Ok(updated) => {
                                    cache = updated;
                                    reload_attempts = 0;
                                }
                                Err(e) => {
                                    tracing::error!(error = %e, "{}", red("build failed, serving previous manifest"));
                                    reload_attempts += 1;
                                    if reload_attempts >= MAX_RELOAD_ATTEMPTS {
                                        tracing::error!("{}", red("exhausted reload attempts, stopping"));
                                        break Generation::Stopped;
                                    }
                                    tokio::time::sleep(Duration::from_secs(reload_attempts as u64)).await;
                                }
                            }
                        }
                        OrchestratorEvent::EnvChanged => {
                            env_file::load(&self.project_root);
                        }
                        OrchestratorEvent::ConfigChanged => {
                            match config::load(&self.project_root, &self.overrides, self.command, self.env) {
                                Ok(new_options) => {
                                    let diff = config::diff(&options, &new_options);
                                    if diff.is_empty() {
                                        continue;
                                    }
                                    if config::has_critical_change(&diff) {
                                        tracing::info!("{}", yellow("[titan] critical config change, restarting"));
                                        break Generation::Restart;
                                    }
                                    if diff.iter().any(|entry| entry.key.starts_with("hooks")) {
                                        hooks.clear();
                                    }
                                    options = new_options;
                                    let new_output_root = self.project_root.join(&options.build.output_root);
                                    let new_routes_root = self.project_root.join(&options.build.routes_subtree);
                                    if new_output_root != output_root {
                                        cache = CompilationCache::load(&new_output_root).await;
                                    }
                                    output_root = new_output_root;
                                    routes_root = new_routes_root;
                                    pipeline_state.publish_options(options.clone());
                                    tracing::info!("{}", gray("[titan] config reloaded"));
                                }
                                Err(e) => {
                                    tracing::error!(error = %e, "config reload failed, keeping previous config");
                                }
                            }
                        }
                    }
                }
            }
        };

        self.state = OrchestratorState::Stopping;
        event_bus.emit(Event { kind: EventKind::ServerStopping, payload: Value::Null }).await;

        if let Some(handle) = telemetry_handle {
            handle.stop().await;
        }
        server_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        let _ = server_task.await;
        drop(file_watcher);

        hooks.fire(HookName::Close, Value::Null).await;
        event_bus.emit(Event { kind: EventKind::ServerStopped, payload: Value::Null }).await;

        Ok(outcome)
    }

    async fn run_full_build(
        &self,
        options: &Options,
        routes_root: &Path,
        output_root: &Path,
        event_bus: &EventBus,
        pipeline_state: &PipelineState,
        cache: CompilationCache,
    ) -> Result<CompilationCache, BuildError> {
        event_bus.emit(Event { kind: EventKind::BuildStarting, payload: Value::Null }).await;

        let descriptors =
            route_scanner::scan(routes_root, output_root, cdylib_extension(), &options.build.global_prefix)?;

        let result = compiler::compile(&options.build.builder, cache, output_root, &descriptors, now_ms()).await;
        let updated_cache = match result {
            Ok(cache) => cache,
            Err(e) => {
                event_bus
                    .emit(Event { kind: EventKind::BuildError, payload: serde_json::json!({ "message": e.to_string() }) })
                    .await;
                return Err(e);
            }
        };

        manifest::publish(output_root, &descriptors).await?;
        pipeline_state.loader.invalidate_under(output_root);
        pipeline_state.publish_routes(descriptors);

        event_bus.emit(Event { kind: EventKind::BuildSuccess, payload: Value::Null }).await;
        event_bus.emit(Event { kind: EventKind::BuildComplete, payload: Value::Null }).await;

        Ok(updated_cache)
    }
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<PipelineState>,
    env: Env,
    dev_mode: bool,
}

fn build_router(pipeline: Arc<PipelineState>, env: Env, dev_mode: bool, cors: &CorsOptions) -> Router {
    let state = AppState { pipeline, env, dev_mode };
    let mut router = Router::new().fallback(fallback_handler).with_state(state);
    if cors.enabled {
        router = router.layer(build_cors_layer(cors));
    }
    router
}

fn build_cors_layer(cors: &CorsOptions) -> tower_http::cors::CorsLayer {
    use tower_http::cors::{AllowOrigin, CorsLayer};
    let layer = CorsLayer::new().allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any);
    if cors.origins.is_empty() {
        layer.allow_origin(AllowOrigin::any())
    } else {
        let origins: Vec<axum::http::HeaderValue> = cors.origins.iter().filter_map(|o| o.parse().ok()).collect();
        layer.allow_origin(origins)
    }
}

/// The single HTTP entry point: every method and path falls through here.
/// Handles the body-size guard (P9) and content-type dispatch, both of
/// which the pipeline assumes already happened (§4.6 step order), then
/// hands off to `pipeline::dispatch`.
async fn fallback_handler(State(state): State<AppState>, req: axum::extract::Request) -> axum::response::Response {
    let method = req.method().clone();
    let pathname = req.uri().path().to_string();
    let raw_query = req.uri().query().map(str::to_string);
    let headers = req.headers().clone();

    let max_body_size = state.pipeline.current_options().server.request.max_body_size;

    if let Some(len) = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
    {
        if len > max_body_size {
            return TitanError::new(ErrorKind::PayloadTooLarge, "request body exceeds the configured limit")
                .into_response();
        }
    }

    let body_bytes = match axum::body::to_bytes(req.into_body(), max_body_size as usize).await {
        Ok(b) => b,
        Err(_) => {
            return TitanError::new(ErrorKind::PayloadTooLarge, "request body exceeds the configured limit")
                .into_response();
        }
    };

    let body = parse_body(&headers, &body_bytes);

    pipeline::dispatch(&state.pipeline, method, pathname, raw_query.as_deref(), headers, body, state.env, state.dev_mode)
        .await
}

fn parse_body(headers: &axum::http::HeaderMap, bytes: &[u8]) -> ParsedBody {
    if bytes.is_empty() {
        return ParsedBody::Empty;
    }

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with("application/json") {
        return match serde_json::from_slice::<Value>(bytes) {
            Ok(v) => ParsedBody::Json(v),
            Err(_) => ParsedBody::Text(String::from_utf8_lossy(bytes).into_owned()),
        };
    }

    if content_type.starts_with("application/x-www-form-urlencoded") {
        let text = String::from_utf8_lossy(bytes).into_owned();
        let form: HashMap<String, String> = text
            .split('&')
            .filter(|p| !p.is_empty())
            .filter_map(|pair| {
                let mut it = pair.splitn(2, '=');
                Some((it.next()?.to_string(), it.next().unwrap_or("").to_string()))
            })
            .collect();
        return ParsedBody::Form(form);
    }

    if content_type.starts_with("text/") {
        return ParsedBody::Text(String::from_utf8_lossy(bytes).into_owned());
    }

    ParsedBody::Bytes(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdylib_extension_matches_current_platform() {
        let ext = cdylib_extension();
        assert!(["so", "dylib", "dll"].contains(&ext));
    }

    #[test]
    fn json_body_is_parsed() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_TYPE, "application/json".parse().unwrap());
        let parsed = parse_body(&headers, br#"{"a":1}"#);
        assert!(matches!(parsed, ParsedBody::Json(_)));
    }

    #[test]
    fn empty_body_is_empty() {
        let headers = axum::http::HeaderMap::new();
        assert!(matches!(parse_body(&headers, b""), ParsedBody::Empty));
    }

    #[test]
    fn form_body_is_parsed_into_pairs() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_TYPE, "application/x-www-form-urlencoded".parse().unwrap());
        let parsed = parse_body(&headers, b"a=1&b=2");
        match parsed {
            ParsedBody::Form(map) => {
                assert_eq!(map.get("a").unwrap(), "1");
                assert_eq!(map.get("b").unwrap(), "2");
            }
            _ => panic!("expected form body"),
        }
    }
}
