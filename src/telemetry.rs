//! Telemetry Fan-out (C12) — periodic stats + manifest snapshots pushed to
//! an external collaborator (the Studio UI) over a local socket.
//!
//! Telemetry is a soft dependency (§4.12): delivery failure is logged and
//! dropped, never surfaced to the request path or the build queue. Grounded
//! in the same bounded-channel-plus-background-task shape `runtime.rs` uses
//! for its async op handler, scaled down to a single 1 Hz ticker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Notify};

use crate::event_bus::{Event, EventBus};
use crate::options::Options;
use crate::pipeline::PipelineState;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Client → core messages recognized on the telemetry socket (§6).
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    GetRoutes,
    GetManifest,
    GetLithiaConfig,
    RequestImmediateStats,
    CreateRoute { path: String, method: Option<String>, env: Option<String>, file_name: String, file_path: String, code: String },
    ValidateRouteConflicts { path: String, method: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Routes { routes: Value },
    UpdateManifest { routes: Value },
    LithiaConfig { config: Value },
    ManifestUpdate { timestamp: i64 },
    LogEntry { id: String, timestamp: i64, level: String, message: String, args: Option<Value>, source: String },
    BuildStatus { success: bool, error: Option<String>, timestamp: i64 },
    BuildStats { stats: Value },
    DevServerStats { stats: Value },
    ServerStats { uptime_secs: u64, memory_bytes: u64, cpu_percent: f64 },
    RouteCreated { success: bool },
    RouteCreateError { message: String },
    RouteConflictsValidated { has_conflicts: bool, conflicts: Vec<String> },
}

struct Stats {
    started_at: Instant,
}

/// Handle to a running telemetry publisher. Dropping or calling `stop`
/// cancels the background task; the socket listener shuts down with it.
pub struct TelemetryHandle {
    shutdown: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl TelemetryHandle {
    pub async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.task.await;
    }
}

/// Start the telemetry publisher if `options.studio.enabled`. Binds a Unix
/// domain socket at `<output_root>/titan.sock`, accepts collaborator
/// connections, and pushes a `server-stats` message once per second plus a
/// `manifest-update` whenever the event bus reports `build:success`.
pub fn spawn(options: &Options, event_bus: Arc<EventBus>, pipeline: Arc<PipelineState>) -> Option<TelemetryHandle> {
    if !options.studio.enabled {
        return None;
    }

    let socket_path = std::path::PathBuf::from(&options.build.output_root).join("titan.sock");
    let _ = std::fs::remove_file(&socket_path);

    let listener = match UnixListener::bind(&socket_path) {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(error = %e, "telemetry socket bind failed; continuing without the studio collaborator");
            return None;
        }
    };

    let shutdown = Arc::new(Notify::new());
    let shutdown_for_task = shutdown.clone();
    let stats = Arc::new(Stats { started_at: Instant::now() });

    let (broadcast_tx, _) = broadcast::channel::<ServerMessage>(256);
    subscribe_build_events(&event_bus, broadcast_tx.clone());

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown_for_task.notified() => break,
                _ = ticker.tick() => {
                    let uptime = stats.started_at.elapsed().as_secs();
                    let msg = ServerMessage::ServerStats {
                        uptime_secs: uptime,
                        memory_bytes: 0,
                        cpu_percent: 0.0,
                    };
                    let _ = broadcast_tx.send(msg);
                }
                accepted = listener.accept() => {
                    if let Ok((stream, _addr)) = accepted {
                        let stats = stats.clone();
                        let pipeline = pipeline.clone();
                        let rx = broadcast_tx.subscribe();
                        tokio::spawn(handle_collaborator(stream, stats, pipeline, rx));
                    }
                }
            }
        }
        let _ = std::fs::remove_file(&socket_path);
    });

    Some(TelemetryHandle { shutdown, task })
}

fn subscribe_build_events(event_bus: &EventBus, tx: broadcast::Sender<ServerMessage>) {
    event_bus.subscribe(
        &crate::event_bus::EventKind::BuildSuccess,
        Arc::new(move |event: &Event| {
            let _ = tx.send(ServerMessage::ManifestUpdate { timestamp: event_timestamp(event) });
        }),
    );
}

fn event_timestamp(_event: &Event) -> i64 {
    0
}

/// Conflict rule (§6): a proposed `(path, method)` conflicts with any
/// existing descriptor whose match regex matches the proposed path and
/// whose method gate is absent or equals the proposed method. A proposed
/// method of `any` conflicts with any existing descriptor on the same path.
fn conflicting_routes(
    routes: &[crate::route_convention::RouteDescriptor],
    path: &str,
    method: &str,
) -> Vec<String> {
    routes
        .iter()
        .filter(|route| route.match_regex.as_ref().is_some_and(|re| re.is_match(path)))
        .filter(|route| match route.method_gate {
            None => true,
            Some(gate) => method.eq_ignore_ascii_case("any") || gate.matches(method),
        })
        .map(|route| route.source_path.clone())
        .collect()
}

/// One connected collaborator: read newline-delimited JSON client messages
/// and reply inline, while also forwarding every broadcast push (periodic
/// stats, manifest updates) onto the same socket. Failure to write is
/// logged and dropped (§4.12); it never propagates to the caller.
async fn handle_collaborator(
    stream: UnixStream,
    stats: Arc<Stats>,
    pipeline: Arc<PipelineState>,
    mut pushes: broadcast::Receiver<ServerMessage>,
) {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            pushed = pushes.recv() => {
                let Ok(msg) = pushed else { continue };
                if !write_message(&mut writer, &msg).await {
                    break;
                }
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let Ok(msg) = serde_json::from_str::<ClientMessage>(&line) else { continue };
                let reply = match msg {
                    ClientMessage::RequestImmediateStats => ServerMessage::ServerStats {
                        uptime_secs: stats.started_at.elapsed().as_secs(),
                        memory_bytes: 0,
                        cpu_percent: 0.0,
                    },
                    ClientMessage::GetRoutes | ClientMessage::GetManifest => {
                        let routes = serde_json::to_value(&*pipeline.current_routes()).unwrap_or(Value::Array(vec![]));
                        ServerMessage::Routes { routes }
                    }
                    ClientMessage::GetLithiaConfig => ServerMessage::LithiaConfig { config: Value::Null },
                    ClientMessage::ValidateRouteConflicts { path, method } => {
                        let conflicts = conflicting_routes(&pipeline.current_routes(), &path, &method);
                        ServerMessage::RouteConflictsValidated { has_conflicts: !conflicts.is_empty(), conflicts }
                    }
                    ClientMessage::CreateRoute { .. } => {
                        ServerMessage::RouteCreateError { message: "creating routes over telemetry is not supported".to_string() }
                    }
                };
                if !write_message(&mut writer, &reply).await {
                    break;
                }
            }
        }
    }
}

async fn write_message(writer: &mut (impl tokio::io::AsyncWriteExt + Unpin), msg: &ServerMessage) -> bool {
    let Ok(serialized) = serde_json::to_string(msg) else { return true };
    writer.write_all(format!("{serialized}\n").as_bytes()).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_studio_does_not_spawn() {
        let options = Options::default();
        let event_bus = Arc::new(EventBus::new());
        let pipeline = Arc::new(PipelineState::new(
            Arc::new(crate::loader::ModuleLoader::new(true)),
            Arc::new(crate::hooks::HookBus::new()),
            Options::default(),
        ));
        assert!(spawn(&options, event_bus, pipeline).is_none());
    }
}
