//! User configuration merged over built-in defaults (§3 Options).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    Dev,
    Prod,
}

impl Env {
    pub fn as_str(self) -> &'static str {
        match self {
            Env::Dev => "dev",
            Env::Prod => "prod",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Dev,
    Build,
    Start,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRequestQueryParser {
    #[serde(default)]
    pub array: QueryArrayOptions,
    #[serde(default)]
    pub number: QueryToggle,
    #[serde(default)]
    pub boolean: QueryToggle,
}

impl Default for ServerRequestQueryParser {
    fn default() -> Self {
        ServerRequestQueryParser {
            array: QueryArrayOptions::default(),
            number: QueryToggle { enabled: true },
            boolean: QueryToggle { enabled: true },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryArrayOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_array_delimiter")]
    pub delimiter: String,
}

fn default_array_delimiter() -> String {
    ",".to_string()
}

impl Default for QueryArrayOptions {
    fn default() -> Self {
        QueryArrayOptions { enabled: false, delimiter: default_array_delimiter() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryToggle {
    pub enabled: bool,
}

impl Default for QueryToggle {
    fn default() -> Self {
        QueryToggle { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRequestOptions {
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u64,
    #[serde(default)]
    pub query_parser: ServerRequestQueryParser,
}

fn default_max_body_size() -> u64 {
    1024 * 1024 // 1 MiB
}

impl Default for ServerRequestOptions {
    fn default() -> Self {
        ServerRequestOptions {
            max_body_size: default_max_body_size(),
            query_parser: ServerRequestQueryParser::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, validator::Validate)]
pub struct ServerOptions {
    #[serde(default = "default_host")]
    pub host: String,
    /// §4.8: `server.port` ∈ [1, 65535].
    #[serde(default = "default_port")]
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
    #[serde(default)]
    pub request: ServerRequestOptions,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions { host: default_host(), port: default_port(), request: ServerRequestOptions::default() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOptions {
    #[serde(default = "default_builder")]
    pub builder: String,
    #[serde(default = "default_source_root")]
    pub source_root: String,
    #[serde(default = "default_routes_subtree")]
    pub routes_subtree: String,
    #[serde(default = "default_output_root")]
    pub output_root: String,
    #[serde(default)]
    pub global_prefix: String,
}

fn default_builder() -> String {
    "rustc".to_string()
}
fn default_source_root() -> String {
    "src".to_string()
}
fn default_routes_subtree() -> String {
    "src/routes".to_string()
}
fn default_output_root() -> String {
    ".lithia".to_string()
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            builder: default_builder(),
            source_root: default_source_root(),
            routes_subtree: default_routes_subtree(),
            output_root: default_output_root(),
            global_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudioOptions {
    #[serde(default)]
    pub enabled: bool,
}

/// Internal fields set by the entry point, not by user config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalOptions {
    pub command: Command,
    pub env: Env,
}

#[derive(Debug, Clone, Serialize, Deserialize, validator::Validate)]
pub struct Options {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerOptions,
    #[serde(default)]
    pub cors: CorsOptions,
    #[serde(default)]
    pub build: BuildOptions,
    #[serde(default)]
    pub studio: StudioOptions,
    /// Declarative hook registrations, left as opaque JSON; the orchestrator
    /// rebuilds the hook container from scratch whenever this diffs.
    #[serde(default)]
    pub hooks: Value,
    #[serde(skip)]
    pub internal: Option<InternalOptions>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            debug: false,
            server: ServerOptions::default(),
            cors: CorsOptions::default(),
            build: BuildOptions::default(),
            studio: StudioOptions::default(),
            hooks: Value::Object(Default::default()),
            internal: None,
        }
    }
}

/// The set of config keys whose change during `Running` forces a full
/// restart rather than a soft apply (§4.10).
pub const CRITICAL_KEYS: [&str; 3] = ["server.port", "server.host", "studio.enabled"];

pub fn is_critical_key(dotted: &str) -> bool {
    CRITICAL_KEYS.contains(&dotted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let o = Options::default();
        assert_eq!(o.server.port, 3000);
        assert_eq!(o.build.output_root, ".lithia");
        assert!(!o.studio.enabled);
    }

    #[test]
    fn critical_key_detection() {
        assert!(is_critical_key("server.port"));
        assert!(is_critical_key("studio.enabled"));
        assert!(!is_critical_key("debug"));
    }
}
