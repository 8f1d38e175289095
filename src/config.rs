//! Config Provider (C8) — load a config document, overlay CLI/env
//! overrides, validate, and expose a watcher producing a `Diff` on change.
//!
//! Grounded in `Aurora-energy-R-EMS`'s `r-ems-config`/`r-ems-common`: plain
//! format-specific parsing (`toml`/`serde_yaml`/`serde_json`, dispatched on
//! file extension) deserialized against `#[serde(default = ...)]`-backed
//! struct defaults rather than the `config` crate's layered builder — that
//! crate has no real usage anywhere in this codebase's lineage, so this
//! module does not depend on it. `validator` for the invariant check,
//! `serde_path_to_error` for precise failing-field paths.

use std::path::{Path, PathBuf};

use serde_json::Value;
use validator::Validate;

use crate::errors::ConfigError;
use crate::options::{is_critical_key, Command, Env, InternalOptions, Options};

/// One entry of a config reload diff: `(dotted.key, kind, oldValue, newValue)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    pub key: String,
    pub kind: DiffKind,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    Added,
    Removed,
    Changed,
}

pub type Diff = Vec<DiffEntry>;

/// CLI overrides applied on top of the file-backed document, before env.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub verbose: bool,
    pub output_root: Option<String>,
    pub no_studio: bool,
}

fn config_file_candidates(project_root: &Path) -> Vec<PathBuf> {
    ["titan.config.toml", "titan.config.yaml", "titan.config.yml", "titan.config.json"]
        .iter()
        .map(|name| project_root.join(name))
        .collect()
}

fn load_document(project_root: &Path) -> Result<Value, ConfigError> {
    for path in config_file_candidates(project_root) {
        if !path.exists() {
            continue;
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Read { path: path.display().to_string(), source: e })?;

        let parsed: Result<Value, anyhow::Error> = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&raw).map_err(anyhow::Error::from),
            Some("yaml") | Some("yml") => serde_yaml::from_str(&raw).map_err(anyhow::Error::from),
            Some("json") => serde_json::from_str(&raw).map_err(anyhow::Error::from),
            _ => Ok(Value::Object(Default::default())),
        };
        return parsed.map_err(|e| ConfigError::Parse { path: path.display().to_string(), source: e });
    }
    Ok(Value::Object(Default::default()))
}

fn deserialize_options(doc: Value) -> Result<Options, ConfigError> {
    serde_path_to_error::deserialize(doc)
        .map_err(|e| ConfigError::Invalid(format!("{} at `{}`", e, e.path())))
}

fn apply_cli_overrides(mut options: Options, overrides: &CliOverrides) -> Options {
    if let Some(port) = overrides.port {
        options.server.port = port;
    }
    if let Some(host) = &overrides.host {
        options.server.host = host.clone();
    }
    if overrides.verbose {
        options.debug = true;
    }
    if let Some(output_root) = &overrides.output_root {
        options.build.output_root = output_root.clone();
    }
    if overrides.no_studio {
        options.studio.enabled = false;
    }
    options
}

fn apply_env_overrides(mut options: Options) -> Options {
    if let Ok(port) = std::env::var("PORT") {
        if let Ok(port) = port.parse() {
            options.server.port = port;
        }
    }
    if let Ok(host) = std::env::var("HOST") {
        options.server.host = host;
    }
    options
}

fn validate(options: &Options) -> Result<(), ConfigError> {
    options.validate().map_err(|e| ConfigError::Invalid(e.to_string()))
}

/// Load, merge-over-defaults, validate. Fail-fast with a precise field path
/// on a load-time error (§7).
pub fn load(
    project_root: &Path,
    overrides: &CliOverrides,
    command: Command,
    env: Env,
) -> Result<Options, ConfigError> {
    let doc = load_document(project_root)?;
    let merged = merge_over_defaults(doc)?;
    let mut options = deserialize_options(merged)?;
    options = apply_cli_overrides(options, overrides);
    options = apply_env_overrides(options);
    options.internal = Some(InternalOptions { command, env });
    validate(&options)?;
    Ok(options)
}

/// Deep-merge the user document over `Options::default()`'s JSON
/// representation, one field at a time, replacing §9's "deep ad-hoc merge
/// of defaults with user config" with an explicit, type-checked overlay.
fn merge_over_defaults(user: Value) -> Result<Value, ConfigError> {
    let defaults = serde_json::to_value(Options::default())
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    Ok(merge_json(defaults, user))
}

fn merge_json(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Compute the diff between two option snapshots by comparing their JSON
/// representations at every leaf, dotted-key style.
pub fn diff(old: &Options, new: &Options) -> Diff {
    let old_json = serde_json::to_value(old).unwrap_or(Value::Null);
    let new_json = serde_json::to_value(new).unwrap_or(Value::Null);
    let mut entries = Vec::new();
    diff_json("", &old_json, &new_json, &mut entries);
    entries
}

fn diff_json(prefix: &str, old: &Value, new: &Value, out: &mut Vec<DiffEntry>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, old_value) in old_map {
                let dotted = dotted(prefix, key);
                match new_map.get(key) {
                    Some(new_value) => diff_json(&dotted, old_value, new_value, out),
                    None => out.push(DiffEntry {
                        key: dotted,
                        kind: DiffKind::Removed,
                        old_value: Some(old_value.clone()),
                        new_value: None,
                    }),
                }
            }
            for (key, new_value) in new_map {
                if !old_map.contains_key(key) {
                    out.push(DiffEntry {
                        key: dotted(prefix, key),
                        kind: DiffKind::Added,
                        old_value: None,
                        new_value: Some(new_value.clone()),
                    });
                }
            }
        }
        (old, new) if old != new => {
            out.push(DiffEntry {
                key: prefix.to_string(),
                kind: DiffKind::Changed,
                old_value: Some(old.clone()),
                new_value: Some(new.clone()),
            });
        }
        _ => {}
    }
}

fn dotted(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Whether a diff contains any critical key (`server.port`, `server.host`,
/// `studio.enabled`), which forces a full restart instead of a soft apply.
pub fn has_critical_change(d: &Diff) -> bool {
    d.iter().any(|entry| is_critical_key(&entry.key))
}
