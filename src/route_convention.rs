//! Route Convention (C1) — turn a file path under the routes root into a
//! `RouteDescriptor`: method gate, env gate, path template and a derived
//! match regex.
//!
//! Filename grammar: `<segments><.method>?<.env>?.<ext>`. Segment
//! transforms: `(group)/` deleted, `[...name]` → `**:name`, `[...]` → `**`,
//! `[name]` → `:name`, trailing `/index` → `/`.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

const METHODS: &[&str] = &[
    "connect", "delete", "get", "head", "options", "patch", "post", "put", "trace",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodGate {
    Connect,
    Delete,
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
    Trace,
}

impl MethodGate {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "connect" => MethodGate::Connect,
            "delete" => MethodGate::Delete,
            "get" => MethodGate::Get,
            "head" => MethodGate::Head,
            "options" => MethodGate::Options,
            "patch" => MethodGate::Patch,
            "post" => MethodGate::Post,
            "put" => MethodGate::Put,
            "trace" => MethodGate::Trace,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MethodGate::Connect => "CONNECT",
            MethodGate::Delete => "DELETE",
            MethodGate::Get => "GET",
            MethodGate::Head => "HEAD",
            MethodGate::Options => "OPTIONS",
            MethodGate::Patch => "PATCH",
            MethodGate::Post => "POST",
            MethodGate::Put => "PUT",
            MethodGate::Trace => "TRACE",
        }
    }

    pub fn matches(self, method: &str) -> bool {
        self.as_str().eq_ignore_ascii_case(method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvGate {
    Dev,
    Prod,
}

impl EnvGate {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "dev" => Some(EnvGate::Dev),
            "prod" => Some(EnvGate::Prod),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnvGate::Dev => "dev",
            EnvGate::Prod => "prod",
        }
    }
}

/// Produced by C1+C2, consumed by everything downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDescriptor {
    pub path_template: String,
    pub method_gate: Option<MethodGate>,
    pub env_gate: Option<EnvGate>,
    pub dynamic: bool,
    #[serde(skip)]
    pub match_regex: Option<Regex>,
    pub regex_pattern: String,
    pub source_path: String,
    pub output_path: String,
}

impl RouteDescriptor {
    /// Re-run the match regex, returning captures bound to the named
    /// dynamic segments in `path_template`, in declaration order.
    pub fn capture_params(&self, pathname: &str) -> Option<Vec<(String, String)>> {
        let re = self.match_regex.as_ref()?;
        let caps = re.captures(pathname)?;
        let names = dynamic_segment_names(&self.path_template);
        let mut out = Vec::with_capacity(names.len());
        for (i, name) in names.into_iter().enumerate() {
            if let Some(m) = caps.get(i + 1) {
                out.push((name, m.as_str().to_string()));
            }
        }
        Some(out)
    }
}

fn dynamic_segment_names(path_template: &str) -> Vec<String> {
    let mut names = Vec::new();
    for segment in path_template.split('/') {
        if let Some(rest) = segment.strip_prefix("**:") {
            names.push(rest.to_string());
        } else if segment == "**" {
            names.push("*".to_string());
        } else if let Some(rest) = segment.strip_prefix(':') {
            names.push(rest.to_string());
        }
    }
    names
}

/// Peel `.method` / `.env` suffixes off a stem (filename without extension),
/// right to left, returning `(remaining_stem, method_gate, env_gate)`.
fn peel_suffixes(stem: &str) -> (&str, Option<MethodGate>, Option<EnvGate>) {
    let mut rest = stem;
    let mut method_gate = None;
    let mut env_gate = None;

    // Up to two suffixes, in either order, but by convention method precedes
    // env in the filename: `name.method.env`. Peel from the right.
    for _ in 0..2 {
        if let Some(idx) = rest.rfind('.') {
            let candidate = &rest[idx + 1..];
            let lower = candidate.to_ascii_lowercase();
            if env_gate.is_none() && EnvGate::parse(&lower).is_some() {
                env_gate = EnvGate::parse(&lower);
                rest = &rest[..idx];
                continue;
            }
            if method_gate.is_none() && METHODS.contains(&lower.as_str()) {
                method_gate = MethodGate::parse(&lower);
                rest = &rest[..idx];
                continue;
            }
        }
        break;
    }

    (rest, method_gate, env_gate)
}

/// Apply the segment transforms described in §4.1 to a slash-joined path
/// (suffixes already peeled, extension already stripped).
fn transform_segments(raw: &str, global_prefix: &str) -> String {
    let normalized = raw.replace('\\', "/");
    let mut segments: Vec<String> = Vec::new();

    for seg in normalized.split('/') {
        if seg.is_empty() {
            continue;
        }
        if seg.starts_with('(') && seg.ends_with(')') {
            // optional grouping folder, no URL effect
            continue;
        }
        if let Some(inner) = seg.strip_prefix("[...").and_then(|s| s.strip_suffix(']')) {
            if inner.is_empty() {
                segments.push("**".to_string());
            } else {
                segments.push(format!("**:{inner}"));
            }
            continue;
        }
        if let Some(inner) = seg.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            segments.push(format!(":{inner}"));
            continue;
        }
        segments.push(seg.to_string());
    }

    // trailing /index → /
    if segments.last().map(|s| s.as_str()) == Some("index") {
        segments.pop();
    }

    let mut path = segments.join("/");
    if !global_prefix.is_empty() {
        let prefix = global_prefix.trim_matches('/');
        path = if path.is_empty() { prefix.to_string() } else { format!("{prefix}/{path}") };
    }

    let mut full = format!("/{}", path.trim_start_matches('/'));
    while full.len() > 1 && full.ends_with('/') {
        full.pop();
    }
    full
}

/// Derive an anchored regex from a path template: `**:name`/`**` become a
/// greedy capture, `:name` becomes `([^/]+)`, everything else is escaped.
fn derive_regex(path_template: &str) -> Regex {
    let mut pattern = String::from("^");
    let segments: Vec<&str> = path_template.split('/').filter(|s| !s.is_empty()).collect();

    if segments.is_empty() {
        pattern.push_str("/$");
        return Regex::new(&pattern).expect("static pattern compiles");
    }

    for seg in &segments {
        pattern.push('/');
        if seg.starts_with("**") {
            pattern.push_str("(.*)");
        } else if seg.starts_with(':') {
            pattern.push_str("([^/]+)");
        } else {
            pattern.push_str(&regex::escape(seg));
        }
    }
    pattern.push('$');
    Regex::new(&pattern).expect("derived pattern compiles")
}

/// Convert one source file (relative to the routes root) into a
/// `RouteDescriptor`. `source_path`/`output_path` are absolute paths chosen
/// by the caller (C2/C3); this function only derives the route shape.
pub fn convert(
    relative_path: &Path,
    source_path: String,
    output_path: String,
    global_prefix: &str,
) -> RouteDescriptor {
    let file_name = relative_path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let parent = relative_path.parent().and_then(|p| p.to_str()).unwrap_or("");

    let (stem, method_gate, env_gate) = peel_suffixes(file_name);

    let raw = if parent.is_empty() {
        stem.to_string()
    } else {
        format!("{parent}/{stem}")
    };

    let path_template = transform_segments(&raw, global_prefix);
    let dynamic = path_template.split('/').any(|s| s.starts_with(':') || s.starts_with("**"));
    let regex = derive_regex(&path_template);
    let regex_pattern = regex.as_str().to_string();

    RouteDescriptor {
        path_template,
        method_gate,
        env_gate,
        dynamic,
        match_regex: Some(regex),
        regex_pattern,
        source_path,
        output_path,
    }
}

/// Recompile the `match_regex` from `regex_pattern` after deserializing a
/// descriptor read back from the manifest (regex itself is not serialized).
pub fn rehydrate(descriptor: &mut RouteDescriptor) {
    if descriptor.match_regex.is_none() {
        descriptor.match_regex = Regex::new(&descriptor.regex_pattern).ok();
    }
}
