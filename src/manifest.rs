//! Manifest Store (C4) — atomically publish the compiled route table as
//! `routes.json` under the output root.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::BuildError;
use crate::route_convention::{rehydrate, RouteDescriptor};

const MANIFEST_FILE_NAME: &str = "routes.json";

#[derive(Serialize, Deserialize)]
struct ManifestEntry {
    method: Option<String>,
    env: Option<String>,
    path: String,
    dynamic: bool,
    #[serde(rename = "filePath")]
    file_path: String,
    #[serde(rename = "sourceFilePath")]
    source_file_path: String,
    regex: String,
}

/// Compute a stable hash over `(method, pathTemplate, sourcePath)` triples,
/// sorted — descriptors are already sorted by `pathTemplate` (P1), so this
/// is stable across permutations of the input file set.
pub fn hash_route_table(descriptors: &[RouteDescriptor]) -> String {
    let mut hasher = Sha256::new();
    for d in descriptors {
        let method = d.method_gate.map(|m| m.as_str()).unwrap_or("*");
        hasher.update(method.as_bytes());
        hasher.update(b"\0");
        hasher.update(d.path_template.as_bytes());
        hasher.update(b"\0");
        hasher.update(d.source_path.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn manifest_path(output_root: &Path) -> std::path::PathBuf {
    output_root.join(MANIFEST_FILE_NAME)
}

/// Read the previously published hash by re-hashing the on-disk manifest,
/// if present. Returns `None` if the manifest does not exist or is corrupt.
async fn previous_hash(output_root: &Path) -> Option<(String, Vec<RouteDescriptor>)> {
    let path = manifest_path(output_root);
    let raw = tokio::fs::read_to_string(&path).await.ok()?;
    let entries: Vec<ManifestEntry> = serde_json::from_str(&raw).ok()?;
    let descriptors: Vec<RouteDescriptor> = entries
        .into_iter()
        .map(|e| {
            let mut d = RouteDescriptor {
                path_template: e.path,
                method_gate: e.method.as_deref().and_then(parse_method),
                env_gate: e.env.as_deref().and_then(parse_env),
                dynamic: e.dynamic,
                match_regex: None,
                regex_pattern: e.regex,
                source_path: e.source_file_path,
                output_path: e.file_path,
            };
            rehydrate(&mut d);
            d
        })
        .collect();
    let hash = hash_route_table(&descriptors);
    Some((hash, descriptors))
}

fn parse_method(s: &str) -> Option<crate::route_convention::MethodGate> {
    use crate::route_convention::MethodGate::*;
    Some(match s {
        "CONNECT" => Connect,
        "DELETE" => Delete,
        "GET" => Get,
        "HEAD" => Head,
        "OPTIONS" => Options,
        "PATCH" => Patch,
        "POST" => Post,
        "PUT" => Put,
        "TRACE" => Trace,
        _ => return None,
    })
}

fn parse_env(s: &str) -> Option<crate::route_convention::EnvGate> {
    use crate::route_convention::EnvGate::*;
    match s {
        "dev" => Some(Dev),
        "prod" => Some(Prod),
        _ => None,
    }
}

/// Publish the route table. Returns `true` if a new manifest was written,
/// `false` if the write was skipped because the hash was unchanged.
pub async fn publish(output_root: &Path, descriptors: &[RouteDescriptor]) -> Result<bool, BuildError> {
    let new_hash = hash_route_table(descriptors);
    let path = manifest_path(output_root);

    if path.exists() {
        if let Some((old_hash, _)) = previous_hash(output_root).await {
            if old_hash == new_hash {
                return Ok(false);
            }
        }
    }

    let entries: Vec<ManifestEntry> = descriptors
        .iter()
        .map(|d| ManifestEntry {
            method: d.method_gate.map(|m| m.as_str().to_string()),
            env: d.env_gate.map(|e| e.as_str().to_string()),
            path: d.path_template.clone(),
            dynamic: d.dynamic,
            file_path: d.output_path.clone(),
            source_file_path: d.source_path.clone(),
            regex: d.regex_pattern.clone(),
        })
        .collect();

    let serialized = serde_json::to_string_pretty(&entries).map_err(|e| {
        BuildError::Manifest(std::io::Error::new(std::io::ErrorKind::Other, e))
    })?;

    tokio::fs::create_dir_all(output_root).await?;
    let tmp_path = output_root.join(format!("{MANIFEST_FILE_NAME}.tmp"));
    tokio::fs::write(&tmp_path, serialized).await?;
    tokio::fs::rename(&tmp_path, &path).await?;
    Ok(true)
}

/// Read the currently published route table. Readers treat this as
/// authoritative; caching it in memory is left to the caller (C5/C6).
pub async fn read(output_root: &Path) -> Result<Vec<RouteDescriptor>, BuildError> {
    let path = manifest_path(output_root);
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BuildError::Manifest(e)),
    };
    let entries: Vec<ManifestEntry> = serde_json::from_str(&raw).map_err(|e| {
        BuildError::Manifest(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    Ok(entries
        .into_iter()
        .map(|e| {
            let mut d = RouteDescriptor {
                path_template: e.path,
                method_gate: e.method.as_deref().and_then(parse_method),
                env_gate: e.env.as_deref().and_then(parse_env),
                dynamic: e.dynamic,
                match_regex: None,
                regex_pattern: e.regex,
                source_path: e.source_file_path,
                output_path: e.file_path,
            };
            rehydrate(&mut d);
            d
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route_convention::convert;
    use std::path::Path as StdPath;

    fn sample() -> Vec<RouteDescriptor> {
        vec![convert(StdPath::new("hello.get.rs"), "/src/hello.rs".into(), "/out/hello.so".into(), "")]
    }

    #[tokio::test]
    async fn publish_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let wrote = publish(dir.path(), &sample()).await.unwrap();
        assert!(wrote);

        let read_back = read(dir.path()).await.unwrap();
        assert_eq!(read_back.len(), 1);
        assert_eq!(read_back[0].path_template, "/hello");
        assert!(read_back[0].match_regex.is_some());
    }

    #[tokio::test]
    async fn unchanged_hash_skips_write() {
        let dir = tempfile::tempdir().unwrap();
        publish(dir.path(), &sample()).await.unwrap();
        let wrote_again = publish(dir.path(), &sample()).await.unwrap();
        assert!(!wrote_again);
    }

    #[tokio::test]
    async fn missing_manifest_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let result = read(dir.path()).await.unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn hash_is_stable_under_permutation() {
        let mut a = sample();
        a.push(convert(StdPath::new("bye.get.rs"), "/src/bye.rs".into(), "/out/bye.so".into(), ""));
        let mut b = a.clone();
        b.sort_by(|x, y| y.path_template.cmp(&x.path_template));
        b.sort_by(|x, y| x.path_template.cmp(&y.path_template));
        assert_eq!(hash_route_table(&a), hash_route_table(&b));
    }
}
