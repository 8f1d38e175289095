//! Route Compiler (C3) — compile one or many route source files to output
//! artifacts, with a persisted, mtime-keyed cache to skip unchanged files.
//!
//! The compiler shells out to a configurable builder backend (`rustc` by
//! default, naming a `cdylib`-capable compiler invocation — see
//! `options.build.builder`). Which backend is used is a policy choice and
//! does not affect any other component (§9 design notes).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::errors::BuildError;
use crate::route_convention::RouteDescriptor;

const CACHE_FILE_NAME: &str = "swc-cache.json";
const MAX_BATCH_SIZE: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompilationCache {
    /// `sourcePath -> (contentModTimeMs, outputPath)`, serialized as the
    /// on-disk `{ "timestamps": [[path, mtimeMs], ...], "lastUpdated": ms }`
    /// shape from §6.
    #[serde(skip)]
    entries: HashMap<String, CacheEntry>,
    #[serde(rename = "lastUpdated")]
    last_updated_ms: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    content_mod_time_ms: u64,
    output_path: String,
}

#[derive(Serialize, Deserialize)]
struct OnDiskCache {
    timestamps: Vec<(String, u64)>,
    #[serde(rename = "lastUpdated")]
    last_updated: u64,
    #[serde(rename = "outputs", default)]
    outputs: HashMap<String, String>,
}

impl CompilationCache {
    fn cache_path(output_root: &Path) -> PathBuf {
        output_root.join(CACHE_FILE_NAME)
    }

    /// Best-effort load; a missing or corrupt cache is treated as empty.
    pub async fn load(output_root: &Path) -> Self {
        let path = Self::cache_path(output_root);
        let Ok(raw) = tokio::fs::read_to_string(&path).await else {
            return Self::default();
        };
        let Ok(on_disk) = serde_json::from_str::<OnDiskCache>(&raw) else {
            return Self::default();
        };
        let mut entries = HashMap::new();
        for (source_path, mtime) in on_disk.timestamps {
            let output_path = on_disk.outputs.get(&source_path).cloned().unwrap_or_default();
            entries.insert(source_path, CacheEntry { content_mod_time_ms: mtime, output_path });
        }
        CompilationCache { entries, last_updated_ms: on_disk.last_updated }
    }

    fn should_skip(&self, source_path: &str, mtime_ms: u64, output_path: &Path) -> bool {
        match self.entries.get(source_path) {
            Some(entry) => entry.content_mod_time_ms == mtime_ms && output_path.exists(),
            None => false,
        }
    }

    fn record(&mut self, source_path: String, mtime_ms: u64, output_path: String) {
        self.entries.insert(source_path, CacheEntry { content_mod_time_ms: mtime_ms, output_path });
    }

    /// Persist atomically: write to a temp file in the same directory, then
    /// rename over the target.
    pub async fn persist(&mut self, output_root: &Path, now_ms: u64) -> Result<(), BuildError> {
        self.last_updated_ms = now_ms;
        let on_disk = OnDiskCache {
            timestamps: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.content_mod_time_ms))
                .collect(),
            last_updated: self.last_updated_ms,
            outputs: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.output_path.clone()))
                .collect(),
        };
        let serialized = serde_json::to_string_pretty(&on_disk).map_err(|e| {
            BuildError::Manifest(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;

        tokio::fs::create_dir_all(output_root).await?;
        let final_path = Self::cache_path(output_root);
        let tmp_path = output_root.join(format!("{CACHE_FILE_NAME}.tmp-{now_ms}"));
        tokio::fs::write(&tmp_path, serialized).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }
}

fn mtime_ms(path: &Path) -> Option<u64> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let dur = modified.duration_since(SystemTime::UNIX_EPOCH).ok()?;
    Some(dur.as_millis() as u64)
}

/// Batch size per §4.3 step 6: `min(max(1, N/4), 20)`.
fn batch_size(n: usize) -> usize {
    std::cmp::min(std::cmp::max(1, n / 4), MAX_BATCH_SIZE)
}

async fn compile_one(builder: &str, source_path: &Path, output_path: &Path) -> Result<(), BuildError> {
    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| BuildError::Compile {
            path: source_path.display().to_string(),
            source: e.into(),
        })?;
    }

    let tmp_output = output_path.with_extension("tmp-out");
    let status = Command::new(builder)
        .arg("--crate-type")
        .arg("cdylib")
        .arg("-o")
        .arg(&tmp_output)
        .arg(source_path)
        .status()
        .await
        .map_err(|e| BuildError::Compile { path: source_path.display().to_string(), source: e.into() })?;

    if !status.success() {
        return Err(BuildError::Compile {
            path: source_path.display().to_string(),
            source: anyhow::anyhow!("builder `{builder}` exited with {status}"),
        });
    }

    tokio::fs::rename(&tmp_output, output_path).await.map_err(|e| BuildError::Compile {
        path: source_path.display().to_string(),
        source: e.into(),
    })?;
    Ok(())
}

/// Compile the given descriptors' source files (full set, or a single file
/// in incremental mode), skipping any whose cache entry is still fresh.
/// Returns the updated cache; never fails partially — on any file failure
/// the batch boundary aborts and the whole call returns that error, leaving
/// already-succeeded files' cache entries intact (P3: re-running the same
/// set converges to the same output).
pub async fn compile(
    builder: &str,
    mut cache: CompilationCache,
    output_root: &Path,
    descriptors: &[RouteDescriptor],
    now_ms: u64,
) -> Result<CompilationCache, BuildError> {
    let mut to_compile = Vec::new();
    for d in descriptors {
        let source_path = PathBuf::from(&d.source_path);
        let output_path = PathBuf::from(&d.output_path);
        let Some(mtime) = mtime_ms(&source_path) else {
            continue;
        };
        if cache.should_skip(&d.source_path, mtime, &output_path) {
            continue;
        }
        to_compile.push((d.source_path.clone(), source_path, output_path, mtime));
    }

    if to_compile.is_empty() {
        return Ok(cache);
    }

    let size = batch_size(to_compile.len());
    for batch in to_compile.chunks(size) {
        let mut handles = Vec::with_capacity(batch.len());
        for (source_key, source_path, output_path, mtime) in batch.iter().cloned() {
            let builder = builder.to_string();
            handles.push(tokio::spawn(async move {
                let result = compile_one(&builder, &source_path, &output_path).await;
                (source_key, output_path, mtime, result)
            }));
        }

        for handle in handles {
            let (source_key, output_path, mtime, result) = handle
                .await
                .map_err(|e| BuildError::Compile { path: "<join>".into(), source: e.into() })?;
            result?;
            cache.record(source_key, mtime, output_path.to_string_lossy().into_owned());
        }
    }

    cache.persist(output_root, now_ms).await?;
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_bounds() {
        assert_eq!(batch_size(1), 1);
        assert_eq!(batch_size(3), 1);
        assert_eq!(batch_size(8), 2);
        assert_eq!(batch_size(1000), 20);
    }

    #[tokio::test]
    async fn cache_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CompilationCache::default();
        cache.record("/src/hello.rs".into(), 42, "/out/hello.so".into());
        cache.persist(dir.path(), 1000).await.unwrap();

        let loaded = CompilationCache::load(dir.path()).await;
        assert!(loaded.should_skip("/src/hello.rs", 42, Path::new("/nonexistent")).eq(&false));
        assert_eq!(loaded.entries.get("/src/hello.rs").unwrap().content_mod_time_ms, 42);
    }

    #[tokio::test]
    async fn missing_cache_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = CompilationCache::load(dir.path()).await;
        assert!(loaded.entries.is_empty());
    }
}
