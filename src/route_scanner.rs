//! Route Scanner (C2) — walk the routes root, select source files, convert
//! each through C1, return descriptors sorted by `pathTemplate`.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::errors::BuildError;
use crate::route_convention::{convert, RouteDescriptor};

const SOURCE_EXT: &str = "rs";

fn is_excluded(file_stem: &str) -> bool {
    file_stem.contains(".spec.") || file_stem.contains(".test.")
        || file_stem.ends_with(".spec")
        || file_stem.ends_with(".test")
}

/// Compute `outputRoot ⊕ (sourcePath ⊖ sourceRoot)` with the compiled
/// extension substituted for the source extension.
pub fn output_path_for(
    source_path: &Path,
    routes_root: &Path,
    output_root: &Path,
    output_ext: &str,
) -> PathBuf {
    let relative = source_path.strip_prefix(routes_root).unwrap_or(source_path);
    output_root.join(relative).with_extension(output_ext)
}

/// Walk `routes_root` and return `(sourcePath, relativePath)` pairs for
/// every eligible file, in directory-walk order (unsorted).
fn collect_source_files(routes_root: &Path) -> Result<Vec<(PathBuf, PathBuf)>, BuildError> {
    if !routes_root.exists() {
        // Fresh project with no routes yet: not a failure.
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    for entry in WalkDir::new(routes_root) {
        let entry = entry.map_err(|e| BuildError::Scan(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SOURCE_EXT) {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        if is_excluded(stem) {
            continue;
        }
        let relative = path.strip_prefix(routes_root).unwrap_or(path).to_path_buf();
        out.push((path.to_path_buf(), relative));
    }
    Ok(out)
}

/// Scan `routes_root`, producing descriptors sorted by `pathTemplate`
/// ascending — the order is part of the wire contract with the UI
/// collaborator (P1: permuting the file set must not change the result).
pub fn scan(
    routes_root: &Path,
    output_root: &Path,
    output_ext: &str,
    global_prefix: &str,
) -> Result<Vec<RouteDescriptor>, BuildError> {
    let files = collect_source_files(routes_root)?;

    let mut descriptors: Vec<RouteDescriptor> = files
        .into_iter()
        .map(|(source_path, relative)| {
            let output_path = output_path_for(&source_path, routes_root, output_root, output_ext);
            convert(
                &relative,
                source_path.to_string_lossy().into_owned(),
                output_path.to_string_lossy().into_owned(),
                global_prefix,
            )
        })
        .collect();

    descriptors.sort_by(|a, b| a.path_template.cmp(&b.path_template));
    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn missing_routes_root_is_empty_not_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let result = scan(&missing, &dir.path().join("out"), "so", "").unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn excludes_spec_and_test_files() {
        let dir = tempdir().unwrap();
        let routes = dir.path().join("routes");
        fs::create_dir_all(&routes).unwrap();
        fs::write(routes.join("hello.get.rs"), "").unwrap();
        fs::write(routes.join("hello.spec.rs"), "").unwrap();
        fs::write(routes.join("hello.test.rs"), "").unwrap();

        let result = scan(&routes, &dir.path().join("out"), "so", "").unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].path_template, "/hello");
    }

    #[test]
    fn sorted_ascending_regardless_of_walk_order() {
        let dir = tempdir().unwrap();
        let routes = dir.path().join("routes");
        fs::create_dir_all(&routes).unwrap();
        fs::write(routes.join("zeta.get.rs"), "").unwrap();
        fs::write(routes.join("alpha.get.rs"), "").unwrap();
        fs::write(routes.join("mid.get.rs"), "").unwrap();

        let result = scan(&routes, &dir.path().join("out"), "so", "").unwrap();
        let paths: Vec<_> = result.iter().map(|d| d.path_template.clone()).collect();
        assert_eq!(paths, vec!["/alpha", "/mid", "/zeta"]);
    }
}
