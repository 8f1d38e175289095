//! Module Loader (C5) — load a compiled route module's exported handler
//! (and optional middlewares/metadata) from its output artifact.
//!
//! Route modules are `cdylib` shared libraries exposing a small JSON-over-FFI
//! function table, loaded with `libloading`. This is the same pattern the
//! teacher codebase uses for its `.ext`/`titan.json` native-extension
//! loader: a manifest-described dynamic library with interned C-ABI entry
//! points, just generalized from "native functions" to "route modules."
//! The nominal capability check replaces reflecting over a loaded value's
//! shape: a library either exports `titan_route_handler` with the expected
//! signature, or loading fails with `LoadError`.

use std::ffi::{c_char, CStr, CString};
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use libloading::{Library, Symbol};
use serde_json::Value;

use crate::errors::LoadError;

type HandlerFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;
type FreeFn = unsafe extern "C" fn(*mut c_char);
type ListFn = unsafe extern "C" fn() -> *mut c_char;

const HANDLER_SYMBOL: &[u8] = b"titan_route_handler";
const MIDDLEWARES_SYMBOL: &[u8] = b"titan_route_middlewares";
const METADATA_SYMBOL: &[u8] = b"titan_route_metadata";
const FREE_SYMBOL: &[u8] = b"titan_free_string";

/// A loaded route module's capability surface. The `handler` and optional
/// `middlewares` are invoked by passing a JSON request envelope across the
/// FFI boundary and parsing the JSON response written back.
pub struct LoadedModule {
    _library: Library,
    handler: HandlerFn,
    free: FreeFn,
    middleware_names: Vec<String>,
    pub metadata: Option<Value>,
}

// SAFETY: the underlying `Library` keeps the code mapped for the process
// lifetime or until explicitly dropped; we never unload while callers hold
// a `LoadedModule`, and the exported functions are plain `extern "C" fn`.
unsafe impl Send for LoadedModule {}
unsafe impl Sync for LoadedModule {}

impl LoadedModule {
    /// Call the handler with a JSON request envelope, returning the parsed
    /// JSON response. Raises `LoadError::IncompatibleSignature` only when
    /// the handler's own output is not valid JSON, which never happens for
    /// conformant modules — any other failure surfaces through the
    /// response envelope's own `_isResponse`/`error` convention.
    pub fn call_handler(&self, request: &Value) -> Result<Value, LoadError> {
        self.invoke(self.handler, request)
    }

    pub fn middleware_names(&self) -> &[String] {
        &self.middleware_names
    }

    /// Call a named export (`titan_mw_<name>`) with the same JSON-over-FFI
    /// contract as the handler. Used to invoke a module's declared route
    /// middlewares by name.
    pub fn call_named(&self, name: &str, request: &Value) -> Result<Value, LoadError> {
        let symbol_name = format!("titan_mw_{name}");
        let f: HandlerFn = unsafe {
            *self
                ._library
                .get::<HandlerFn>(symbol_name.as_bytes())
                .map_err(|_| LoadError::MissingHandler(name.to_string()))?
        };
        self.invoke(f, request)
    }

    fn invoke(&self, f: HandlerFn, request: &Value) -> Result<Value, LoadError> {
        let input = CString::new(request.to_string()).expect("JSON has no interior NUL");
        // SAFETY: `f` was resolved from the library and matches the
        // documented `titan_route_handler` signature; `free` releases the
        // string the callee allocated with its own allocator.
        let raw = unsafe { f(input.as_ptr()) };
        if raw.is_null() {
            return Err(LoadError::IncompatibleSignature("<handler>".to_string()));
        }
        let out = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        unsafe { (self.free)(raw) };
        serde_json::from_str(&out).map_err(|_| LoadError::IncompatibleSignature("<handler>".to_string()))
    }
}

fn open_module(path: &Path) -> Result<LoadedModule, LoadError> {
    if !path.exists() {
        return Err(LoadError::NotFound(path.display().to_string()));
    }

    // SAFETY: the library is produced by our own compiler backend (C3) from
    // route sources under our control; loading it runs its static
    // initializers, which is the standard `libloading` contract.
    let library = unsafe { Library::new(path) }
        .map_err(|e| LoadError::Open { path: path.display().to_string(), source: e })?;

    let handler: HandlerFn = unsafe {
        *library
            .get::<HandlerFn>(HANDLER_SYMBOL)
            .map_err(|_| LoadError::MissingHandler(path.display().to_string()))?
    };
    let free: FreeFn = unsafe {
        *library
            .get::<FreeFn>(FREE_SYMBOL)
            .map_err(|_| LoadError::MissingHandler(path.display().to_string()))?
    };

    let middleware_names = unsafe {
        library
            .get::<ListFn>(MIDDLEWARES_SYMBOL)
            .ok()
            .and_then(|sym: Symbol<ListFn>| read_json_list(&library, *sym, free))
            .unwrap_or_default()
    };

    let metadata = unsafe {
        library
            .get::<ListFn>(METADATA_SYMBOL)
            .ok()
            .and_then(|sym: Symbol<ListFn>| read_json_value(&library, *sym, free))
    };

    Ok(LoadedModule { _library: library, handler, free, middleware_names, metadata })
}

fn read_json_list(_library: &Library, f: ListFn, free: FreeFn) -> Option<Vec<String>> {
    read_json_value_raw(f, free).and_then(|v| {
        v.as_array().map(|arr| arr.iter().filter_map(|e| e.as_str().map(String::from)).collect())
    })
}

fn read_json_value(_library: &Library, f: ListFn, free: FreeFn) -> Option<Value> {
    read_json_value_raw(f, free)
}

fn read_json_value_raw(f: ListFn, free: FreeFn) -> Option<Value> {
    // SAFETY: same contract as `invoke` above, for the zero-argument
    // optional exports.
    let raw = unsafe { f() };
    if raw.is_null() {
        return None;
    }
    let out = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
    unsafe { free(raw) };
    serde_json::from_str(&out).ok()
}

/// The loader's cache: `outputPath -> module`. Single-writer — the build
/// worker invalidates; the next request after invalidation repopulates.
pub struct ModuleLoader {
    cache: DashMap<String, Arc<LoadedModule>>,
    dev_mode: bool,
}

impl ModuleLoader {
    pub fn new(dev_mode: bool) -> Self {
        ModuleLoader { cache: DashMap::new(), dev_mode }
    }

    /// Load the module at `output_path`. In development this always opens a
    /// fresh copy (any stale mapping is replaced, not reused); in
    /// production, once loaded, the same `Arc` is returned until
    /// explicitly invalidated.
    pub fn load(&self, output_path: &str) -> Result<Arc<LoadedModule>, LoadError> {
        if !self.dev_mode {
            if let Some(existing) = self.cache.get(output_path) {
                return Ok(existing.clone());
            }
        }

        let module = Arc::new(open_module(Path::new(output_path))?);
        self.cache.insert(output_path.to_string(), module.clone());
        Ok(module)
    }

    /// Drop every cached module whose `outputPath` lies under `output_root`.
    /// Called by the orchestrator after each successful build.
    pub fn invalidate_under(&self, output_root: &Path) {
        self.cache.retain(|key, _| !Path::new(key).starts_with(output_root));
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_artifact_raises_not_found() {
        let loader = ModuleLoader::new(true);
        let result = loader.load("/definitely/not/a/real/path.so");
        assert!(matches!(result, Err(LoadError::NotFound(_))));
    }

    #[test]
    fn invalidate_under_clears_matching_prefix_only() {
        let loader = ModuleLoader::new(false);
        loader.cache.insert(
            "/out/a.so".to_string(),
            Arc::new(LoadedModule {
                _library: unsafe { Library::new(std::env::current_exe().unwrap()).unwrap() },
                handler: unsafe { std::mem::transmute::<*const (), HandlerFn>(std::ptr::null()) },
                free: unsafe { std::mem::transmute::<*const (), FreeFn>(std::ptr::null()) },
                middleware_names: vec![],
                metadata: None,
            }),
        );
        loader.invalidate_under(Path::new("/out"));
        assert_eq!(loader.cached_len(), 0);
    }
}
