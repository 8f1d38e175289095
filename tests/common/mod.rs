//! Shared harness for the end-to-end scenarios in spec section 8: write a
//! route source file, run it through the real scan → compile → manifest
//! pipeline (an actual `rustc --crate-type cdylib` invocation, same as
//! production), then load and dispatch against it.
//!
//! Route handlers here are bare `rustc`-compiled cdylibs with no external
//! crates available, so the fixtures below hand-roll the tiny bit of JSON
//! they need rather than depending on `serde_json`.

use std::path::PathBuf;
use std::sync::Arc;

use titan_server::compiler::{self, CompilationCache};
use titan_server::hooks::HookBus;
use titan_server::loader::ModuleLoader;
use titan_server::options::{Env, Options};
use titan_server::pipeline::{self, PipelineState};
use titan_server::request::ParsedBody;
use titan_server::route_scanner;

pub fn cdylib_extension() -> &'static str {
    if cfg!(target_os = "windows") {
        "dll"
    } else if cfg!(target_os = "macos") {
        "dylib"
    } else {
        "so"
    }
}

/// A scratch project: `<root>/routes/*.rs` sources, `<root>/out` artifacts.
pub struct Fixture {
    pub root: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("routes")).unwrap();
        Fixture { root }
    }

    pub fn routes_root(&self) -> PathBuf {
        self.root.path().join("routes")
    }

    pub fn output_root(&self) -> PathBuf {
        self.root.path().join("out")
    }

    pub fn write_route(&self, relative: &str, source: &str) {
        let path = self.routes_root().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, source).unwrap();
    }

    /// Scan + compile (real `rustc`) + publish the manifest, returning the
    /// built route table.
    pub async fn build(&self) -> Vec<titan_server::route_convention::RouteDescriptor> {
        let descriptors =
            route_scanner::scan(&self.routes_root(), &self.output_root(), cdylib_extension(), "").unwrap();
        let cache = CompilationCache::load(&self.output_root()).await;
        compiler::compile("rustc", cache, &self.output_root(), &descriptors, 1).await.unwrap();
        titan_server::manifest::publish(&self.output_root(), &descriptors).await.unwrap();
        descriptors
    }
}

pub fn new_pipeline(dev_mode: bool) -> PipelineState {
    PipelineState::new(Arc::new(ModuleLoader::new(dev_mode)), Arc::new(HookBus::new()), Options::default())
}

/// Send a GET/POST/etc. through the real pipeline dispatcher and return the
/// response's status, headers and decoded UTF-8 body.
pub async fn send(
    state: &PipelineState,
    method: &str,
    path: &str,
    headers: axum::http::HeaderMap,
    env: Env,
) -> (u16, axum::http::HeaderMap, String) {
    let response = pipeline::dispatch(
        state,
        axum::http::Method::from_bytes(method.as_bytes()).unwrap(),
        path.to_string(),
        None,
        headers,
        ParsedBody::Empty,
        env,
        true,
    )
    .await;

    let status = response.status().as_u16();
    let response_headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, response_headers, String::from_utf8_lossy(&body).into_owned())
}

/// The bare-`std` JSON-over-FFI boilerplate every fixture handler needs:
/// decode the `*const c_char` argument (unused by most fixtures) and
/// allocate the `*mut c_char` reply via `CString::into_raw`, freed by
/// `titan_free_string`.
pub const FFI_PRELUDE: &str = r#"
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

#[no_mangle]
pub extern "C" fn titan_free_string(s: *mut c_char) {
    if !s.is_null() {
        unsafe { drop(CString::from_raw(s)); }
    }
}

fn reply(body: &str) -> *mut c_char {
    CString::new(body).unwrap().into_raw()
}

fn read_input(input: *const c_char) -> String {
    unsafe { CStr::from_ptr(input) }.to_string_lossy().into_owned()
}

/// Pull `"<key>":"<value>"` out of the request envelope without a JSON
/// crate. Good enough for fixture handlers; not a general parser.
fn extract_field(envelope: &str, key: &str) -> String {
    let needle = format!("\"{key}\":\"");
    let start = match envelope.find(&needle) {
        Some(i) => i + needle.len(),
        None => return String::new(),
    };
    let rest = &envelope[start..];
    let end = rest.find('"').unwrap_or(rest.len());
    rest[..end].to_string()
}

fn has_header(envelope: &str, name: &str) -> bool {
    envelope.contains(&format!("\"{name}\""))
}
"#;
