//! Scenario 5 (spec section 8): recompiling a changed route source and
//! re-publishing the route table flips the observed response without a
//! process restart.

mod common;

use titan_server::compiler::{self, CompilationCache};
use titan_server::manifest;
use titan_server::options::Env;
use titan_server::route_scanner;

fn handler_source(message: &str) -> String {
    format!(
        r#"{}

#[no_mangle]
pub extern "C" fn titan_route_handler(input: *const c_char) -> *mut c_char {{
    let _ = read_input(input);
    reply("{{\"message\":\"{message}\"}}")
}}
"#,
        common::FFI_PRELUDE
    )
}

#[tokio::test]
async fn rebuilt_handler_is_served_after_republish() {
    let fixture = common::Fixture::new();
    fixture.write_route("hello.get.rs", &handler_source("v1"));

    let descriptors = fixture.build().await;
    let pipeline = common::new_pipeline(true);
    pipeline.publish_routes(descriptors);

    let (_, _, v1_body) =
        common::send(&pipeline, "GET", "/hello", axum::http::HeaderMap::new(), Env::Dev).await;
    assert!(v1_body.contains("v1"), "body was {v1_body}");

    fixture.write_route("hello.get.rs", &handler_source("v2"));
    let descriptors =
        route_scanner::scan(&fixture.routes_root(), &fixture.output_root(), common::cdylib_extension(), "").unwrap();
    compiler::compile("rustc", CompilationCache::default(), &fixture.output_root(), &descriptors, 2)
        .await
        .unwrap();
    manifest::publish(&fixture.output_root(), &descriptors).await.unwrap();
    pipeline.publish_routes(descriptors);

    let (status, _, v2_body) =
        common::send(&pipeline, "GET", "/hello", axum::http::HeaderMap::new(), Env::Dev).await;
    assert_eq!(status, 200);
    assert!(v2_body.contains("v2"), "body was {v2_body}");
    assert!(!v2_body.contains("v1"));
}
