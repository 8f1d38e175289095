//! Scenario 4 (spec section 8): a route-declared middleware short-circuits
//! the chain with a 401 when the `Authorization` header is absent, and the
//! handler is never reached.

mod common;

use titan_server::options::Env;

#[tokio::test]
async fn missing_auth_header_short_circuits_before_the_handler() {
    let fixture = common::Fixture::new();
    fixture.write_route(
        "protected.get.rs",
        &format!(
            r#"{}

#[no_mangle]
pub extern "C" fn titan_route_middlewares() -> *mut c_char {{
    reply("[\"auth\"]")
}}

#[no_mangle]
pub extern "C" fn titan_mw_auth(input: *const c_char) -> *mut c_char {{
    let envelope = read_input(input);
    if has_header(&envelope, "authorization") {{
        reply("{{\"_next\":true}}")
    }} else {{
        reply("{{\"_isResponse\":true,\"status\":401,\"body\":{{\"error\":{{\"status\":401,\"message\":\"no token\"}}}}}}")
    }}
}}

#[no_mangle]
pub extern "C" fn titan_route_handler(input: *const c_char) -> *mut c_char {{
    let _ = read_input(input);
    reply("{{\"reached\":true}}")
}}
"#,
            common::FFI_PRELUDE
        ),
    );

    let descriptors = fixture.build().await;
    let pipeline = common::new_pipeline(true);
    pipeline.publish_routes(descriptors);

    let (status, _, body) =
        common::send(&pipeline, "GET", "/protected", axum::http::HeaderMap::new(), Env::Dev).await;
    assert_eq!(status, 401);
    assert!(body.contains("no token"), "body was {body}");
    assert!(!body.contains("reached"), "handler must not have run: {body}");

    let mut headers = axum::http::HeaderMap::new();
    headers.insert(axum::http::header::AUTHORIZATION, "Bearer x".parse().unwrap());
    let (authed_status, _, authed_body) = common::send(&pipeline, "GET", "/protected", headers, Env::Dev).await;
    assert_eq!(authed_status, 200);
    assert!(authed_body.contains("reached"));
}
