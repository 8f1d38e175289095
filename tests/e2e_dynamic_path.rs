//! Scenario 2 (spec section 8): a dynamic `[id]` segment is bound into
//! `params` and echoed back; an extra trailing segment does not match.

mod common;

use titan_server::options::Env;

#[tokio::test]
async fn dynamic_segment_is_captured_and_extra_segment_is_not_found() {
    let fixture = common::Fixture::new();
    fixture.write_route(
        "users/[id].get.rs",
        &format!(
            r#"{}

#[no_mangle]
pub extern "C" fn titan_route_handler(input: *const c_char) -> *mut c_char {{
    let envelope = read_input(input);
    let id = extract_field(&envelope, "id");
    reply(&format!("{{\"id\":\"{{}}\"}}", id))
}}
"#,
            common::FFI_PRELUDE
        ),
    );

    let descriptors = fixture.build().await;
    let pipeline = common::new_pipeline(true);
    pipeline.publish_routes(descriptors);

    let (status, _, body) =
        common::send(&pipeline, "GET", "/users/42", axum::http::HeaderMap::new(), Env::Dev).await;
    assert_eq!(status, 200);
    assert!(body.contains("42"), "body was {body}");

    let (extra_status, _, _) =
        common::send(&pipeline, "GET", "/users/42/extra", axum::http::HeaderMap::new(), Env::Dev).await;
    assert_eq!(extra_status, 404);
}
