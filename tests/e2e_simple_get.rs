//! Scenario 1 (spec section 8): a GET-only route returns its JSON body and
//! the framework header; the same path rejects other methods.

mod common;

use titan_server::options::Env;

#[tokio::test]
async fn simple_get_returns_message_and_post_is_not_found() {
    let fixture = common::Fixture::new();
    fixture.write_route(
        "hello.get.rs",
        &format!(
            r#"{}

#[no_mangle]
pub extern "C" fn titan_route_handler(input: *const c_char) -> *mut c_char {{
    let _ = read_input(input);
    reply("{{\"message\":\"hi\"}}")
}}
"#,
            common::FFI_PRELUDE
        ),
    );

    let descriptors = fixture.build().await;
    assert_eq!(descriptors.len(), 1);

    let pipeline = common::new_pipeline(true);
    pipeline.publish_routes(descriptors);

    let (status, headers, body) =
        common::send(&pipeline, "GET", "/hello", axum::http::HeaderMap::new(), Env::Dev).await;
    assert_eq!(status, 200);
    assert_eq!(body, r#"{"message":"hi"}"#);
    assert!(headers.contains_key("x-powered-by"));

    let (post_status, _, _) =
        common::send(&pipeline, "POST", "/hello", axum::http::HeaderMap::new(), Env::Dev).await;
    assert_eq!(post_status, 404);
}
