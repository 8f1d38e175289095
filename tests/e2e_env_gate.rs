//! Scenario 3 (spec section 8): a `.dev.` suffixed route only matches when
//! the server's global environment is `dev`.

mod common;

use titan_server::options::Env;

#[tokio::test]
async fn dev_only_route_is_hidden_in_prod() {
    let fixture = common::Fixture::new();
    fixture.write_route(
        "debug.dev.get.rs",
        &format!(
            r#"{}

#[no_mangle]
pub extern "C" fn titan_route_handler(input: *const c_char) -> *mut c_char {{
    let _ = read_input(input);
    reply("{{\"debug\":true}}")
}}
"#,
            common::FFI_PRELUDE
        ),
    );

    let descriptors = fixture.build().await;
    let pipeline = common::new_pipeline(true);
    pipeline.publish_routes(descriptors);

    let (dev_status, _, _) =
        common::send(&pipeline, "GET", "/debug", axum::http::HeaderMap::new(), Env::Dev).await;
    assert_eq!(dev_status, 200);

    let (prod_status, _, _) =
        common::send(&pipeline, "GET", "/debug", axum::http::HeaderMap::new(), Env::Prod).await;
    assert_eq!(prod_status, 404);
}
