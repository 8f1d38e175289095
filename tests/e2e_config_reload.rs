//! Scenario 6 (spec section 8): changing `server.port` is flagged as a
//! critical key that forces a restart, while other keys soft-apply through
//! `PipelineState::publish_options` without one. The orchestrator (C10)
//! drives the actual restart; this exercises the decision and soft-apply
//! primitives it is built on.

mod common;

use titan_server::config::{self, CliOverrides};
use titan_server::options::{Command, Env, Options};

#[test]
fn port_change_is_critical_other_changes_are_not() {
    let dir = tempfile::tempdir().unwrap();
    let before = config::load(dir.path(), &CliOverrides::default(), Command::Dev, Env::Dev).unwrap();

    let port_override = CliOverrides { port: Some(3001), ..Default::default() };
    let after_port_change = config::load(dir.path(), &port_override, Command::Dev, Env::Dev).unwrap();
    let port_diff = config::diff(&before, &after_port_change);
    assert!(config::has_critical_change(&port_diff));

    let verbose_override = CliOverrides { verbose: true, ..Default::default() };
    let after_verbose_change = config::load(dir.path(), &verbose_override, Command::Dev, Env::Dev).unwrap();
    let verbose_diff = config::diff(&before, &after_verbose_change);
    assert!(!verbose_diff.is_empty());
    assert!(!config::has_critical_change(&verbose_diff));
}

#[test]
fn non_critical_reload_soft_applies_through_the_pipeline() {
    let pipeline = common::new_pipeline(true);
    assert_eq!(pipeline.current_options().server.request.max_body_size, 1024 * 1024);

    let mut updated = Options::default();
    updated.server.request.max_body_size = 2048;
    pipeline.publish_options(updated);

    assert_eq!(pipeline.current_options().server.request.max_body_size, 2048);
}
