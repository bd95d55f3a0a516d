//! Session command replay integration tests
//!
//! These assume the proxy fans out to at least one backend; with several
//! backends configured they additionally exercise the broadcast path.

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

#[test]
fn test_set_is_applied_to_session() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("SET @hydra_probe = 42")
        .expect("SET should succeed on every backend");

    let result: Option<i64> = conn
        .query_first("SELECT @hydra_probe")
        .expect("SELECT should succeed");
    assert_eq!(result, Some(42));
}

#[test]
fn test_set_autocommit_broadcast() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("SET autocommit=0")
        .expect("session command should be acknowledged once");
    conn.query_drop("SET autocommit=1")
        .expect("second session command should be acknowledged once");

    let result: Option<i64> = conn
        .query_first("SELECT @@autocommit")
        .expect("SELECT should succeed");
    assert_eq!(result, Some(1));
}

#[test]
fn test_queries_still_flow_after_session_commands() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("SET @x = 1").expect("SET");
    for i in 0..10 {
        let result: Option<i64> = conn
            .query_first(format!("SELECT {i}"))
            .expect("SELECT should succeed");
        assert_eq!(result, Some(i));
    }
}
