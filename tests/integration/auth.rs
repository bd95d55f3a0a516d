//! Authentication integration tests

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

#[test]
fn test_authenticated_roundtrip() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let result: Option<i64> = conn.query_first("SELECT 1").expect("SELECT should succeed");
    assert_eq!(result, Some(1));
}

#[test]
fn test_wrong_password_is_rejected() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let opts = mysql::OptsBuilder::new()
        .ip_or_hostname(Some(config.host.clone()))
        .tcp_port(config.port)
        .user(Some(config.user.clone()))
        .pass(Some("definitely-wrong-password".to_string()));

    let result = mysql::Conn::new(opts);
    assert!(result.is_err(), "bad credentials must be refused");
}

#[test]
fn test_unknown_user_is_rejected() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let opts = mysql::OptsBuilder::new()
        .ip_or_hostname(Some(config.host))
        .tcp_port(config.port)
        .user(Some("no-such-user".to_string()))
        .pass(Some("whatever".to_string()));

    let result = mysql::Conn::new(opts);
    assert!(result.is_err(), "unknown users must be refused");
}

#[test]
fn test_back_to_back_queries() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    for _ in 0..5 {
        let result: Option<i64> = conn.query_first("SELECT 1").expect("SELECT should succeed");
        assert_eq!(result, Some(1));
    }
}
