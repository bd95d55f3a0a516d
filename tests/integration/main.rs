//! Integration test entry point
//!
//! These tests talk to a running Hydra proxy with at least one backend
//! behind it. Run with: HYDRA_RUN_INTEGRATION_TESTS=1 cargo test --test integration

mod auth;
mod sescmd;

use std::env;

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("HYDRA_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip the current test unless integration tests are enabled.
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !$crate::should_run_integration_tests() {
            eprintln!("skipping: set HYDRA_RUN_INTEGRATION_TESTS=1 to run");
            return;
        }
    };
}

/// Proxy endpoint and credentials from environment
pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        host: env::var("HYDRA_TEST_PROXY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("HYDRA_TEST_PROXY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(4406),
        user: env::var("HYDRA_TEST_PROXY_USER").unwrap_or_else(|_| "hydra".to_string()),
        password: env::var("HYDRA_TEST_PROXY_PASS").unwrap_or_default(),
    }
}

/// Proxy test configuration
#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl ProxyTestConfig {
    /// Open a connection through the proxy.
    pub fn conn(&self) -> mysql::PooledConn {
        let opts = mysql::OptsBuilder::new()
            .ip_or_hostname(Some(self.host.clone()))
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(if self.password.is_empty() {
                None
            } else {
                Some(self.password.clone())
            });
        let pool = mysql::Pool::new(opts).expect("proxy must be reachable");
        pool.get_conn().expect("proxy must accept the test user")
    }
}
