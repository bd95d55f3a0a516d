use serde::Deserialize;

use crate::sescmd::{Properties, Semantics};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Backend endpoints every session fans out to.
    #[serde(default)]
    pub backends: Vec<BackendEntry>,
    /// User catalog: username + hex `SHA1(SHA1(password))`.
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub sescmd: SescmdConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    4406
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendEntry {
    /// host:port of one backend server
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub username: String,
    /// 40-char hex `SHA1(SHA1(password))`; empty for password-less accounts.
    #[serde(default)]
    pub password_sha1: String,
}

/// Session command list tuning.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SescmdConfig {
    #[serde(flatten)]
    pub semantics: Semantics,
    #[serde(flatten)]
    pub properties: Properties,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            backends: Vec::new(),
            users: Vec::new(),
            sescmd: SescmdConfig::default(),
        }
    }
}
