use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The full configuration of a connection to a remote server, as supplied
/// by a consumer at subscribe/operation time.
///
/// Ping interval, pong timeout and connect timeout are transport tuning
/// and are intentionally excluded from [`ServerConfig::config_hash`]: a
/// tuning-only change must not force a teardown of an otherwise-identical
/// connection.
#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: Duration,
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout: Duration,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_pong_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
            password: None,
            tls: false,
            ping_interval: default_ping_interval(),
            pong_timeout: default_pong_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }

    /// `host:port`, the stable pool key for this connection.
    pub fn server_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Content digest over `{host, port, user, password, tls}`. Two configs
    /// with the same [`ServerConfig::server_id`] but a different hash
    /// represent a credential/endpoint change that forces a teardown and
    /// re-create of the pooled connection.
    pub fn config_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.host.hash(&mut hasher);
        self.port.hash(&mut hasher);
        self.user.hash(&mut hasher);
        self.password.hash(&mut hasher);
        self.tls.hash(&mut hasher);
        hasher.finish()
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}
