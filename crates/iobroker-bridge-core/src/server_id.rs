use std::fmt;
use std::sync::Arc;

use iobroker_bridge_commons::ServerConfig;

/// Stable identifier for a pooled connection, derived purely from
/// `host:port`. Two distinct credential sets for the same `host:port`
/// collide and share one logical connection; this is by design (see
/// `ConfigHash` in [`crate::server_id::ConfigHash`] for the piece that
/// detects the credential change).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(Arc<str>);

impl ServerId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.server_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash over `{host, port, user, password, tls}`. A hash change at
/// the same [`ServerId`] forces teardown-and-recreate of the connection
/// while retaining consumer registrations so they can resubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigHash(pub u64);

impl ConfigHash {
    pub fn of(config: &ServerConfig) -> Self {
        Self(config.config_hash())
    }
}

/// Monotonically increasing id assigned to each `Client` instance a
/// [`crate::connection::ConnectionManager`] creates for a given
/// [`ServerId`]. Any event referring to an older generation is dropped
/// unconditionally, independent of the time-based "recently successful"
/// guard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl Generation {
    pub const INITIAL: Generation = Generation(0);

    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

/// Opaque id of an external consumer ("node") of the [`crate::facade::Facade`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
