use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a process-wide `tracing` subscriber.
///
/// Safe to call multiple times; only the first call takes effect. Host
/// integrations that want to route logs through the flow-host's own logger
/// instead should install their own `tracing::Subscriber` before any core
/// component is driven, and never call this function.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("iobroker_bridge_core=info,iobroker_bridge_commons=info")
        });

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .ok();
    });
}
