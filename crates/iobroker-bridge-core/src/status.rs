use serde::{Deserialize, Serialize};

/// The consumer-visible status enum from `spec.md` §4.4.
///
/// `Ready` is the transient kickoff signal CM fires the instant a
/// connection enters `CONNECTED`, before queue drain and resubscription
/// have run; it is never forwarded to a consumer's `update_status` hook
/// directly. Instead, the Façade's "ready" handler immediately calls
/// [`crate::registry::NodeRegistry::sync_all_node_statuses`], which settles
/// every still-registered consumer on `Connected` as step 1 of the ready
/// sequence in `spec.md` §4.5 — ahead of the resubscription cycle that
/// actually restores the wire subscriptions, exactly as the ordering there
/// prescribes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Ready,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Retrying,
    FailedPermanently,
}

impl ConnectionStatus {
    pub fn is_usable(self) -> bool {
        matches!(self, ConnectionStatus::Ready | ConnectionStatus::Connected)
    }
}
