//! Connection Manager (CM): owns the per-`ServerId` `Client` and the
//! connection state machine described in `spec.md` §4.1.

pub mod manager;
pub mod record;

pub use manager::{ConnectionCallbacks, ConnectionManager, ConnectionOutcome};
pub use record::{ConnectionRecord, ConnectionState};
