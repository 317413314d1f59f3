//! Recovery Manager (RM): per-`ServerId` consumer accounting, retry-policy
//! gating and post-reconnect callback execution, per `spec.md` §4.3.

pub mod manager;

pub use manager::{RecoveryCallback, RecoveryManager};
