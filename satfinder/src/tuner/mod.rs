//! Tuner session orchestration: control channel, per-session state
//! machine, metrics snapshots and the supervising pool.

pub mod control;
pub mod metrics;
pub mod pool;
pub mod session;

#[cfg(test)]
mod integration;

pub use metrics::MetricsSnapshot;
pub use pool::{PoolConfig, SessionPool, TunerReport};
pub use session::{SessionConfig, SessionState};
