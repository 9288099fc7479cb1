//! Active health checking: probes, per-instance hysteresis and the manager
//! that keeps both in step with the registry.

pub mod checker;
pub mod manager;
pub mod probe;

pub use checker::{HealthChecker, HealthStats, Transition};
pub use manager::{HealthManager, StatusChange, StatusListener};
pub use probe::{CustomProbe, ProbeResult};
