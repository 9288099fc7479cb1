//! Call-path components: circuit breakers guarding calls and the load
//! balancer choosing among instances.

pub mod circuit_breaker;
pub mod loadbalance;

pub use circuit_breaker::{
    server_error, BreakerMetrics, CallOutcome, CircuitBreaker, CircuitBreakerRegistry, CircuitState, FailureMode,
};
pub use loadbalance::{InstanceStats, LoadBalancer, SelectContext};
