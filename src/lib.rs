pub mod config;
pub mod discovery;
pub mod error;
pub mod etcd;
pub mod health;
pub mod metrics;
pub mod server;
pub mod store;
pub mod upstream;
