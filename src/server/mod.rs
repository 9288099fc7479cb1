pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::ControlPlane;
