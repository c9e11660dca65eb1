//! Application layer - Generic services that use ports.

pub mod events;
pub mod notify;
pub mod orchestrator;
pub mod pool;
pub mod renderer;
pub mod worker;
