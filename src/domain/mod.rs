//! Domain layer - Pure business logic.

pub mod av;
pub mod chunks;
pub mod frame;
pub mod jobs;
pub mod progress;
