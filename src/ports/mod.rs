//! Ports - Trait definitions for every external collaborator.

pub mod media;
pub mod notifier;
pub mod queue;
pub mod storage;
pub mod surface;
