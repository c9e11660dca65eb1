//! Overlayer - segmented overlay rendering worker
//!
//! Hexagonal Architecture:
//! - domain/: Pure business logic (jobs, chunk planning, progress, av tooling)
//! - ports/: Trait definitions
//! - adapters/: Concrete implementations
//! - application/: Generic services
//! - config: Environment configuration
//!
//! # Features
//! - `aws`: S3 storage adapter

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;

pub use application::orchestrator::JobOrchestrator;
pub use config::WorkerConfig;
pub use error::{ErrorKind, RenderError};
