//! Local adapters for a single-host deployment.

pub mod chrome;
pub mod ffmpeg;
pub mod fs;
pub mod redis;
pub mod webhook;

pub use chrome::{ChromeConfig, ChromeSurfaceFactory};
pub use ffmpeg::{FfmpegConfig, FfmpegMedia};
pub use fs::LocalStorage;
pub use redis::RedisPool;
pub use webhook::WebhookNotifier;
