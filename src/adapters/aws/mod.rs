//! AWS adapters, enabled with the `aws` feature.

pub mod s3;

pub use s3::S3Storage;
