//! Media tooling: probing, chunk encoding, merging and compositing with
//! the ffmpeg command line tools.

pub mod cmd;
pub mod compositor;
pub mod encoder;
pub mod merger;
pub mod probe;
