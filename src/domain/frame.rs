use bytes::Bytes;

/// One captured overlay raster (PNG with alpha).
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position within the chunk, starting at 0.
    pub index: u64,
    /// Position within the whole video.
    pub global_index: u64,
    /// Seconds from the start of the video.
    pub timestamp: f64,
    pub data: Bytes,
}
