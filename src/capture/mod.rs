pub mod batcher;
pub mod frame_cache;

pub use batcher::{BatchTrigger, BatcherConfig, BatcherMetrics, ReadyBatch, ScreenshotBatcher};
pub use frame_cache::FrameCache;
