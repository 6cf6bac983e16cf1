pub mod watermark;

pub use watermark::{
    InMemoryWatermarkStore, JsonFileWatermarkStore, WatermarkBackend, WatermarkStore,
};
