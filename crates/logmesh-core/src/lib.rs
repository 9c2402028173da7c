pub mod config;
pub mod error;

pub use config::{LogConfig, SegmentConfig, ENTRY_WIDTH};
pub use error::{Error, Result};
