pub mod buffer2;
pub mod file_format;
pub mod file_utils;
pub mod log_setup;
pub mod parallel;

pub use buffer2::{Buffer2, Rect};
