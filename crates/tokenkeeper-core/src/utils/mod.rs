//! Utility functions for token masking and time formatting.

pub mod format;

// Re-export commonly used functions at module level
pub use format::{format_countdown, format_timestamp, mask_token};
