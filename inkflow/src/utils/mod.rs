//! Utility functions for run ids, timestamps and text handling.

pub mod text;
pub mod timestamps;
mod uuid_utils;

pub use text::estimate_tokens;
pub use timestamps::{iso_timestamp, parse_timestamp, Timestamp, TimestampError};
pub use uuid_utils::{generate_run_id, is_valid_run_id};
