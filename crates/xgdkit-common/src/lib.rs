/// Strings
pub mod str;
/// Timestamps
pub mod time;
/// Types
pub mod types;
