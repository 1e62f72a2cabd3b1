//! Process-wide helpers.

pub mod logger;
