//! Data model shared by the loader, the port planner and the supervisor.

pub mod models;
pub mod ports;
