//! Sandbox module containing all execution-related components.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod executor;
pub mod io;
pub mod limits;
pub mod state;
pub mod tools;
pub mod value;
