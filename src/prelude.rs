//! Prelude module for convenient imports.

pub use crate::error::{ExecutorError, GuestFailure, Result};
pub use crate::sandbox::{
    config::ExecutorConfig,
    executor::{ExecutionResult, Executor},
    tools::{Tool, ToolCall, ToolError, ToolRegistry},
    value::Value,
};
