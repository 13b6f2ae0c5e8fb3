//! # WASM Python Executor
//!
//! A stateful Python code executor for agents, isolated in WebAssembly.
//!
//! Snippets run in RustPython compiled to WebAssembly on the Wasmtime runtime.
//! Each [`Executor`] keeps a namespace across calls, so variables and
//! functions defined in one snippet are visible in the next. Host values and
//! host tools can be injected between calls, and a `final_answer(...)` call in
//! the guest marks the result as the agent's final answer.
//!
//! - **State**: value bindings and top-level `def`/`class`/`import`
//!   statements persist across executions
//! - **Tools**: host callables exposed to the guest with structured arguments
//! - **Contained failures**: exceptions, timeouts and resource limits are
//!   reported in the result, never as a host error
//! - **Bounded logs**: printed output is clipped to a character budget
//!
//! ## Example
//!
//! ```rust,ignore
//! use wasm_python_executor::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let config = ExecutorConfig::builder()
//!         .additional_authorized_imports(["json"])
//!         .additional_fn("double", |call| {
//!             let x = call.arg(0).and_then(Value::as_i64).unwrap_or(0);
//!             Ok(Value::Int(x * 2))
//!         })
//!         .build();
//!
//!     let mut executor = Executor::new(config)?;
//!     executor.send_variables([("base", Value::Int(20))])?;
//!
//!     let result = executor.execute("x = double(base)\nprint(x)\nx + 2")?;
//!     assert_eq!(result.output, Some(Value::Int(42)));
//!     assert_eq!(result.logs, "40\n");
//!
//!     let result = executor.execute("final_answer(x)")?;
//!     assert!(result.is_final_answer);
//!
//!     executor.cleanup();
//!     Ok(())
//! }
//! ```
//!
//! ## Security Model
//!
//! 1. **WebAssembly sandboxing**: code runs in Wasm with no direct host access
//! 2. **WASI restrictions**: no preopened directories, environment or sockets
//! 3. **Import allow-list**: only authorized modules can be imported
//! 4. **Resource limits**: memory, fuel and wall-clock time are bounded

pub mod error;
pub mod prelude;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use error::{ExecutorError, GuestFailure, Result, ERROR_MARKER};
pub use sandbox::cache::{global_cache, ArtifactCache};
pub use sandbox::config::{ExecutorConfig, ExecutorConfigBuilder};
pub use sandbox::executor::{ExecutionMetadata, ExecutionResult, Executor};
pub use sandbox::state::{Definition, ExecutionState};
pub use sandbox::tools::{Tool, ToolCall, ToolError, ToolRegistry};
pub use sandbox::value::{Value, ValueError};
