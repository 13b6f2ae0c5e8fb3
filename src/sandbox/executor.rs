//! Core execution engine for the Python executor.

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};
use wasmtime::{Engine, ExternType, InstancePre, Store, Trap};
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

use crate::error::{ExecutorError, GuestFailure, Result};
use crate::sandbox::bridge::{self, BridgeOutcome, BridgeSession, GuestStreams};
use crate::sandbox::cache::{compile_uncached, global_cache, new_engine};
use crate::sandbox::config::ExecutorConfig;
use crate::sandbox::io::{truncate_logs, OutputCapture};
use crate::sandbox::limits::{StoreData, StoreLimiterExt};
use crate::sandbox::state::ExecutionState;
use crate::sandbox::tools::ToolRegistry;
use crate::sandbox::value::Value;

/// The guest driver, run by the interpreter as `python -c <driver>`.
const DRIVER: &str = include_str!("driver.py");

/// Result of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Value of the final expression, or the final answer when one was given.
    pub output: Option<Value>,
    /// Printed output followed by any failure diagnostics, clipped to the
    /// configured character budget.
    pub logs: String,
    /// Whether the completion sentinel was invoked during the call.
    pub is_final_answer: bool,
    /// The contained failure, if the snippet did not run to completion.
    pub failure: Option<GuestFailure>,
    /// Execution metadata.
    pub metadata: ExecutionMetadata,
}

impl ExecutionResult {
    fn empty() -> Self {
        Self {
            output: None,
            logs: String::new(),
            is_final_answer: false,
            failure: None,
            metadata: ExecutionMetadata::default(),
        }
    }

    /// Check if the snippet ran without a contained failure.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Split into `(output, logs, is_final_answer)`.
    pub fn into_parts(self) -> (Option<Value>, String, bool) {
        (self.output, self.logs, self.is_final_answer)
    }
}

/// Metadata about one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetadata {
    /// Wall-clock duration of the call.
    pub duration: Duration,
    /// Fuel consumed by the guest.
    pub fuel_consumed: u64,
    /// Peak guest linear memory in bytes.
    pub peak_memory: u64,
    /// Number of tool calls served, sentinel included.
    pub tool_calls: u32,
    /// Whether the logs were clipped.
    pub logs_truncated: bool,
    /// Guest bindings that had no host representation and were not kept.
    pub dropped_bindings: Vec<String>,
}

/// Everything the guest driver needs to rebuild the namespace and run a snippet.
#[derive(Serialize)]
struct Payload<'a> {
    code: &'a str,
    bindings: Vec<(&'a str, &'a Value)>,
    definitions: Vec<&'a str>,
    tools: Vec<String>,
    final_answer: &'a str,
    authorized_imports: Vec<String>,
}

/// The compiled, pre-linked guest runtime owned by one executor.
struct SandboxInstance {
    engine: Engine,
    instance_pre: InstancePre<StoreData>,
}

impl SandboxInstance {
    fn new(config: &ExecutorConfig) -> Result<Self> {
        let engine = new_engine()?;
        let module = if config.cache_compiled_runtime {
            global_cache().load(&engine, &config.interpreter_path)?
        } else {
            compile_uncached(&engine, &config.interpreter_path)?
        };

        if !matches!(module.get_export("_start"), Some(ExternType::Func(_))) {
            return Err(ExecutorError::RuntimeInitializationFailed(anyhow::anyhow!(
                "runtime image does not export a `_start` function"
            )));
        }
        if !matches!(module.get_export("memory"), Some(ExternType::Memory(_))) {
            return Err(ExecutorError::RuntimeInitializationFailed(anyhow::anyhow!(
                "runtime image does not export a `memory`"
            )));
        }

        let linker = bridge::link(&engine)?;
        let instance_pre = linker.instantiate_pre(&module).map_err(|e| {
            ExecutorError::RuntimeInitializationFailed(anyhow::anyhow!(
                "failed to link runtime image: {}",
                e
            ))
        })?;

        Ok(Self {
            engine,
            instance_pre,
        })
    }

    /// Run the driver once against `streams`.
    fn run(&self, config: &ExecutorConfig, streams: GuestStreams) -> Result<GuestRun> {
        let wasi = WasiCtxBuilder::new()
            .args(&["python", "-c", DRIVER])
            .stdin(streams.stdin)
            .stdout(streams.stdout)
            .stderr(streams.stderr)
            .build_p1();

        let mut store = Store::new(&self.engine, StoreData::new(config.max_memory, wasi));
        store.configure_limiter();

        let budget = config.max_fuel.unwrap_or(u64::MAX);
        store.set_fuel(budget).map_err(|e| {
            ExecutorError::RuntimeInitializationFailed(anyhow::anyhow!("failed to set fuel: {}", e))
        })?;
        store.epoch_deadline_trap();
        store.set_epoch_deadline(1);

        let watchdog = Watchdog::arm(&self.engine, config.timeout)?;
        let outcome = self
            .instance_pre
            .instantiate(&mut store)
            .and_then(|instance| instance.get_typed_func::<(), ()>(&mut store, "_start"))
            .and_then(|start| start.call(&mut store, ()));
        watchdog.disarm();

        let remaining = store.get_fuel().unwrap_or(0);
        let fuel_consumed = budget.saturating_sub(remaining);
        let limiter = &store.data().limiter;

        let failure = match outcome {
            Ok(()) => None,
            Err(e) => classify(e, limiter.denied(), fuel_consumed, config.timeout),
        };

        Ok(GuestRun {
            failure,
            fuel_consumed,
            peak_memory: limiter.peak_memory(),
        })
    }
}

/// What the host observed about one guest run.
struct GuestRun {
    failure: Option<GuestFailure>,
    fuel_consumed: u64,
    peak_memory: u64,
}

fn classify(
    error: anyhow::Error,
    memory_denied: Option<&str>,
    fuel_consumed: u64,
    timeout: Option<Duration>,
) -> Option<GuestFailure> {
    if let Some(exit) = error.downcast_ref::<I32Exit>() {
        return match exit.0 {
            0 => None,
            code => Some(GuestFailure::Trap(format!("guest exited with status {code}"))),
        };
    }
    if let Some(reason) = memory_denied {
        return Some(GuestFailure::MemoryLimitExceeded(reason.to_string()));
    }
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => Some(GuestFailure::OutOfFuel {
            consumed: fuel_consumed,
        }),
        Some(Trap::Interrupt) => Some(GuestFailure::Timeout(timeout.unwrap_or_default())),
        Some(trap) => Some(GuestFailure::Trap(trap.to_string())),
        None => Some(GuestFailure::Trap(format!("{error:#}"))),
    }
}

/// Interrupts the guest through the engine epoch once the timeout elapses.
struct Watchdog {
    cancel: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn arm(engine: &Engine, timeout: Option<Duration>) -> Result<Self> {
        let Some(timeout) = timeout else {
            return Ok(Self {
                cancel: None,
                handle: None,
            });
        };

        let (cancel, cancelled) = mpsc::channel::<()>();
        let engine = engine.clone();
        let handle = std::thread::Builder::new()
            .name("executor-watchdog".to_string())
            .spawn(move || {
                if let Err(mpsc::RecvTimeoutError::Timeout) = cancelled.recv_timeout(timeout) {
                    engine.increment_epoch();
                }
            })?;

        Ok(Self {
            cancel: Some(cancel),
            handle: Some(handle),
        })
    }

    fn disarm(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A stateful Python executor isolated in WebAssembly.
///
/// Each executor owns a private engine and pre-linked runtime. Every call to
/// [`execute`](Self::execute) runs in a fresh store with the accumulated
/// [`ExecutionState`] rehydrated into it, so value bindings and top-level
/// definitions persist from one call to the next.
pub struct Executor {
    config: ExecutorConfig,
    instance: Option<SandboxInstance>,
    state: ExecutionState,
    tools: ToolRegistry,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .field("state", &self.state)
            .field("tools", &self.tools)
            .finish()
    }
}

impl Executor {
    /// Create an executor: validate the configuration, load and link the
    /// runtime image, and register the initial tools.
    ///
    /// Construction either fully succeeds or leaves nothing behind.
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        let instance = SandboxInstance::new(&config)?;
        let tools = config.additional_functions.clone();

        info!(
            interpreter = %config.interpreter_path.display(),
            tools = tools.len(),
            max_memory = config.max_memory,
            "executor initialized"
        );

        Ok(Self {
            config,
            instance: Some(instance),
            state: ExecutionState::new(),
            tools,
        })
    }

    /// Create an executor, hand it to `f`, and clean it up afterwards.
    pub fn scoped<F, T>(config: ExecutorConfig, f: F) -> Result<T>
    where
        F: FnOnce(&mut Executor) -> T,
    {
        let mut executor = Self::new(config)?;
        let value = f(&mut executor);
        executor.cleanup();
        Ok(value)
    }

    /// Execute a snippet of Python code.
    ///
    /// Failures inside the guest are contained in the returned
    /// [`ExecutionResult`]; `Err` is only returned for host-side problems.
    pub fn execute(&mut self, code: &str) -> Result<ExecutionResult> {
        let instance = self.instance.as_ref().ok_or(ExecutorError::Closed)?;
        if code.trim().is_empty() {
            debug!("skipping empty code");
            return Ok(ExecutionResult::empty());
        }

        let started = Instant::now();
        let payload = Payload {
            code,
            bindings: self.state.iter().collect(),
            definitions: self
                .state
                .definitions()
                .iter()
                .map(|def| def.source.as_str())
                .collect(),
            tools: self.tools.names(),
            final_answer: &self.config.final_answer_tool,
            authorized_imports: self.config.authorized_imports(),
        };
        let payload = serde_json::to_vec(&payload).map_err(std::io::Error::from)?;

        let capture = OutputCapture::for_char_budget(self.config.max_print_outputs_length);
        let session = BridgeSession::new(self.tools.clone(), &self.config.final_answer_tool, &payload);
        let run = instance.run(&self.config, GuestStreams::new(&session, capture.clone()))?;
        let outcome = session.finish();

        let result = self.conclude(run, outcome, &capture, started.elapsed());
        debug!(
            code_len = code.len(),
            fuel = result.metadata.fuel_consumed,
            duration_ms = result.metadata.duration.as_millis() as u64,
            success = result.is_success(),
            final_answer = result.is_final_answer,
            "execution finished"
        );
        Ok(result)
    }

    /// Execute code given as raw bytes, which must be UTF-8.
    pub fn execute_bytes(&mut self, code: &[u8]) -> Result<ExecutionResult> {
        if self.is_closed() {
            return Err(ExecutorError::Closed);
        }
        let code = std::str::from_utf8(code)
            .map_err(|e| ExecutorError::InvalidCodeType(format!("code is not valid UTF-8: {e}")))?;
        self.execute(code)
    }

    fn conclude(
        &mut self,
        run: GuestRun,
        outcome: BridgeOutcome,
        capture: &OutputCapture,
        duration: Duration,
    ) -> ExecutionResult {
        let trapped = run.failure.is_some();
        let mut failure = run.failure;
        let mut output = None;
        let mut dropped_bindings = Vec::new();

        // A reported namespace is kept even when the run trapped afterwards;
        // without one, the last completed statement's checkpoint is kept.
        let snapshot = match outcome.done {
            Some(done) => {
                if !trapped {
                    failure = done.error.map(GuestFailure::from);
                    output = done.output;
                }
                Some((done.bindings, done.definitions, done.dropped))
            }
            None => {
                if failure.is_none() {
                    failure = Some(if outcome.stray.trim().is_empty() {
                        GuestFailure::Trap("guest exited without reporting a result".to_string())
                    } else {
                        GuestFailure::from_python_stderr(&outcome.stray)
                    });
                }
                outcome
                    .checkpoint
                    .map(|checkpoint| (checkpoint.bindings, checkpoint.definitions, checkpoint.dropped))
            }
        };

        if let Some((bindings, definitions, dropped)) = snapshot {
            for name in &dropped {
                warn!(name = %name, "guest binding has no host representation; not kept");
            }
            dropped_bindings = dropped;
            self.state.apply_guest_snapshot(bindings, definitions);
        }

        if outcome.completion.fired() {
            output = outcome.completion.answer().cloned();
        }

        let mut logs = capture.to_string_lossy();
        if !outcome.stray.is_empty() {
            logs.push_str(&outcome.stray);
            if !logs.ends_with('\n') {
                logs.push('\n');
            }
        }
        if let Some(failure) = &failure {
            logs.push_str(&failure.render());
        }
        let (logs, logs_truncated) = truncate_logs(logs, self.config.max_print_outputs_length);

        ExecutionResult {
            output,
            logs,
            is_final_answer: outcome.completion.fired(),
            failure,
            metadata: ExecutionMetadata {
                duration,
                fuel_consumed: run.fuel_consumed,
                peak_memory: run.peak_memory,
                tool_calls: outcome.tool_calls,
                logs_truncated,
                dropped_bindings,
            },
        }
    }

    /// Merge host variables into the state. Every entry is validated first and
    /// nothing is merged if one fails.
    pub fn send_variables<K, I>(&mut self, vars: I) -> Result<()>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        if self.is_closed() {
            return Err(ExecutorError::Closed);
        }
        self.state.merge_variables(vars)
    }

    /// Merge the entries of a JSON object into the state.
    pub fn send_json_variables(&mut self, vars: serde_json::Value) -> Result<()> {
        let serde_json::Value::Object(map) = vars else {
            return Err(ExecutorError::UnsupportedVariableType {
                key: String::new(),
                reason: "variables must be a JSON object".to_string(),
            });
        };
        let mut converted = Vec::with_capacity(map.len());
        for (key, value) in map {
            let value = Value::try_from(value).map_err(|e| ExecutorError::UnsupportedVariableType {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            converted.push((key, value));
        }
        self.send_variables(converted)
    }

    /// Register tools; they are callable from the next execution on and
    /// replace same-named tools and bindings.
    pub fn send_tools(&mut self, tools: ToolRegistry) -> Result<()> {
        if self.is_closed() {
            return Err(ExecutorError::Closed);
        }
        for name in tools.names() {
            self.state.shadow(&name);
        }
        debug!(tools = ?tools.names(), "registering tools");
        self.tools.extend(tools);
        Ok(())
    }

    /// The accumulated execution state.
    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    /// The registered tools.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// The executor configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Release the engine and runtime. Repeated calls are no-ops.
    pub fn cleanup(&mut self) {
        if self.instance.take().is_some() {
            info!("executor cleaned up");
        }
    }

    /// Check if [`cleanup`](Self::cleanup) has run.
    pub fn is_closed(&self) -> bool {
        self.instance.is_none()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.cleanup();
    }
}
