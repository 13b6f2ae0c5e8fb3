//! The host bridge: everything the guest can reach on the host.
//!
//! The guest runtime image is a WASI command, so the bridge is expressed in
//! terms of its three standard streams:
//!
//! - **stdout** is the print sink, an [`OutputCapture`].
//! - **stderr** is the control channel. The guest driver writes one frame per
//!   line, prefixed with [`FRAME_PREFIX`]. Anything else written there (for
//!   example an interpreter crash report) is kept as stray diagnostics.
//! - **stdin** is the reply channel. It starts with the execution payload and
//!   receives one reply line per tool call.
//!
//! Tool calls are synchronous: the guest writes a `call` frame, the host runs
//! the tool while handling that write, queues the reply, and the guest reads it
//! back with `readline()`. Calls to the completion sentinel mark the
//! [`CompletionDetector`]. After each top-level statement that changes the
//! namespace the driver writes a `checkpoint` frame, and it ends with a single
//! `done` frame.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wasmtime::{Engine, Linker};
use wasmtime_wasi::preview1;
use wasmtime_wasi::{
    HostInputStream, HostOutputStream, StdinStream, StdoutStream, StreamError, StreamResult,
    Subscribe,
};

use crate::error::{ExecutorError, GuestFailure, Result};
use crate::sandbox::io::OutputCapture;
use crate::sandbox::limits::StoreData;
use crate::sandbox::state::Definition;
use crate::sandbox::tools::{invoke_contained, ToolCall, ToolRegistry};
use crate::sandbox::value::Value;

/// Prefix (ASCII record separator) that marks a control frame line.
pub const FRAME_PREFIX: u8 = 0x1e;

/// Upper bound on stray stderr text kept for diagnostics.
const STRAY_CAPACITY: usize = 64 * 1024;

/// Upper bound on a single control frame line.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const WRITE_PERMIT: usize = 64 * 1024;

/// Link the host bridge: WASI preview 1 with no preopened directories, no
/// inherited environment and no sockets.
pub fn link(engine: &Engine) -> Result<Linker<StoreData>> {
    let mut linker = Linker::new(engine);
    preview1::add_to_linker_sync(&mut linker, |data: &mut StoreData| &mut data.wasi).map_err(
        |e| ExecutorError::RuntimeInitializationFailed(anyhow::anyhow!("failed to link WASI: {}", e)),
    )?;
    Ok(linker)
}

/// A frame written by the guest driver on the control channel.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum GuestFrame {
    Call {
        name: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Vec<(String, Value)>,
    },
    Checkpoint(Checkpoint),
    Done(DoneReport),
}

/// Namespace reported after a top-level statement completed.
///
/// When the run is cut short by a resource limit, the last checkpoint is the
/// state from before the statement that was interrupted.
#[derive(Debug, Default, Deserialize)]
pub struct Checkpoint {
    /// Representable top-level bindings.
    #[serde(default)]
    pub bindings: Vec<(String, Value)>,
    /// Top-level definitions made so far by this run.
    #[serde(default)]
    pub definitions: Vec<Definition>,
    /// Names whose values could not be carried over.
    #[serde(default)]
    pub dropped: Vec<String>,
}

/// The final report of one execution.
#[derive(Debug, Default, Deserialize)]
pub struct DoneReport {
    /// Representable top-level bindings after the run.
    #[serde(default)]
    pub bindings: Vec<(String, Value)>,
    /// Top-level definitions made by this run.
    #[serde(default)]
    pub definitions: Vec<Definition>,
    /// Value of the final expression, when there was one.
    #[serde(default)]
    pub output: Option<Value>,
    /// Exception that escaped the snippet.
    #[serde(default)]
    pub error: Option<ReportedException>,
    /// Names whose values could not be carried over.
    #[serde(default)]
    pub dropped: Vec<String>,
}

/// An exception as reported by the guest driver.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportedException {
    #[serde(rename = "type")]
    exception_type: String,
    message: String,
    #[serde(default)]
    traceback: Option<String>,
}

impl From<ReportedException> for GuestFailure {
    fn from(report: ReportedException) -> Self {
        GuestFailure::Exception {
            exception_type: report.exception_type,
            message: report.message,
            traceback: report.traceback.filter(|tb| !tb.trim().is_empty()),
        }
    }
}

/// Reply to a `call` frame, written to the guest's stdin.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum HostReply {
    Ok { value: Value },
    Error { message: String },
}

/// Records invocations of the completion sentinel.
#[derive(Debug, Default, Clone)]
pub struct CompletionDetector {
    answer: Option<Value>,
    fired: bool,
}

impl CompletionDetector {
    fn mark(&mut self, answer: Value) {
        self.fired = true;
        self.answer = Some(answer);
    }

    /// Whether the sentinel was invoked.
    pub fn fired(&self) -> bool {
        self.fired
    }

    /// The answer passed to the last sentinel invocation.
    pub fn answer(&self) -> Option<&Value> {
        self.answer.as_ref()
    }
}

#[derive(Debug, Default)]
struct SessionState {
    line: Vec<u8>,
    oversized: bool,
    replies: VecDeque<u8>,
    stray: Vec<u8>,
    completion: CompletionDetector,
    checkpoint: Option<Checkpoint>,
    done: Option<DoneReport>,
    tool_calls: u32,
}

/// Per-execution bridge state shared by the control and reply channels.
#[derive(Clone)]
pub struct BridgeSession {
    state: Arc<Mutex<SessionState>>,
    tools: ToolRegistry,
    final_answer_tool: Arc<str>,
}

/// What the bridge collected during one execution.
#[derive(Debug)]
pub struct BridgeOutcome {
    /// Sentinel invocations.
    pub completion: CompletionDetector,
    /// The last checkpoint the driver reported.
    pub checkpoint: Option<Checkpoint>,
    /// The driver's final report, if it got that far.
    pub done: Option<DoneReport>,
    /// Stderr text that was not a frame.
    pub stray: String,
    /// Number of tool calls served.
    pub tool_calls: u32,
}

impl BridgeSession {
    /// Start a session whose reply channel begins with `payload`.
    pub fn new(tools: ToolRegistry, final_answer_tool: &str, payload: &[u8]) -> Self {
        let mut state = SessionState::default();
        state.replies.extend(payload);
        state.replies.push_back(b'\n');
        Self {
            state: Arc::new(Mutex::new(state)),
            tools,
            final_answer_tool: Arc::from(final_answer_tool),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The control channel, to be installed as the guest's stderr.
    pub fn control_channel(&self) -> ControlChannel {
        ControlChannel {
            session: self.clone(),
        }
    }

    /// The reply channel, to be installed as the guest's stdin.
    pub fn reply_channel(&self) -> ReplyChannel {
        ReplyChannel {
            session: self.clone(),
        }
    }

    /// Take everything collected so far.
    pub fn finish(&self) -> BridgeOutcome {
        let mut state = self.lock();
        if !state.line.is_empty() {
            let partial = std::mem::take(&mut state.line);
            push_stray(&mut state.stray, &partial);
        }
        BridgeOutcome {
            completion: state.completion.clone(),
            checkpoint: state.checkpoint.take(),
            done: state.done.take(),
            stray: String::from_utf8_lossy(&state.stray).into_owned(),
            tool_calls: state.tool_calls,
        }
    }

    fn receive(&self, bytes: &[u8]) {
        let mut rest = bytes;
        while !rest.is_empty() {
            let newline = rest.iter().position(|b| *b == b'\n');
            let (chunk, complete) = match newline {
                Some(pos) => (&rest[..pos], true),
                None => (rest, false),
            };
            rest = match newline {
                Some(pos) => &rest[pos + 1..],
                None => &[],
            };

            let line = {
                let mut state = self.lock();
                if state.line.len() + chunk.len() > MAX_FRAME_LEN {
                    state.oversized = true;
                    state.line.clear();
                } else if !state.oversized {
                    state.line.extend_from_slice(chunk);
                }
                if !complete {
                    continue;
                }
                if std::mem::take(&mut state.oversized) {
                    warn!("dropping oversized control frame");
                    push_stray(&mut state.stray, b"[control frame too large]\n");
                    continue;
                }
                std::mem::take(&mut state.line)
            };
            self.dispatch_line(line);
        }
    }

    fn dispatch_line(&self, mut line: Vec<u8>) {
        if line.first() != Some(&FRAME_PREFIX) {
            line.push(b'\n');
            push_stray(&mut self.lock().stray, &line);
            return;
        }

        match serde_json::from_slice::<GuestFrame>(&line[1..]) {
            Ok(GuestFrame::Call { name, args, kwargs }) => {
                let call = ToolCall {
                    args,
                    kwargs: kwargs.into_iter().collect::<BTreeMap<_, _>>(),
                };
                let reply = self.serve_call(&name, &call);
                let mut encoded = match serde_json::to_vec(&reply) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!(tool = %name, error = %e, "failed to encode tool reply");
                        br#"{"status":"error","message":"unencodable tool result"}"#.to_vec()
                    }
                };
                encoded.push(b'\n');
                let mut state = self.lock();
                state.tool_calls += 1;
                state.replies.extend(encoded);
            }
            Ok(GuestFrame::Checkpoint(checkpoint)) => {
                self.lock().checkpoint = Some(checkpoint);
            }
            Ok(GuestFrame::Done(report)) => {
                self.lock().done = Some(report);
            }
            Err(e) => {
                warn!(error = %e, "malformed control frame");
                let text = format!("[malformed control frame: {e}]\n");
                push_stray(&mut self.lock().stray, text.as_bytes());
            }
        }
    }

    fn serve_call(&self, name: &str, call: &ToolCall) -> HostReply {
        let is_sentinel = name == &*self.final_answer_tool;
        let result = match self.tools.get(name) {
            Some(tool) => {
                debug!(tool = %name, args = call.args.len(), "invoking tool");
                invoke_contained(name, tool.as_ref(), call)
            }
            // The sentinel works without a registered tool: it returns its answer.
            None if is_sentinel => Ok(call.param("answer", 0).cloned().unwrap_or(Value::None)),
            None => Err(crate::sandbox::tools::ToolError::new(format!(
                "no tool named '{name}' is registered"
            ))),
        };

        match result {
            Ok(value) => {
                if is_sentinel {
                    self.lock().completion.mark(value.clone());
                }
                HostReply::Ok { value }
            }
            Err(err) => {
                warn!(tool = %name, error = %err, "tool call failed");
                if is_sentinel {
                    // The sentinel fired even though the tool behind it failed.
                    let answer = call.param("answer", 0).cloned().unwrap_or(Value::None);
                    self.lock().completion.mark(answer);
                }
                HostReply::Error {
                    message: err.to_string(),
                }
            }
        }
    }

    fn read_replies(&self, size: usize) -> StreamResult<Bytes> {
        let mut state = self.lock();
        if state.replies.is_empty() {
            return Err(StreamError::Closed);
        }
        let n = size.min(state.replies.len());
        let chunk: Vec<u8> = state.replies.drain(..n).collect();
        Ok(Bytes::from(chunk))
    }
}

fn push_stray(stray: &mut Vec<u8>, bytes: &[u8]) {
    let room = STRAY_CAPACITY.saturating_sub(stray.len());
    stray.extend_from_slice(&bytes[..room.min(bytes.len())]);
}

/// The guest's stderr: parses control frames as they are written.
#[derive(Clone)]
pub struct ControlChannel {
    session: BridgeSession,
}

#[async_trait::async_trait]
impl Subscribe for ControlChannel {
    async fn ready(&mut self) {}
}

impl HostOutputStream for ControlChannel {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        self.session.receive(&bytes);
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(WRITE_PERMIT)
    }
}

impl StdoutStream for ControlChannel {
    fn stream(&self) -> Box<dyn HostOutputStream> {
        Box::new(self.clone())
    }

    fn isatty(&self) -> bool {
        false
    }
}

/// The guest's stdin: the payload followed by tool replies.
#[derive(Clone)]
pub struct ReplyChannel {
    session: BridgeSession,
}

#[async_trait::async_trait]
impl Subscribe for ReplyChannel {
    async fn ready(&mut self) {}
}

impl HostInputStream for ReplyChannel {
    fn read(&mut self, size: usize) -> StreamResult<Bytes> {
        self.session.read_replies(size)
    }
}

impl StdinStream for ReplyChannel {
    fn stream(&self) -> Box<dyn HostInputStream> {
        Box::new(self.clone())
    }

    fn isatty(&self) -> bool {
        false
    }
}

/// Bundle of the three guest streams for one execution.
pub struct GuestStreams {
    /// Print sink.
    pub stdout: OutputCapture,
    /// Control frames.
    pub stderr: ControlChannel,
    /// Payload and replies.
    pub stdin: ReplyChannel,
}

impl GuestStreams {
    /// Wire a session and a capture buffer into guest streams.
    pub fn new(session: &BridgeSession, stdout: OutputCapture) -> Self {
        Self {
            stdout,
            stderr: session.control_channel(),
            stdin: session.reply_channel(),
        }
    }
}
