//! DAP client for a debugpy adapter reached over TCP
//!
//! One `DapClient` owns one connection. A background reader task routes
//! responses to waiting requests by `request_seq` and folds adapter events
//! into an [`AdapterState`] that the session manager reads.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{
    encode, read_message, ContinuedEventBody, EvaluateBody, Event, ExitedEventBody, Message,
    ProcessEventBody, Request, Response, ScopesBody, SetBreakpointsBody, Source,
    SourceBreakpoint, StackTraceBody, StoppedEventBody, ThreadsBody, VariablesBody,
};
use crate::config::Config;
use crate::error::{DebugpyError, Result};

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Response>>>>;

/// Connection tuning taken from the server configuration
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_events: usize,
    pub just_my_code: bool,
}

impl ClientOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            max_events: config.max_events,
            just_my_code: config.just_my_code,
        }
    }

    /// Same options with a different connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Execution state of the debuggee as seen through adapter events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Connected,
    Running,
    Stopped,
    Terminated,
    Disconnected,
}

/// Details of the most recent `stopped` event
#[derive(Debug, Clone, Serialize)]
pub struct StopInfo {
    pub thread_id: Option<i64>,
    pub reason: String,
    pub description: Option<String>,
    pub all_threads_stopped: bool,
}

/// An adapter event retained for `get_debug_events`
#[derive(Debug, Clone, Serialize)]
pub struct DebugEvent {
    pub event_type: String,
    pub session_id: String,
    pub data: Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct AdapterState {
    pub run_state: RunState,
    pub stop: Option<StopInfo>,
    pub process_id: Option<u32>,
    pub process_name: Option<String>,
    pub exit_code: Option<i64>,
    /// Adapter breakpoint id -> stops naming it, not yet folded into the session's breakpoints
    pub pending_hits: HashMap<i64, u32>,
    pub capabilities: Value,
    pub events: VecDeque<DebugEvent>,
    max_events: usize,
}

/// What the reader must signal after folding an event into the state
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EventOutcome {
    pub stopped: bool,
    pub initialized: bool,
}

impl AdapterState {
    pub fn new(max_events: usize) -> Self {
        Self {
            run_state: RunState::Connected,
            stop: None,
            process_id: None,
            process_name: None,
            exit_code: None,
            pending_hits: HashMap::new(),
            capabilities: Value::Null,
            events: VecDeque::new(),
            max_events,
        }
    }

    pub fn apply_event(&mut self, session_id: &str, event: &Event) -> EventOutcome {
        let mut outcome = EventOutcome::default();

        match event.event.as_str() {
            "initialized" => outcome.initialized = true,
            "stopped" => {
                let body: StoppedEventBody = event.body_as().unwrap_or_default();
                for id in &body.hit_breakpoint_ids {
                    *self.pending_hits.entry(*id).or_insert(0) += 1;
                }
                self.run_state = RunState::Stopped;
                self.stop = Some(StopInfo {
                    thread_id: body.thread_id,
                    reason: body.reason,
                    description: body.description,
                    all_threads_stopped: body.all_threads_stopped,
                });
                outcome.stopped = true;
            }
            "continued" => {
                let body: ContinuedEventBody = event.body_as().unwrap_or_default();
                let same_thread = match (&self.stop, body.thread_id) {
                    (Some(stop), Some(thread_id)) => stop.thread_id == Some(thread_id),
                    _ => true,
                };
                if body.all_threads_continued.unwrap_or(true) || same_thread {
                    self.run_state = RunState::Running;
                    self.stop = None;
                }
            }
            "process" => {
                let body: ProcessEventBody = event.body_as().unwrap_or_default();
                self.process_id = body.system_process_id.or(self.process_id);
                if !body.name.is_empty() {
                    self.process_name = Some(body.name);
                }
            }
            "exited" => {
                let body: ExitedEventBody = event.body_as().unwrap_or_default();
                self.exit_code = Some(body.exit_code);
            }
            "terminated" => {
                self.run_state = RunState::Terminated;
                self.stop = None;
            }
            _ => {}
        }

        self.push_event(DebugEvent {
            event_type: event.event.clone(),
            session_id: session_id.to_string(),
            data: event.body.clone().unwrap_or_else(|| json!({})),
            timestamp: chrono::Utc::now(),
        });

        outcome
    }

    fn push_event(&mut self, event: DebugEvent) {
        if self.max_events == 0 {
            return;
        }
        self.events.push_back(event);
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
    }

    fn mark_running(&mut self) {
        if matches!(self.run_state, RunState::Connected | RunState::Stopped | RunState::Running) {
            self.run_state = RunState::Running;
            self.stop = None;
        }
    }
}

/// Stepping granularity requested by the execution-control tools
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Into,
    Over,
    Out,
}

impl StepKind {
    pub fn command(&self) -> &'static str {
        match self {
            StepKind::Into => "stepIn",
            StepKind::Over => "next",
            StepKind::Out => "stepOut",
        }
    }
}

struct ReaderContext {
    session_id: String,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pending: PendingMap,
    next_seq: Arc<AtomicI64>,
    state: Arc<Mutex<AdapterState>>,
    stop_tx: Arc<watch::Sender<u64>>,
    initialized: Arc<Notify>,
}

pub struct DapClient {
    session_id: String,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pending: PendingMap,
    next_seq: Arc<AtomicI64>,
    state: Arc<Mutex<AdapterState>>,
    stop_tx: Arc<watch::Sender<u64>>,
    initialized: Arc<Notify>,
    reader_task: JoinHandle<()>,
    request_timeout: Duration,
}

impl DapClient {
    /// Connect to a debugpy adapter and run the attach handshake
    pub async fn connect(
        session_id: &str,
        host: &str,
        port: u16,
        options: &ClientOptions,
    ) -> Result<Self> {
        info!("Connecting to debugpy at {}:{}", host, port);

        let stream = match tokio::time::timeout(options.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(DebugpyError::ConnectionFailed(format!(
                    "Failed to connect to {}:{}: {}", host, port, e
                )));
            }
            Err(_) => {
                return Err(DebugpyError::ConnectionFailed(format!(
                    "Timed out connecting to {}:{} after {:?}", host, port, options.connect_timeout
                )));
            }
        };

        Self::attach_stream(session_id, stream, options).await
    }

    /// Connect, retrying with backoff until the listener comes up
    pub async fn connect_with_retry(
        session_id: &str,
        host: &str,
        port: u16,
        options: &ClientOptions,
    ) -> Result<Self> {
        let start = tokio::time::Instant::now();
        let mut delay = Duration::from_millis(50);

        let stream = loop {
            match TcpStream::connect((host, port)).await {
                Ok(stream) => break stream,
                Err(_) if start.elapsed() < options.connect_timeout => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_millis(500));
                }
                Err(e) => {
                    return Err(DebugpyError::ConnectionFailed(format!(
                        "Failed to connect to {}:{} after {:?}: {}",
                        host, port, options.connect_timeout, e
                    )));
                }
            }
        };

        Self::attach_stream(session_id, stream, options).await
    }

    async fn attach_stream(session_id: &str, stream: TcpStream, options: &ClientOptions) -> Result<Self> {
        let _ = stream.set_nodelay(true);
        let client = Self::from_stream(session_id, stream, options);
        client.handshake(options).await?;
        info!("Session {} attached to debug adapter", session_id);
        Ok(client)
    }

    fn from_stream(session_id: &str, stream: TcpStream, options: &ClientOptions) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (stop_tx, _) = watch::channel(0u64);

        let writer = Arc::new(Mutex::new(write_half));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let next_seq = Arc::new(AtomicI64::new(1));
        let state = Arc::new(Mutex::new(AdapterState::new(options.max_events)));
        let stop_tx = Arc::new(stop_tx);
        let initialized = Arc::new(Notify::new());

        let context = ReaderContext {
            session_id: session_id.to_string(),
            writer: writer.clone(),
            pending: pending.clone(),
            next_seq: next_seq.clone(),
            state: state.clone(),
            stop_tx: stop_tx.clone(),
            initialized: initialized.clone(),
        };
        let reader_task = tokio::spawn(reader_loop(BufReader::new(read_half), context));

        Self {
            session_id: session_id.to_string(),
            writer,
            pending,
            next_seq,
            state,
            stop_tx,
            initialized,
            reader_task,
            request_timeout: options.request_timeout,
        }
    }

    /// initialize -> attach -> (initialized event) -> configurationDone -> attach response.
    ///
    /// debugpy withholds the attach response until configuration is done.
    async fn handshake(&self, options: &ClientOptions) -> Result<()> {
        let init = self.send_request("initialize", json!({
            "clientID": "debugpy-mcp",
            "clientName": "debugpy MCP server",
            "adapterID": "python",
            "pathFormat": "path",
            "linesStartAt1": true,
            "columnsStartAt1": true,
            "supportsVariableType": true,
            "supportsVariablePaging": true,
            "supportsRunInTerminalRequest": false,
            "supportsMemoryReferences": false,
            "supportsProgressReporting": false,
            "supportsInvalidatedEvent": false,
        })).await?;
        self.state.lock().await.capabilities = init.body.unwrap_or(Value::Null);

        let (attach_seq, mut attach_rx) = self.begin_request("attach", json!({
            "name": "debugpy-mcp",
            "type": "python",
            "request": "attach",
            "justMyCode": options.just_my_code,
        })).await?;

        let early_attach = tokio::select! {
            _ = self.initialized.notified() => None,
            response = &mut attach_rx => Some(response),
            _ = tokio::time::sleep(options.connect_timeout) => {
                warn!("No 'initialized' event from adapter; sending configurationDone anyway");
                None
            }
        };

        if let Some(response) = early_attach {
            let response = response.map_err(|_| DebugpyError::ConnectionClosed)?;
            check_response("attach", response)?;
            self.send_request("configurationDone", json!({})).await?;
            return Ok(());
        }

        self.send_request("configurationDone", json!({})).await?;
        self.await_response("attach", attach_seq, attach_rx, self.request_timeout).await?;
        Ok(())
    }

    async fn begin_request(
        &self,
        command: &str,
        arguments: Value,
    ) -> Result<(i64, oneshot::Receiver<Response>)> {
        if self.state.lock().await.run_state == RunState::Disconnected {
            return Err(DebugpyError::NotConnected(self.session_id.clone()));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let framed = encode(&Message::Request(Request {
            seq,
            command: command.to_string(),
            arguments: Some(arguments),
        }))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&framed).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.pending.lock().await.remove(&seq);
            return Err(DebugpyError::ConnectionFailed(format!(
                "Failed to send DAP request '{}': {}", command, e
            )));
        }

        debug!("DAP request '{}' (seq {})", command, seq);
        Ok((seq, rx))
    }

    async fn await_response(
        &self,
        command: &str,
        seq: i64,
        rx: oneshot::Receiver<Response>,
        wait: Duration,
    ) -> Result<Response> {
        let response = match tokio::time::timeout(wait, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(DebugpyError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                return Err(DebugpyError::Timeout(command.to_string()));
            }
        };
        check_response(command, response)
    }

    /// Send a request and wait for its successful response
    pub async fn send_request(&self, command: &str, arguments: Value) -> Result<Response> {
        let (seq, rx) = self.begin_request(command, arguments).await?;
        self.await_response(command, seq, rx, self.request_timeout).await
    }

    pub async fn set_breakpoints(
        &self,
        file_path: &str,
        breakpoints: &[SourceBreakpoint],
    ) -> Result<SetBreakpointsBody> {
        let source = Source { name: None, path: Some(file_path.to_string()) };
        let response = self.send_request("setBreakpoints", json!({
            "source": source,
            "breakpoints": breakpoints,
        })).await?;
        response.body_as()
    }

    pub async fn threads(&self) -> Result<ThreadsBody> {
        self.send_request("threads", json!({})).await?.body_as()
    }

    pub async fn stack_trace(&self, thread_id: i64, levels: Option<i64>) -> Result<StackTraceBody> {
        let mut arguments = json!({ "threadId": thread_id, "startFrame": 0 });
        if let Some(levels) = levels {
            arguments["levels"] = json!(levels);
        }
        self.send_request("stackTrace", arguments).await?.body_as()
    }

    pub async fn scopes(&self, frame_id: i64) -> Result<ScopesBody> {
        self.send_request("scopes", json!({ "frameId": frame_id })).await?.body_as()
    }

    pub async fn variables(&self, variables_reference: i64) -> Result<VariablesBody> {
        self.send_request("variables", json!({ "variablesReference": variables_reference }))
            .await?
            .body_as()
    }

    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
        context: &str,
    ) -> Result<EvaluateBody> {
        let mut arguments = json!({ "expression": expression, "context": context });
        if let Some(frame_id) = frame_id {
            arguments["frameId"] = json!(frame_id);
        }
        self.send_request("evaluate", arguments).await?.body_as()
    }

    pub async fn continue_thread(&self, thread_id: i64) -> Result<()> {
        self.resume_request("continue", thread_id).await
    }

    pub async fn step(&self, kind: StepKind, thread_id: i64) -> Result<()> {
        self.resume_request(kind.command(), thread_id).await
    }

    pub async fn pause(&self, thread_id: i64) -> Result<()> {
        self.send_request("pause", json!({ "threadId": thread_id })).await?;
        Ok(())
    }

    /// Resume-type requests flip the state to running before the request is
    /// written so a racing `stopped` event is never overwritten.
    async fn resume_request(&self, command: &str, thread_id: i64) -> Result<()> {
        let previous = {
            let mut state = self.state.lock().await;
            let previous = (state.run_state, state.stop.clone());
            state.mark_running();
            previous
        };

        match self.send_request(command, json!({ "threadId": thread_id })).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let mut state = self.state.lock().await;
                if state.run_state == RunState::Running {
                    state.run_state = previous.0;
                    state.stop = previous.1;
                }
                Err(e)
            }
        }
    }

    /// Subscribe to stop notifications; only stops after this call count
    pub fn subscribe_stops(&self) -> watch::Receiver<u64> {
        self.stop_tx.subscribe()
    }

    /// Wait for a `stopped` event newer than the subscription, up to `wait`
    pub async fn wait_for_stop(stops: &mut watch::Receiver<u64>, wait: Duration) -> bool {
        matches!(tokio::time::timeout(wait, stops.changed()).await, Ok(Ok(())))
    }

    pub async fn current_stop(&self) -> Option<StopInfo> {
        self.state.lock().await.stop.clone()
    }

    /// Drain the hits recorded since the last call
    pub async fn take_hits(&self) -> HashMap<i64, u32> {
        std::mem::take(&mut self.state.lock().await.pending_hits)
    }

    pub async fn snapshot(&self) -> AdapterState {
        self.state.lock().await.clone()
    }

    pub async fn recent_events(&self, limit: usize) -> Vec<DebugEvent> {
        let state = self.state.lock().await;
        let skip = state.events.len().saturating_sub(limit);
        state.events.iter().skip(skip).cloned().collect()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.run_state != RunState::Disconnected
    }

    /// Send `disconnect` (best effort) and tear the connection down
    pub async fn disconnect(&self, terminate_debuggee: bool) -> Result<()> {
        let result = if self.is_connected().await {
            let wait = self.request_timeout.min(Duration::from_secs(2));
            match self.begin_request("disconnect", json!({
                "restart": false,
                "terminateDebuggee": terminate_debuggee,
            })).await {
                Ok((seq, rx)) => self.await_response("disconnect", seq, rx, wait).await.map(|_| ()),
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };

        self.reader_task.abort();
        let _ = self.writer.lock().await.shutdown().await;
        self.state.lock().await.run_state = RunState::Disconnected;
        self.pending.lock().await.clear();

        info!("Session {} disconnected from debug adapter", self.session_id);
        result
    }
}

impl Drop for DapClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn check_response(command: &str, response: Response) -> Result<Response> {
    if response.success {
        Ok(response)
    } else {
        Err(DebugpyError::RequestFailed {
            command: command.to_string(),
            message: response.message.unwrap_or_else(|| "unknown adapter error".to_string()),
        })
    }
}

async fn reader_loop(mut reader: BufReader<OwnedReadHalf>, context: ReaderContext) {
    loop {
        let message = match read_message(&mut reader).await {
            Ok(message) => message,
            Err(DebugpyError::ConnectionClosed) => {
                info!("Debug adapter closed the connection for session {}", context.session_id);
                break;
            }
            Err(e) => {
                warn!("Reader error for session {}: {}", context.session_id, e);
                break;
            }
        };

        match message {
            Message::Response(response) => {
                let waiter = context.pending.lock().await.remove(&response.request_seq);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!("Dropping response to unknown request {}", response.request_seq),
                }
            }
            Message::Event(event) => {
                if matches!(event.event.as_str(), "stopped" | "continued" | "terminated" | "exited") {
                    info!("DAP event '{}' for session {}: {:?}", event.event, context.session_id, event.body);
                } else {
                    debug!("DAP event '{}' for session {}", event.event, context.session_id);
                }

                let outcome = context.state.lock().await.apply_event(&context.session_id, &event);
                if outcome.stopped {
                    context.stop_tx.send_modify(|generation| *generation += 1);
                }
                if outcome.initialized {
                    context.initialized.notify_one();
                }
            }
            Message::Request(request) => {
                warn!("Rejecting unsupported reverse request '{}'", request.command);
                let reply = Message::Response(Response {
                    seq: context.next_seq.fetch_add(1, Ordering::SeqCst),
                    request_seq: request.seq,
                    success: false,
                    command: request.command,
                    message: Some("not supported by debugpy-mcp".to_string()),
                    body: None,
                });
                if let Ok(framed) = encode(&reply) {
                    let mut writer = context.writer.lock().await;
                    if let Err(e) = writer.write_all(&framed).await {
                        warn!("Failed to reject reverse request: {}", e);
                    }
                }
            }
        }
    }

    context.state.lock().await.run_state = RunState::Disconnected;
    // dropping the senders fails every waiting request with ConnectionClosed
    context.pending.lock().await.clear();
}
