//! Session registry and the operations behind the MCP tools

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::session::{
    Breakpoint, DebugSession, ExecutionReport, ExpressionResult, SessionInfo, SessionStatus,
    StackFrame, StopLocation, Variable,
};
use crate::config::Config;
use crate::dap::protocol::Thread;
use crate::dap::{ClientOptions, DapClient, DebugEvent, StepKind};
use crate::error::{DebugpyError, Result};
use crate::process;

type SharedSession = Arc<Mutex<DebugSession>>;

pub struct SessionManager {
    config: Config,
    sessions: RwLock<HashMap<String, SharedSession>>,
}

impl SessionManager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn get_session(&self, session_id: &str) -> Result<SharedSession> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| DebugpyError::SessionNotFound(session_id.to_string()))
    }

    async fn check_capacity(&self) -> Result<()> {
        let sessions = self.sessions.read().await;
        if sessions.len() >= self.config.max_sessions {
            return Err(DebugpyError::SessionLimitExceeded(self.config.max_sessions));
        }
        Ok(())
    }

    async fn register(&self, session: DebugSession) -> Result<SessionInfo> {
        let info = session.info().await;
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.config.max_sessions {
            drop(sessions);
            if let Err(e) = session.client.disconnect(false).await {
                warn!("Disconnect after session limit hit (non-fatal): {}", e);
            }
            return Err(DebugpyError::SessionLimitExceeded(self.config.max_sessions));
        }
        sessions.insert(info.session_id.clone(), Arc::new(Mutex::new(session)));
        Ok(info)
    }

    // =========================================================================
    // Session management
    // =========================================================================

    pub async fn start_session(
        &self,
        host: Option<String>,
        port: Option<u16>,
        timeout_secs: Option<u64>,
    ) -> Result<SessionInfo> {
        self.check_capacity().await?;

        let host = host.unwrap_or_else(|| self.config.default_host.clone());
        let port = port.unwrap_or(self.config.default_port);
        let mut options = ClientOptions::from_config(&self.config);
        if let Some(secs) = timeout_secs.filter(|secs| *secs > 0) {
            options = options.with_connect_timeout(std::time::Duration::from_secs(secs));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let client = DapClient::connect(&session_id, &host, port, &options).await?;
        let info = self.register(DebugSession::new(session_id, host, port, client)).await?;

        info!("Session {} created for {}:{}", info.session_id, info.host, info.port);
        Ok(info)
    }

    /// Disconnect and unregister a session; the debuggee keeps running unless asked otherwise
    pub async fn stop_session(&self, session_id: &str, terminate_debuggee: bool) -> Result<SessionInfo> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(session_id)
                .ok_or_else(|| DebugpyError::SessionNotFound(session_id.to_string()))?
        };

        let session = session.lock().await;
        if let Err(e) = session.client.disconnect(terminate_debuggee).await {
            warn!("Disconnect error for session {} (non-fatal): {}", session_id, e);
        }

        info!("Session {} stopped", session_id);
        Ok(session.info().await)
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<SharedSession> = self.sessions.read().await.values().cloned().collect();

        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.lock().await.info().await);
        }
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub async fn session_status(&self, session_id: &str) -> Result<SessionStatus> {
        let session = self.get_session(session_id).await?;
        let session = session.lock().await;
        let state = session.client.snapshot().await;

        Ok(SessionStatus {
            session: session.info().await,
            breakpoints_count: session.breakpoints.len(),
            stop: state.stop,
            exit_code: state.exit_code,
            process_name: state.process_name,
        })
    }

    pub async fn debug_events(&self, session_id: &str, limit: usize) -> Result<Vec<DebugEvent>> {
        let session = self.get_session(session_id).await?;
        let session = session.lock().await;
        Ok(session.client.recent_events(limit).await)
    }

    // =========================================================================
    // Breakpoint management
    // =========================================================================

    /// Fold stops reported since the last call into the breakpoint records.
    ///
    /// Must run before a sync, which retires the adapter ids the hits name.
    async fn absorb_hits(session: &mut DebugSession) {
        let hits = session.client.take_hits().await;
        if !hits.is_empty() {
            session.breakpoints.record_hits(&hits);
        }
    }

    /// Send every enabled breakpoint of `file_path`; setBreakpoints replaces the whole file
    async fn sync_file(session: &mut DebugSession, file_path: &str) -> Result<()> {
        Self::absorb_hits(session).await;
        let ids = session.breakpoints.enabled_in_file(file_path);
        let payload = session.breakpoints.source_breakpoints(&ids);
        debug!("Syncing {} breakpoint(s) in {}", payload.len(), file_path);

        let reply = session.client.set_breakpoints(file_path, &payload).await?;
        if reply.breakpoints.len() != ids.len() {
            warn!(
                "Adapter returned {} breakpoint(s) for {} requested in {}",
                reply.breakpoints.len(), ids.len(), file_path
            );
        }
        session.breakpoints.apply_adapter_reply(&ids, &reply.breakpoints);
        Ok(())
    }

    pub async fn set_breakpoint(
        &self,
        session_id: &str,
        file_path: &str,
        line_number: u32,
        condition: Option<String>,
    ) -> Result<Breakpoint> {
        if file_path.trim().is_empty() {
            return Err(DebugpyError::InvalidBreakpoint("file_path must not be empty".to_string()));
        }
        if line_number == 0 {
            return Err(DebugpyError::InvalidBreakpoint("line numbers start at 1".to_string()));
        }
        let condition = condition
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        let session = self.get_session(session_id).await?;
        let mut session = session.lock().await;
        if !session.client.is_connected().await {
            return Err(DebugpyError::NotConnected(session_id.to_string()));
        }

        let id = session.breakpoints.insert(file_path, line_number, condition);
        if let Err(e) = Self::sync_file(&mut session, file_path).await {
            session.breakpoints.remove(id);
            return Err(match e {
                DebugpyError::RequestFailed { message, .. } => DebugpyError::InvalidBreakpoint(format!(
                    "{}:{}: {}", file_path, line_number, message
                )),
                other => other,
            });
        }

        let breakpoint = session
            .breakpoints
            .get(id)
            .cloned()
            .ok_or(DebugpyError::BreakpointNotFound(id))?;
        info!(
            "Set breakpoint {} at {}:{} (verified: {})",
            id, breakpoint.file_path, breakpoint.line_number, breakpoint.verified
        );
        Ok(breakpoint)
    }

    pub async fn clear_breakpoint(&self, session_id: &str, breakpoint_id: u32) -> Result<Breakpoint> {
        let session = self.get_session(session_id).await?;
        let mut session = session.lock().await;
        Self::absorb_hits(&mut session).await;

        let removed = session
            .breakpoints
            .remove(breakpoint_id)
            .ok_or(DebugpyError::BreakpointNotFound(breakpoint_id))?;
        if removed.is_enabled {
            let synced = Self::sync_file(&mut session, &removed.file_path).await;
            if let Err(e) = synced {
                session.breakpoints.restore(removed);
                return Err(e);
            }
        }

        info!("Cleared breakpoint {}", breakpoint_id);
        Ok(removed)
    }

    pub async fn set_breakpoint_enabled(
        &self,
        session_id: &str,
        breakpoint_id: u32,
        enabled: bool,
    ) -> Result<Breakpoint> {
        let session = self.get_session(session_id).await?;
        let mut session = session.lock().await;
        Self::absorb_hits(&mut session).await;

        let file_path = {
            let breakpoint = session
                .breakpoints
                .get_mut(breakpoint_id)
                .ok_or(DebugpyError::BreakpointNotFound(breakpoint_id))?;
            if breakpoint.is_enabled == enabled {
                return Ok(breakpoint.clone());
            }
            breakpoint.is_enabled = enabled;
            breakpoint.file_path.clone()
        };

        if let Err(e) = Self::sync_file(&mut session, &file_path).await {
            if let Some(breakpoint) = session.breakpoints.get_mut(breakpoint_id) {
                breakpoint.is_enabled = !enabled;
            }
            return Err(e);
        }
        if !enabled {
            session.breakpoints.mark_unsynced(breakpoint_id);
        }

        info!("Breakpoint {} {}", breakpoint_id, if enabled { "enabled" } else { "disabled" });
        let breakpoint = session
            .breakpoints
            .get(breakpoint_id)
            .cloned()
            .ok_or(DebugpyError::BreakpointNotFound(breakpoint_id))?;
        Ok(breakpoint)
    }

    pub async fn list_breakpoints(&self, session_id: &str) -> Result<Vec<Breakpoint>> {
        let session = self.get_session(session_id).await?;
        let mut session = session.lock().await;
        Self::absorb_hits(&mut session).await;

        Ok(session.breakpoints.iter().cloned().collect())
    }

    // =========================================================================
    // Execution control
    // =========================================================================

    /// Explicit thread, else the stopped thread, else the first thread the adapter reports
    async fn resolve_thread(client: &DapClient, requested: Option<i64>) -> Result<i64> {
        if let Some(thread_id) = requested {
            return Ok(thread_id);
        }
        if let Some(thread_id) = client.current_stop().await.and_then(|stop| stop.thread_id) {
            return Ok(thread_id);
        }
        client
            .threads()
            .await?
            .threads
            .first()
            .map(|thread| thread.id)
            .ok_or(DebugpyError::NoThreads)
    }

    async fn top_frame(client: &DapClient, thread_id: i64) -> Result<StackFrame> {
        client
            .stack_trace(thread_id, Some(1))
            .await?
            .stack_frames
            .into_iter()
            .next()
            .map(StackFrame::from)
            .ok_or(DebugpyError::NoFrames(thread_id))
    }

    async fn await_stop(&self, client: &DapClient, stops: &mut watch::Receiver<u64>) -> Option<StopLocation> {
        if !DapClient::wait_for_stop(stops, self.config.stop_wait()).await {
            return None;
        }
        let stop = client.current_stop().await?;
        let frame = match stop.thread_id {
            Some(thread_id) => Self::top_frame(client, thread_id).await.ok(),
            None => None,
        };
        Some(StopLocation {
            reason: stop.reason,
            description: stop.description,
            thread_id: stop.thread_id,
            frame,
        })
    }

    pub async fn continue_execution(&self, session_id: &str, thread_id: Option<i64>) -> Result<ExecutionReport> {
        let session = self.get_session(session_id).await?;
        let session = session.lock().await;

        let thread_id = Self::resolve_thread(&session.client, thread_id).await?;
        let mut stops = session.client.subscribe_stops();
        session.client.continue_thread(thread_id).await?;
        let stopped = self.await_stop(&session.client, &mut stops).await;

        info!("Session {}: continued thread {}", session_id, thread_id);
        Ok(ExecutionReport {
            session_id: session_id.to_string(),
            action: "continue".to_string(),
            thread_id,
            stopped,
        })
    }

    pub async fn step(&self, session_id: &str, kind: StepKind, thread_id: Option<i64>) -> Result<ExecutionReport> {
        let session = self.get_session(session_id).await?;
        let session = session.lock().await;

        let thread_id = Self::resolve_thread(&session.client, thread_id).await?;
        let mut stops = session.client.subscribe_stops();
        session.client.step(kind, thread_id).await?;
        let stopped = self.await_stop(&session.client, &mut stops).await;

        let action = match kind {
            StepKind::Into => "step_into",
            StepKind::Over => "step_over",
            StepKind::Out => "step_out",
        };
        info!("Session {}: {} on thread {}", session_id, action, thread_id);
        Ok(ExecutionReport {
            session_id: session_id.to_string(),
            action: action.to_string(),
            thread_id,
            stopped,
        })
    }

    pub async fn pause_execution(&self, session_id: &str, thread_id: Option<i64>) -> Result<ExecutionReport> {
        let session = self.get_session(session_id).await?;
        let session = session.lock().await;

        let thread_id = Self::resolve_thread(&session.client, thread_id).await?;
        let mut stops = session.client.subscribe_stops();
        session.client.pause(thread_id).await?;
        let stopped = self.await_stop(&session.client, &mut stops).await;

        info!("Session {}: paused thread {}", session_id, thread_id);
        Ok(ExecutionReport {
            session_id: session_id.to_string(),
            action: "pause".to_string(),
            thread_id,
            stopped,
        })
    }

    pub async fn list_threads(&self, session_id: &str) -> Result<Vec<Thread>> {
        let session = self.get_session(session_id).await?;
        let session = session.lock().await;
        Ok(session.client.threads().await?.threads)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub async fn inspect_stack(
        &self,
        session_id: &str,
        thread_id: Option<i64>,
        levels: Option<i64>,
    ) -> Result<(i64, Vec<StackFrame>)> {
        let session = self.get_session(session_id).await?;
        let session = session.lock().await;

        let thread_id = Self::resolve_thread(&session.client, thread_id).await?;
        let body = session.client.stack_trace(thread_id, levels.filter(|l| *l > 0)).await?;
        let frames = body.stack_frames.into_iter().map(StackFrame::from).collect();
        Ok((thread_id, frames))
    }

    pub async fn inspect_variables(&self, session_id: &str, frame_id: Option<i64>) -> Result<(i64, Vec<Variable>)> {
        let session = self.get_session(session_id).await?;
        let session = session.lock().await;
        let client = &session.client;

        let frame_id = match frame_id {
            Some(frame_id) => frame_id,
            None => {
                let thread_id = Self::resolve_thread(client, None).await?;
                Self::top_frame(client, thread_id).await?.frame_id
            }
        };

        let mut variables = Vec::new();
        for scope in client.scopes(frame_id).await?.scopes {
            if scope.variables_reference <= 0 {
                continue;
            }
            let body = client.variables(scope.variables_reference).await?;
            variables.extend(
                body.variables
                    .into_iter()
                    .map(|variable| Variable::from_dap(variable, &scope.name)),
            );
        }

        debug!("Frame {} has {} variable(s)", frame_id, variables.len());
        Ok((frame_id, variables))
    }

    /// Adapter-rejected expressions come back as an error *result*, not an `Err`
    pub async fn evaluate_expression(
        &self,
        session_id: &str,
        expression: &str,
        frame_id: Option<i64>,
        context: Option<String>,
    ) -> Result<ExpressionResult> {
        let session = self.get_session(session_id).await?;
        let session = session.lock().await;
        let client = &session.client;

        let frame_id = match frame_id {
            Some(frame_id) => Some(frame_id),
            None => match client.current_stop().await.and_then(|stop| stop.thread_id) {
                Some(thread_id) => Self::top_frame(client, thread_id).await.ok().map(|f| f.frame_id),
                None => None,
            },
        };
        let context = context.unwrap_or_else(|| "repl".to_string());

        match client.evaluate(expression, frame_id, &context).await {
            Ok(body) => Ok(ExpressionResult {
                expression: expression.to_string(),
                result: body.result,
                type_name: body.type_name.unwrap_or_else(|| "unknown".to_string()),
                is_error: false,
                error_message: None,
            }),
            Err(DebugpyError::RequestFailed { message, .. }) => {
                debug!("Expression '{}' failed: {}", expression, message);
                Ok(ExpressionResult {
                    expression: expression.to_string(),
                    result: String::new(),
                    type_name: "error".to_string(),
                    is_error: true,
                    error_message: Some(message),
                })
            }
            Err(DebugpyError::Protocol(message)) => Err(DebugpyError::EvaluationFailed(message)),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Process management
    // =========================================================================

    /// Attach to a running Python process, injecting debugpy when it has no listener
    pub async fn attach_to_process(
        &self,
        process_id: u32,
        host: Option<String>,
        port: Option<u16>,
    ) -> Result<SessionInfo> {
        self.check_capacity().await?;

        let target = process::find_python_process(process_id).await?;
        let host = host.unwrap_or_else(|| self.config.default_host.clone());
        let options = ClientOptions::from_config(&self.config);

        let port = match (port, target.debugpy_port) {
            (None, Some(existing)) => {
                info!("PID {} already listens on port {}", process_id, existing);
                existing
            }
            (requested, _) => {
                let port = requested.unwrap_or(self.config.default_port);
                process::inject_debugpy(
                    &self.config.python_path,
                    process_id,
                    &host,
                    port,
                    self.config.connect_timeout(),
                ).await?;
                port
            }
        };

        let session_id = uuid::Uuid::new_v4().to_string();
        let client = DapClient::connect_with_retry(&session_id, &host, port, &options)
            .await
            .map_err(|e| DebugpyError::AttachFailed { pid: process_id, reason: e.to_string() })?;

        let mut session = DebugSession::new(session_id, host, port, client);
        session.attached_pid = Some(process_id);
        let info = self.register(session).await?;

        info!("Attached session {} to PID {}", info.session_id, process_id);
        Ok(info)
    }

    /// Leave the process running and drop the session
    pub async fn detach_from_process(&self, session_id: &str) -> Result<SessionInfo> {
        self.stop_session(session_id, false).await
    }

    /// Disconnect every session, leaving debuggees running
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, SharedSession)> = self.sessions.write().await.drain().collect();
        for (session_id, session) in sessions {
            let session = session.lock().await;
            if let Err(e) = session.client.disconnect(false).await {
                warn!("Disconnect error for session {} during shutdown: {}", session_id, e);
            }
        }
    }
}
