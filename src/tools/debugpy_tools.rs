//! RMCP 0.3.2 tool handler for debugging Python programs through debugpy

use rmcp::{
    tool, tool_handler, tool_router, ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::*,
    ErrorData as McpError,
    service::RequestContext,
    RoleServer,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::types::*;
use crate::config::Config;
use crate::dap::StepKind;
use crate::debugger::SessionManager;
use crate::{process, source};

/// Tool handler exposing all debugpy debugging tools
#[derive(Clone)]
pub struct DebugpyToolHandler {
    #[allow(dead_code)]
    tool_router: ToolRouter<DebugpyToolHandler>,
    manager: Arc<SessionManager>,
}

impl DebugpyToolHandler {
    pub fn new(config: Config) -> Self {
        Self {
            tool_router: Self::tool_router(),
            manager: Arc::new(SessionManager::new(config)),
        }
    }

    pub fn manager(&self) -> Arc<SessionManager> {
        self.manager.clone()
    }
}

impl Default for DebugpyToolHandler {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

/// Pretty JSON text content with `"success": true` merged in
fn success(mut data: Value) -> Result<CallToolResult, McpError> {
    if let Value::Object(map) = &mut data {
        map.insert("success".to_string(), Value::Bool(true));
    }
    let text = serde_json::to_string_pretty(&data).map_err(|e| {
        McpError::internal_error(format!("Serialization error: {}", e), None)
    })?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, McpError> {
    serde_json::to_value(value).map_err(|e| {
        McpError::internal_error(format!("Serialization error: {}", e), None)
    })
}

#[tool_router]
impl DebugpyToolHandler {
    // =============================================================================
    // Session Management Tools (4 tools)
    // =============================================================================

    #[tool(description = "Connect to a debugpy adapter listening on host:port and start a debug session")]
    async fn start_debug_session(&self, Parameters(args): Parameters<StartDebugSessionArgs>) -> Result<CallToolResult, McpError> {
        debug!("Starting debug session (host: {:?}, port: {:?})", args.host, args.port);

        let session = self.manager
            .start_session(args.host, args.port, args.timeout)
            .await
            .inspect_err(|e| error!("Failed to start debug session: {}", e))?;

        success(json!({
            "session_id": session.session_id,
            "session": to_value(&session)?,
            "message": format!("Debug session connected to {}:{}", session.host, session.port),
        }))
    }

    #[tool(description = "Stop a debug session and disconnect from debugpy; the debugged process keeps running unless terminate_debuggee is set")]
    async fn stop_debug_session(&self, Parameters(args): Parameters<StopDebugSessionArgs>) -> Result<CallToolResult, McpError> {
        debug!("Stopping debug session {}", args.session_id);

        let session = self.manager.stop_session(&args.session_id, args.terminate_debuggee).await?;
        success(json!({
            "session_id": session.session_id,
            "message": format!("Debug session {} stopped", session.session_id),
        }))
    }

    #[tool(description = "List all active debug sessions")]
    async fn list_debug_sessions(&self, Parameters(_args): Parameters<ListDebugSessionsArgs>) -> Result<CallToolResult, McpError> {
        debug!("Listing debug sessions");

        let sessions = self.manager.list_sessions().await;
        success(json!({
            "count": sessions.len(),
            "sessions": to_value(&sessions)?,
        }))
    }

    #[tool(description = "Get the status of a debug session: connection, run state, current stop and breakpoint count")]
    async fn get_session_status(&self, Parameters(args): Parameters<GetSessionStatusArgs>) -> Result<CallToolResult, McpError> {
        debug!("Getting status of session {}", args.session_id);

        let status = self.manager.session_status(&args.session_id).await?;
        success(json!({ "status": to_value(&status)? }))
    }

    // =============================================================================
    // Breakpoint Management Tools (5 tools)
    // =============================================================================

    #[tool(description = "Set a breakpoint at a line of a Python file, optionally with a condition")]
    async fn set_breakpoint(&self, Parameters(args): Parameters<SetBreakpointArgs>) -> Result<CallToolResult, McpError> {
        debug!("Setting breakpoint at {}:{} in session {}", args.file_path, args.line_number, args.session_id);

        let breakpoint = self.manager
            .set_breakpoint(&args.session_id, &args.file_path, args.line_number, args.condition)
            .await?;
        let message = if breakpoint.verified {
            format!("Breakpoint {} set at {}:{}", breakpoint.breakpoint_id, breakpoint.file_path, breakpoint.line_number)
        } else {
            format!(
                "Breakpoint {} registered at {}:{} but not verified by debugpy{}",
                breakpoint.breakpoint_id,
                breakpoint.file_path,
                breakpoint.line_number,
                breakpoint.message.as_deref().map(|m| format!(": {}", m)).unwrap_or_default()
            )
        };

        success(json!({
            "breakpoint_id": breakpoint.breakpoint_id,
            "breakpoint": to_value(&breakpoint)?,
            "message": message,
        }))
    }

    #[tool(description = "Remove a breakpoint")]
    async fn clear_breakpoint(&self, Parameters(args): Parameters<BreakpointArgs>) -> Result<CallToolResult, McpError> {
        debug!("Clearing breakpoint {} in session {}", args.breakpoint_id, args.session_id);

        let breakpoint = self.manager.clear_breakpoint(&args.session_id, args.breakpoint_id).await?;
        success(json!({
            "breakpoint_id": breakpoint.breakpoint_id,
            "message": format!("Breakpoint {} cleared", breakpoint.breakpoint_id),
        }))
    }

    #[tool(description = "List all breakpoints of a session with their verification state and hit counts")]
    async fn list_breakpoints(&self, Parameters(args): Parameters<ListBreakpointsArgs>) -> Result<CallToolResult, McpError> {
        debug!("Listing breakpoints in session {}", args.session_id);

        let breakpoints = self.manager.list_breakpoints(&args.session_id).await?;
        success(json!({
            "count": breakpoints.len(),
            "breakpoints": to_value(&breakpoints)?,
        }))
    }

    #[tool(description = "Re-enable a disabled breakpoint")]
    async fn enable_breakpoint(&self, Parameters(args): Parameters<BreakpointArgs>) -> Result<CallToolResult, McpError> {
        debug!("Enabling breakpoint {} in session {}", args.breakpoint_id, args.session_id);

        let breakpoint = self.manager
            .set_breakpoint_enabled(&args.session_id, args.breakpoint_id, true)
            .await?;
        success(json!({
            "breakpoint": to_value(&breakpoint)?,
            "message": format!("Breakpoint {} enabled", breakpoint.breakpoint_id),
        }))
    }

    #[tool(description = "Disable a breakpoint without removing it")]
    async fn disable_breakpoint(&self, Parameters(args): Parameters<BreakpointArgs>) -> Result<CallToolResult, McpError> {
        debug!("Disabling breakpoint {} in session {}", args.breakpoint_id, args.session_id);

        let breakpoint = self.manager
            .set_breakpoint_enabled(&args.session_id, args.breakpoint_id, false)
            .await?;
        success(json!({
            "breakpoint": to_value(&breakpoint)?,
            "message": format!("Breakpoint {} disabled", breakpoint.breakpoint_id),
        }))
    }

    // =============================================================================
    // Execution Control Tools (6 tools)
    // =============================================================================

    #[tool(description = "Resume execution until the next breakpoint; reports where the program stopped, if it did")]
    async fn continue_execution(&self, Parameters(args): Parameters<ExecutionArgs>) -> Result<CallToolResult, McpError> {
        debug!("Continuing session {}", args.session_id);

        let report = self.manager.continue_execution(&args.session_id, args.thread_id).await?;
        success(json!({ "execution": to_value(&report)? }))
    }

    #[tool(description = "Step into the function call on the current line")]
    async fn step_into(&self, Parameters(args): Parameters<ExecutionArgs>) -> Result<CallToolResult, McpError> {
        debug!("Step into in session {}", args.session_id);

        let report = self.manager.step(&args.session_id, StepKind::Into, args.thread_id).await?;
        success(json!({ "execution": to_value(&report)? }))
    }

    #[tool(description = "Step over the current line")]
    async fn step_over(&self, Parameters(args): Parameters<ExecutionArgs>) -> Result<CallToolResult, McpError> {
        debug!("Step over in session {}", args.session_id);

        let report = self.manager.step(&args.session_id, StepKind::Over, args.thread_id).await?;
        success(json!({ "execution": to_value(&report)? }))
    }

    #[tool(description = "Step out of the current function")]
    async fn step_out(&self, Parameters(args): Parameters<ExecutionArgs>) -> Result<CallToolResult, McpError> {
        debug!("Step out in session {}", args.session_id);

        let report = self.manager.step(&args.session_id, StepKind::Out, args.thread_id).await?;
        success(json!({ "execution": to_value(&report)? }))
    }

    #[tool(description = "Pause a running program")]
    async fn pause_execution(&self, Parameters(args): Parameters<ExecutionArgs>) -> Result<CallToolResult, McpError> {
        debug!("Pausing session {}", args.session_id);

        let report = self.manager.pause_execution(&args.session_id, args.thread_id).await?;
        success(json!({ "execution": to_value(&report)? }))
    }

    #[tool(description = "List the threads of the debugged program")]
    async fn list_threads(&self, Parameters(args): Parameters<ListThreadsArgs>) -> Result<CallToolResult, McpError> {
        debug!("Listing threads in session {}", args.session_id);

        let threads = self.manager.list_threads(&args.session_id).await?;
        success(json!({
            "count": threads.len(),
            "threads": threads.iter().map(|t| json!({"thread_id": t.id, "name": t.name})).collect::<Vec<_>>(),
        }))
    }

    // =============================================================================
    // Inspection Tools (5 tools)
    // =============================================================================

    #[tool(description = "List the variables visible in a stack frame (default: the top frame)")]
    async fn inspect_variables(&self, Parameters(args): Parameters<InspectVariablesArgs>) -> Result<CallToolResult, McpError> {
        debug!("Inspecting variables in session {} (frame: {:?})", args.session_id, args.frame_id);

        let (frame_id, variables) = self.manager.inspect_variables(&args.session_id, args.frame_id).await?;
        success(json!({
            "frame_id": frame_id,
            "count": variables.len(),
            "variables": to_value(&variables)?,
        }))
    }

    #[tool(description = "Get the call stack of a thread, innermost frame first")]
    async fn inspect_stack(&self, Parameters(args): Parameters<InspectStackArgs>) -> Result<CallToolResult, McpError> {
        debug!("Inspecting stack in session {} (thread: {:?})", args.session_id, args.thread_id);

        let (thread_id, frames) = self.manager
            .inspect_stack(&args.session_id, args.thread_id, args.levels)
            .await?;
        success(json!({
            "thread_id": thread_id,
            "count": frames.len(),
            "frames": to_value(&frames)?,
        }))
    }

    #[tool(description = "Evaluate a Python expression in the context of a stack frame")]
    async fn evaluate_expression(&self, Parameters(args): Parameters<EvaluateExpressionArgs>) -> Result<CallToolResult, McpError> {
        debug!("Evaluating '{}' in session {}", args.expression, args.session_id);

        if args.expression.trim().is_empty() {
            return Err(McpError::invalid_params("expression must not be empty".to_string(), None));
        }
        let result = self.manager
            .evaluate_expression(&args.session_id, &args.expression, args.frame_id, args.context)
            .await?;
        success(json!({ "result": to_value(&result)? }))
    }

    #[tool(description = "Show the lines of a source file around a given line")]
    async fn get_source_code(&self, Parameters(args): Parameters<GetSourceCodeArgs>) -> Result<CallToolResult, McpError> {
        debug!("Reading {}:{} (±{})", args.file_path, args.line_number, args.context_lines);

        let excerpt = source::read_source(&args.file_path, args.line_number, args.context_lines).await?;
        success(to_value(&excerpt)?)
    }

    #[tool(description = "Get the most recent debug adapter events of a session (stops, output, process exit)")]
    async fn get_debug_events(&self, Parameters(args): Parameters<GetDebugEventsArgs>) -> Result<CallToolResult, McpError> {
        debug!("Getting up to {} events for session {}", args.limit, args.session_id);

        let events = self.manager.debug_events(&args.session_id, args.limit).await?;
        success(json!({
            "count": events.len(),
            "events": to_value(&events)?,
        }))
    }

    // =============================================================================
    // Process Management Tools (3 tools)
    // =============================================================================

    #[tool(description = "List running Python processes and whether they already run debugpy")]
    async fn list_debuggable_processes(&self, Parameters(_args): Parameters<ListDebuggableProcessesArgs>) -> Result<CallToolResult, McpError> {
        debug!("Listing debuggable processes");

        let processes = process::list_python_processes().await?;
        let debuggable = processes.iter().filter(|p| p.is_debuggable).count();

        info!("Found {} Python processes ({} with debugpy)", processes.len(), debuggable);
        success(json!({
            "total_count": processes.len(),
            "debuggable_count": debuggable,
            "processes": to_value(&processes)?,
        }))
    }

    #[tool(description = "Attach to a running Python process, injecting debugpy if it is not already listening")]
    async fn attach_to_process(&self, Parameters(args): Parameters<AttachToProcessArgs>) -> Result<CallToolResult, McpError> {
        debug!("Attaching to PID {}", args.process_id);

        let session = self.manager
            .attach_to_process(args.process_id, args.host, args.port)
            .await
            .inspect_err(|e| error!("Failed to attach to PID {}: {}", args.process_id, e))?;

        success(json!({
            "session_id": session.session_id,
            "process_id": args.process_id,
            "session": to_value(&session)?,
            "message": format!("Attached to process {} via {}:{}", args.process_id, session.host, session.port),
        }))
    }

    #[tool(description = "Detach from a process attached with attach_to_process, leaving it running")]
    async fn detach_from_process(&self, Parameters(args): Parameters<DetachFromProcessArgs>) -> Result<CallToolResult, McpError> {
        debug!("Detaching session {}", args.session_id);

        let session = self.manager.detach_from_process(&args.session_id).await?;
        success(json!({
            "session_id": session.session_id,
            "process_id": session.process_id,
            "message": "Detached; the process keeps running",
        }))
    }
}

#[tool_handler]
impl ServerHandler for DebugpyToolHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some("Python debugging MCP server built on debugpy and the Debug Adapter Protocol. Start a session against a debugpy listener (python -m debugpy --listen 5678 app.py) or attach to a running Python process, then set breakpoints, control execution, inspect stacks and variables, and evaluate expressions. Tools: start_debug_session, stop_debug_session, list_debug_sessions, get_session_status, set_breakpoint, clear_breakpoint, list_breakpoints, enable_breakpoint, disable_breakpoint, continue_execution, step_into, step_over, step_out, pause_execution, list_threads, inspect_variables, inspect_stack, evaluate_expression, get_source_code, get_debug_events, list_debuggable_processes, attach_to_process, detach_from_process.".to_string()),
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        info!("debugpy MCP server initialized with 23 tools");
        Ok(self.get_info())
    }
}
