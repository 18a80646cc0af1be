//! Argument types for the debugpy MCP tools

use schemars::JsonSchema;
use serde::Deserialize;

// =============================================================================
// Session Management Types
// =============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StartDebugSessionArgs {
    /// Host where debugpy is listening (default: server configuration, usually "localhost")
    pub host: Option<String>,
    /// Port where debugpy is listening (default: server configuration, usually 5678)
    pub port: Option<u16>,
    /// Connection timeout in seconds (default: server configuration)
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StopDebugSessionArgs {
    /// Session ID to stop
    pub session_id: String,
    /// Also terminate the debugged process (default: false, the process keeps running)
    #[serde(default)]
    pub terminate_debuggee: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListDebugSessionsArgs {
    // No parameters needed
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetSessionStatusArgs {
    /// Session ID
    pub session_id: String,
}

// =============================================================================
// Breakpoint Management Types
// =============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SetBreakpointArgs {
    /// Session ID
    pub session_id: String,
    /// Path of the Python source file, as the debuggee sees it
    pub file_path: String,
    /// 1-based line number
    pub line_number: u32,
    /// Optional Python condition; the breakpoint only triggers when it is true
    pub condition: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BreakpointArgs {
    /// Session ID
    pub session_id: String,
    /// Breakpoint ID returned by set_breakpoint
    pub breakpoint_id: u32,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListBreakpointsArgs {
    /// Session ID
    pub session_id: String,
}

// =============================================================================
// Execution Control Types
// =============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecutionArgs {
    /// Session ID
    pub session_id: String,
    /// Thread to act on (default: the stopped thread, else the first thread)
    pub thread_id: Option<i64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListThreadsArgs {
    /// Session ID
    pub session_id: String,
}

// =============================================================================
// Inspection Types
// =============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InspectVariablesArgs {
    /// Session ID
    pub session_id: String,
    /// Stack frame ID from inspect_stack (default: top frame of the stopped thread)
    pub frame_id: Option<i64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InspectStackArgs {
    /// Session ID
    pub session_id: String,
    /// Thread ID (default: the stopped thread, else the first thread)
    pub thread_id: Option<i64>,
    /// Maximum number of frames to return (default: all)
    pub levels: Option<i64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EvaluateExpressionArgs {
    /// Session ID
    pub session_id: String,
    /// Python expression to evaluate
    pub expression: String,
    /// Stack frame to evaluate in (default: top frame when stopped)
    pub frame_id: Option<i64>,
    /// DAP evaluation context: "repl", "watch", "hover" or "clipboard" (default: "repl")
    pub context: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetSourceCodeArgs {
    /// Path of the source file
    pub file_path: String,
    /// 1-based line number to center on
    pub line_number: usize,
    /// Lines of context before and after the target line (default: 5)
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,
}

fn default_context_lines() -> usize { 5 }

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetDebugEventsArgs {
    /// Session ID
    pub session_id: String,
    /// Maximum number of most recent events to return (default: 50)
    #[serde(default = "default_event_limit")]
    pub limit: usize,
}

fn default_event_limit() -> usize { 50 }

// =============================================================================
// Process Management Types
// =============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListDebuggableProcessesArgs {
    // No parameters needed
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AttachToProcessArgs {
    /// PID of the Python process
    pub process_id: u32,
    /// Host for the debugpy listener (default: server configuration)
    pub host: Option<String>,
    /// Port for the debugpy listener (default: the process's existing listener, else server configuration)
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DetachFromProcessArgs {
    /// Session ID returned by attach_to_process
    pub session_id: String,
}
