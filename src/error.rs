//! Error types for the debugpy MCP server

use rmcp::ErrorData as McpError;
use thiserror::Error;

/// Main error type for the debugpy MCP server
#[derive(Error, Debug)]
pub enum DebugpyError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed by debug adapter")]
    ConnectionClosed,

    #[error("Session not connected: {0}")]
    NotConnected(String),

    #[error("Timeout waiting for response to '{0}'")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("DAP request '{command}' failed: {message}")]
    RequestFailed { command: String, message: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session limit exceeded (max: {0})")]
    SessionLimitExceeded(usize),

    #[error("Invalid breakpoint location: {0}")]
    InvalidBreakpoint(String),

    #[error("Breakpoint {0} not found")]
    BreakpointNotFound(u32),

    #[error("No threads available in debuggee")]
    NoThreads,

    #[error("No stack frames for thread {0}; is the debuggee paused?")]
    NoFrames(i64),

    #[error("Expression evaluation failed: {0}")]
    EvaluationFailed(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(u32),

    #[error("Failed to attach to process {pid}: {reason}")]
    AttachFailed { pid: u32, reason: String },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Line {line} out of range (file has {total} lines)")]
    LineOutOfRange { line: usize, total: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, DebugpyError>;

impl DebugpyError {
    /// Errors caused by the caller's arguments rather than the debuggee or transport
    pub fn is_invalid_params(&self) -> bool {
        matches!(
            self,
            DebugpyError::SessionNotFound(_)
                | DebugpyError::BreakpointNotFound(_)
                | DebugpyError::InvalidBreakpoint(_)
                | DebugpyError::ProcessNotFound(_)
                | DebugpyError::FileNotFound(_)
                | DebugpyError::LineOutOfRange { .. }
        )
    }
}

impl From<DebugpyError> for McpError {
    fn from(error: DebugpyError) -> Self {
        if error.is_invalid_params() {
            McpError::invalid_params(error.to_string(), None)
        } else {
            McpError::internal_error(error.to_string(), None)
        }
    }
}
