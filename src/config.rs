//! Configuration for the debugpy MCP server

use std::path::PathBuf;
use std::time::Duration;
use clap::{ArgAction, Parser};
use crate::error::{DebugpyError, Result};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "debugpy-mcp")]
#[command(about = "MCP server for Python debugging via debugpy")]
#[command(version)]
pub struct Args {
    /// Default host where debugpy is listening
    #[arg(long, env = "DEBUGPY_MCP_HOST", default_value = "localhost")]
    pub host: String,

    /// Default port where debugpy is listening
    #[arg(long, env = "DEBUGPY_MCP_PORT", default_value = "5678")]
    pub port: u16,

    /// Connection timeout in seconds
    #[arg(long, env = "DEBUGPY_MCP_TIMEOUT", default_value = "30")]
    pub timeout: u64,

    /// Timeout for a single DAP request in seconds
    #[arg(long, env = "DEBUGPY_MCP_REQUEST_TIMEOUT", default_value = "10")]
    pub request_timeout: u64,

    /// How long execution-control tools wait for the debuggee to stop (ms)
    #[arg(long, default_value = "1000")]
    pub stop_wait_ms: u64,

    /// Maximum number of concurrent debug sessions
    #[arg(long, default_value = "10")]
    pub max_sessions: usize,

    /// Number of adapter events retained per session
    #[arg(long, default_value = "200")]
    pub max_events: usize,

    /// Python interpreter used to inject debugpy into running processes
    #[arg(long, env = "DEBUGPY_MCP_PYTHON", default_value = "python3")]
    pub python: String,

    /// Only step through user code (debugpy justMyCode)
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub just_my_code: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log file path (defaults to stderr)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone)]
pub struct Config {
    pub default_host: String,
    pub default_port: u16,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub stop_wait_ms: u64,
    pub max_sessions: usize,
    pub max_events: usize,
    pub python_path: String,
    pub just_my_code: bool,
}

impl Config {
    pub fn from_args(args: &Args) -> Self {
        Self {
            default_host: args.host.clone(),
            default_port: args.port,
            connect_timeout_secs: args.timeout,
            request_timeout_secs: args.request_timeout,
            stop_wait_ms: args.stop_wait_ms,
            max_sessions: args.max_sessions,
            max_events: args.max_events,
            python_path: args.python.clone(),
            just_my_code: args.just_my_code,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_host.trim().is_empty() {
            return Err(DebugpyError::InvalidConfig("host must not be empty".to_string()));
        }
        if self.default_port == 0 {
            return Err(DebugpyError::InvalidConfig("port must be > 0".to_string()));
        }
        if self.connect_timeout_secs == 0 {
            return Err(DebugpyError::InvalidConfig("timeout must be > 0".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(DebugpyError::InvalidConfig("request_timeout must be > 0".to_string()));
        }
        if self.max_sessions == 0 {
            return Err(DebugpyError::InvalidConfig("max_sessions must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_host: "localhost".to_string(),
            default_port: 5678,
            connect_timeout_secs: 30,
            request_timeout_secs: 10,
            stop_wait_ms: 1000,
            max_sessions: 10,
            max_events: 200,
            python_path: "python3".to_string(),
            just_my_code: true,
        }
    }
}
