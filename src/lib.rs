//! debugpy MCP Server
//!
//! A Model Context Protocol server that lets AI assistants debug Python
//! programs through debugpy and the Debug Adapter Protocol.

pub mod config;
pub mod error;
pub mod dap;
pub mod debugger;
pub mod process;
pub mod source;
pub mod tools;

pub use error::{DebugpyError, Result};
pub use config::{Args, Config};
pub use debugger::SessionManager;
pub use tools::DebugpyToolHandler;
