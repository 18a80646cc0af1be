//! debugpy MCP tools module
//!
//! One tool handler exposes session, breakpoint, execution, inspection and
//! process tools over rmcp.

pub mod debugpy_tools;
pub mod types;

pub use debugpy_tools::*;
pub use types::*;
