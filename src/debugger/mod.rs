pub mod manager;
pub mod session;

pub use manager::SessionManager;
pub use session::{
    Breakpoint, DebugSession, ExecutionReport, ExpressionResult, SessionInfo, SessionStatus,
    StackFrame, StopLocation, Variable,
};
