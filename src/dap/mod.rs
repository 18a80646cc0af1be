//! Debug Adapter Protocol client side: wire framing and the TCP client

pub mod client;
pub mod protocol;

pub use client::{AdapterState, ClientOptions, DapClient, DebugEvent, RunState, StepKind, StopInfo};
