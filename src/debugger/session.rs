//! Session and breakpoint records reported to MCP clients

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::dap::protocol::{self, SourceBreakpoint};
use crate::dap::{DapClient, RunState, StopInfo};

/// Snapshot of a debug session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub host: String,
    pub port: u16,
    pub is_connected: bool,
    pub process_id: Option<u32>,
    pub status: RunState,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A breakpoint owned by a session
#[derive(Debug, Clone, Serialize)]
pub struct Breakpoint {
    pub breakpoint_id: u32,
    pub file_path: String,
    pub line_number: u32,
    pub condition: Option<String>,
    pub is_enabled: bool,
    pub verified: bool,
    pub message: Option<String>,
    pub hit_count: u32,
    #[serde(skip)]
    pub adapter_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StackFrame {
    pub frame_id: i64,
    pub name: String,
    pub file_path: String,
    pub line_number: i64,
    pub column: Option<i64>,
}

impl From<protocol::StackFrame> for StackFrame {
    fn from(frame: protocol::StackFrame) -> Self {
        let file_path = frame
            .source
            .and_then(|source| source.path.or(source.name))
            .unwrap_or_default();
        Self {
            frame_id: frame.id,
            name: frame.name,
            file_path,
            line_number: frame.line,
            column: frame.column,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub scope: String,
    pub is_expandable: bool,
}

impl Variable {
    pub fn from_dap(variable: protocol::Variable, scope: &str) -> Self {
        Self {
            name: variable.name,
            value: variable.value,
            type_name: variable.type_name.unwrap_or_else(|| "unknown".to_string()),
            scope: scope.to_string(),
            is_expandable: variable.variables_reference > 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpressionResult {
    pub expression: String,
    pub result: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub is_error: bool,
    pub error_message: Option<String>,
}

/// Where the debuggee came to rest after an execution-control request
#[derive(Debug, Clone, Serialize)]
pub struct StopLocation {
    pub reason: String,
    pub description: Option<String>,
    pub thread_id: Option<i64>,
    pub frame: Option<StackFrame>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub session_id: String,
    pub action: String,
    pub thread_id: i64,
    pub stopped: Option<StopLocation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    #[serde(flatten)]
    pub session: SessionInfo,
    pub breakpoints_count: usize,
    pub stop: Option<StopInfo>,
    pub exit_code: Option<i64>,
    pub process_name: Option<String>,
}

/// A registered session: connection plus breakpoint table
pub struct DebugSession {
    pub session_id: String,
    pub host: String,
    pub port: u16,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// PID given to attach_to_process, if the session came from an attach
    pub attached_pid: Option<u32>,
    pub client: DapClient,
    pub breakpoints: BreakpointTable,
}

impl DebugSession {
    pub fn new(session_id: String, host: String, port: u16, client: DapClient) -> Self {
        Self {
            session_id,
            host,
            port,
            created_at: chrono::Utc::now(),
            attached_pid: None,
            client,
            breakpoints: BreakpointTable::default(),
        }
    }

    pub async fn info(&self) -> SessionInfo {
        let state = self.client.snapshot().await;
        SessionInfo {
            session_id: self.session_id.clone(),
            host: self.host.clone(),
            port: self.port,
            is_connected: state.run_state != RunState::Disconnected,
            process_id: state.process_id.or(self.attached_pid),
            status: state.run_state,
            created_at: self.created_at,
        }
    }
}

/// Breakpoints of one session, keyed by id.
///
/// Ids start at 1 and are never reused within a session. The adapter hands
/// out fresh ids on every `setBreakpoints`, so `by_adapter_id` only maps the
/// ids from the latest reply of each file.
#[derive(Debug, Default)]
pub struct BreakpointTable {
    breakpoints: BTreeMap<u32, Breakpoint>,
    by_adapter_id: HashMap<i64, u32>,
    last_id: u32,
}

impl BreakpointTable {
    pub fn insert(&mut self, file_path: &str, line_number: u32, condition: Option<String>) -> u32 {
        self.last_id += 1;
        let id = self.last_id;
        self.breakpoints.insert(id, Breakpoint {
            breakpoint_id: id,
            file_path: file_path.to_string(),
            line_number,
            condition,
            is_enabled: true,
            verified: false,
            message: None,
            hit_count: 0,
            adapter_id: None,
        });
        id
    }

    pub fn get(&self, id: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Breakpoint> {
        self.breakpoints.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<Breakpoint> {
        let removed = self.breakpoints.remove(&id)?;
        if let Some(adapter_id) = removed.adapter_id {
            self.by_adapter_id.remove(&adapter_id);
        }
        Some(removed)
    }

    /// Put back a breakpoint taken out by `remove`; its id stays reserved
    pub fn restore(&mut self, breakpoint: Breakpoint) {
        if let Some(adapter_id) = breakpoint.adapter_id {
            self.by_adapter_id.insert(adapter_id, breakpoint.breakpoint_id);
        }
        self.breakpoints.insert(breakpoint.breakpoint_id, breakpoint);
    }

    /// Add stop counts keyed by adapter id to the breakpoints they name
    pub fn record_hits(&mut self, hits: &HashMap<i64, u32>) {
        for (adapter_id, count) in hits {
            let Some(id) = self.by_adapter_id.get(adapter_id) else { continue };
            if let Some(bp) = self.breakpoints.get_mut(id) {
                bp.hit_count += count;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    /// Ids of the enabled breakpoints in `file_path`, in id order
    pub fn enabled_in_file(&self, file_path: &str) -> Vec<u32> {
        self.breakpoints
            .values()
            .filter(|bp| bp.is_enabled && bp.file_path == file_path)
            .map(|bp| bp.breakpoint_id)
            .collect()
    }

    /// The `setBreakpoints` payload for `file_path`
    pub fn source_breakpoints(&self, ids: &[u32]) -> Vec<SourceBreakpoint> {
        ids.iter()
            .filter_map(|id| self.breakpoints.get(id))
            .map(|bp| SourceBreakpoint {
                line: bp.line_number as i64,
                condition: bp.condition.clone(),
            })
            .collect()
    }

    /// Fold the adapter's index-aligned reply back into the table
    pub fn apply_adapter_reply(&mut self, ids: &[u32], reply: &[protocol::Breakpoint]) {
        for (id, adapter_bp) in ids.iter().zip(reply) {
            if let Some(bp) = self.breakpoints.get_mut(id) {
                if let Some(old) = bp.adapter_id.take() {
                    self.by_adapter_id.remove(&old);
                }
                if let Some(new) = adapter_bp.id {
                    self.by_adapter_id.insert(new, *id);
                }
                bp.verified = adapter_bp.verified;
                bp.message = adapter_bp.message.clone();
                bp.adapter_id = adapter_bp.id;
                if let Some(line) = adapter_bp.line.filter(|line| *line > 0) {
                    bp.line_number = line as u32;
                }
            }
        }
    }

    /// Drop adapter-side state for breakpoints no longer sent to the adapter
    pub fn mark_unsynced(&mut self, id: u32) {
        if let Some(bp) = self.breakpoints.get_mut(&id) {
            bp.verified = false;
            if let Some(old) = bp.adapter_id.take() {
                self.by_adapter_id.remove(&old);
            }
        }
    }
}
