//! Discovery of Python processes and debugpy injection
//!
//! A process is considered debuggable when its command line mentions debugpy.
//! Injection runs `python -m debugpy --listen <host>:<port> --pid <pid>`, which
//! makes the target process start a debugpy listener we can then connect to.

use serde::Serialize;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, RefreshKind, System, UpdateKind};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{DebugpyError, Result};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProcessInfo {
    pub process_id: u32,
    pub name: String,
    pub command_line: Option<String>,
    pub is_debuggable: bool,
    pub debugpy_port: Option<u16>,
}

/// Classify a process; `None` when it is not a Python process
pub fn classify(process_id: u32, name: &str, cmd: &[String]) -> Option<ProcessInfo> {
    if !name.to_lowercase().contains("python") {
        return None;
    }

    let command_line = if cmd.is_empty() { None } else { Some(cmd.join(" ")) };
    let is_debuggable = command_line.as_deref().is_some_and(|line| line.contains("debugpy"));
    let debugpy_port = if is_debuggable { parse_listen_port(cmd) } else { None };

    Some(ProcessInfo {
        process_id,
        name: name.to_string(),
        command_line,
        is_debuggable,
        debugpy_port,
    })
}

/// Port from `--listen 5678`, `--listen host:5678` or `--listen=host:5678`
pub fn parse_listen_port(cmd: &[String]) -> Option<u16> {
    let mut args = cmd.iter();
    while let Some(arg) = args.next() {
        let address = if arg == "--listen" {
            args.next()
        } else if let Some(value) = arg.strip_prefix("--listen=") {
            return parse_port(value);
        } else {
            continue;
        };
        return address.and_then(|value| parse_port(value));
    }
    None
}

fn parse_port(address: &str) -> Option<u16> {
    let port = match address.rsplit_once(':') {
        Some((_, port)) => port,
        None => address,
    };
    port.trim().parse().ok()
}

fn snapshot() -> Vec<ProcessInfo> {
    let system = System::new_with_specifics(
        RefreshKind::nothing().with_processes(
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::OnlyIfNotSet),
        ),
    );

    let mut processes: Vec<ProcessInfo> = system
        .processes()
        .iter()
        .filter_map(|(pid, process)| {
            let name = process.name().to_string_lossy();
            let cmd: Vec<String> = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            classify(pid.as_u32(), &name, &cmd)
        })
        .collect();

    processes.sort_by_key(|process| process.process_id);
    processes
}

/// All Python processes on this machine, sorted by PID
pub async fn list_python_processes() -> Result<Vec<ProcessInfo>> {
    let processes = tokio::task::spawn_blocking(snapshot)
        .await
        .map_err(|e| DebugpyError::IoError(std::io::Error::other(e)))?;
    debug!("Found {} Python processes", processes.len());
    Ok(processes)
}

pub async fn find_python_process(process_id: u32) -> Result<ProcessInfo> {
    list_python_processes()
        .await?
        .into_iter()
        .find(|process| process.process_id == process_id)
        .ok_or(DebugpyError::ProcessNotFound(process_id))
}

/// Start a debugpy listener inside a running process
pub async fn inject_debugpy(
    python: &str,
    process_id: u32,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<()> {
    info!("Injecting debugpy into PID {} (listen {}:{})", process_id, host, port);

    let mut cmd = Command::new(python);
    cmd.arg("-m").arg("debugpy")
        .arg("--listen").arg(format!("{}:{}", host, port))
        .arg("--pid").arg(process_id.to_string())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(DebugpyError::AttachFailed {
                pid: process_id,
                reason: format!("Failed to run {}: {}", python, e),
            });
        }
        Err(_) => {
            return Err(DebugpyError::AttachFailed {
                pid: process_id,
                reason: format!("debugpy injection timed out after {:?}", timeout),
            });
        }
    };

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(DebugpyError::AttachFailed {
            pid: process_id,
            reason: if stderr.is_empty() {
                format!("injector exited with {}", output.status)
            } else {
                stderr
            },
        })
    }
}
