//! Session manager tests against a scripted in-process debug adapter

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use debugpy_mcp::dap::protocol::{encode, read_message, Event, Message, Request, Response};
use debugpy_mcp::dap::{ClientOptions, DapClient, RunState, StepKind};
use debugpy_mcp::{Config, DebugpyError, SessionManager};

const APP: &str = "/tmp/app.py";

/// State shared between a test and the connections its adapter serves
#[derive(Clone, Default)]
struct Script {
    /// Lines of the most recent setBreakpoints request, per source path
    recorded: Arc<StdMutex<HashMap<String, Vec<i64>>>>,
    /// When set, every setBreakpoints request fails
    reject_breakpoints: Arc<AtomicBool>,
    /// Client replies to requests the adapter sent
    reverse_replies: Arc<StdMutex<Vec<Response>>>,
}

struct FakeAdapter {
    port: u16,
    script: Script,
}

impl FakeAdapter {
    async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve_on(listener)
    }

    fn serve_on(listener: TcpListener) -> Self {
        let port = listener.local_addr().unwrap().port();
        let script = Script::default();

        let shared = script.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, shared.clone()));
            }
        });

        Self { port, script }
    }

    fn lines(&self, path: &str) -> Vec<i64> {
        self.script.recorded.lock().unwrap().get(path).cloned().unwrap_or_default()
    }

    fn reject_breakpoints(&self, reject: bool) {
        self.script.reject_breakpoints.store(reject, Ordering::SeqCst);
    }

    fn config(&self) -> Config {
        Config {
            default_host: "127.0.0.1".to_string(),
            default_port: self.port,
            connect_timeout_secs: 5,
            request_timeout_secs: 5,
            stop_wait_ms: 2000,
            ..Config::default()
        }
    }
}

struct Wire {
    writer: OwnedWriteHalf,
    seq: i64,
}

impl Wire {
    async fn send(&mut self, message: Message) {
        let framed = encode(&message).unwrap();
        self.writer.write_all(&framed).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    async fn respond(&mut self, request: &Request, success: bool, message: Option<&str>, body: Value) {
        let seq = self.next_seq();
        self.send(Message::Response(Response {
            seq,
            request_seq: request.seq,
            success,
            command: request.command.clone(),
            message: message.map(String::from),
            body: Some(body),
        })).await;
    }

    async fn event(&mut self, name: &str, body: Value) {
        let seq = self.next_seq();
        self.send(Message::Event(Event { seq, event: name.to_string(), body: Some(body) })).await;
    }
}

async fn serve(stream: TcpStream, script: Script) {
    let (read_half, writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut wire = Wire { writer, seq: 0 };
    let mut deferred_attach: Option<Request> = None;
    let mut next_breakpoint_id = 100;
    let mut last_reply_ids: Vec<i64> = Vec::new();

    while let Ok(message) = read_message(&mut reader).await {
        let Message::Request(request) = message else { continue };
        let args = request.arguments.clone().unwrap_or_else(|| json!({}));

        match request.command.as_str() {
            "initialize" => {
                wire.respond(&request, true, None, json!({"supportsConfigurationDoneRequest": true})).await;
            }
            "attach" => {
                wire.event("process", json!({"name": APP, "systemProcessId": 4242})).await;
                wire.event("initialized", json!({})).await;
                deferred_attach = Some(request);
            }
            "configurationDone" => {
                wire.respond(&request, true, None, json!({})).await;
                if let Some(attach) = deferred_attach.take() {
                    wire.respond(&attach, true, None, json!({})).await;
                }
            }
            "setBreakpoints" if script.reject_breakpoints.load(Ordering::SeqCst) => {
                wire.respond(&request, false, Some("Source is not available"), json!({})).await;
            }
            "setBreakpoints" => {
                let path = args["source"]["path"].as_str().unwrap_or_default().to_string();
                let lines: Vec<i64> = args["breakpoints"]
                    .as_array()
                    .map(|bps| bps.iter().filter_map(|bp| bp["line"].as_i64()).collect())
                    .unwrap_or_default();
                script.recorded.lock().unwrap().insert(path, lines.clone());

                last_reply_ids.clear();
                let breakpoints: Vec<Value> = lines
                    .iter()
                    .map(|line| {
                        next_breakpoint_id += 1;
                        last_reply_ids.push(next_breakpoint_id);
                        if *line == 999 {
                            json!({"id": next_breakpoint_id, "verified": false, "message": "Line not executable"})
                        } else {
                            json!({"id": next_breakpoint_id, "verified": true, "line": line})
                        }
                    })
                    .collect();
                wire.respond(&request, true, None, json!({"breakpoints": breakpoints})).await;
            }
            "threads" => {
                wire.respond(&request, true, None, json!({"threads": [{"id": 1, "name": "MainThread"}]})).await;
            }
            "stackTrace" => {
                let mut frames = vec![
                    json!({"id": 100, "name": "compute", "source": {"path": APP}, "line": 12, "column": 5}),
                    json!({"id": 101, "name": "<module>", "source": {"path": APP}, "line": 30, "column": 1}),
                ];
                if let Some(levels) = args["levels"].as_u64() {
                    frames.truncate(levels as usize);
                }
                wire.respond(&request, true, None, json!({"stackFrames": frames, "totalFrames": 2})).await;
            }
            "scopes" => {
                let frame = args["frameId"].as_i64().unwrap_or_default();
                wire.respond(&request, true, None, json!({"scopes": [
                    {"name": "Locals", "variablesReference": frame * 10, "expensive": false},
                    {"name": "Globals", "variablesReference": frame * 10 + 1, "expensive": false},
                ]})).await;
            }
            "variables" => {
                let reference = args["variablesReference"].as_i64().unwrap_or_default();
                let variables = if reference % 10 == 0 {
                    json!([
                        {"name": "x", "value": "42", "type": "int", "variablesReference": 0},
                        {"name": "items", "value": "[1, 2, 3]", "type": "list", "variablesReference": 7},
                    ])
                } else {
                    json!([{"name": "__name__", "value": "'__main__'", "type": "str", "variablesReference": 0}])
                };
                wire.respond(&request, true, None, json!({"variables": variables})).await;
            }
            "evaluate" => {
                let expression = args["expression"].as_str().unwrap_or_default().to_string();
                if expression == "hang_up" {
                    break;
                }
                if expression == "launch_terminal" {
                    let seq = wire.next_seq();
                    wire.send(Message::Request(Request {
                        seq,
                        command: "runInTerminal".to_string(),
                        arguments: Some(json!({"args": ["python", "app.py"]})),
                    })).await;
                    while let Ok(reply) = read_message(&mut reader).await {
                        if let Message::Response(reply) = reply {
                            script.reverse_replies.lock().unwrap().push(reply);
                            break;
                        }
                    }
                }
                if expression == "boom" {
                    wire.respond(&request, false, Some("NameError: name 'boom' is not defined"), json!({})).await;
                } else {
                    let frame = args["frameId"].as_i64().map(|f| f.to_string()).unwrap_or_else(|| "none".to_string());
                    wire.respond(&request, true, None, json!({
                        "result": format!("{}@{}", expression, frame),
                        "type": "str",
                        "variablesReference": 0,
                    })).await;
                }
            }
            "continue" => {
                wire.respond(&request, true, None, json!({"allThreadsContinued": true})).await;
                let hits: Vec<i64> = last_reply_ids.first().copied().into_iter().collect();
                wire.event("stopped", json!({
                    "reason": "breakpoint",
                    "threadId": 1,
                    "allThreadsStopped": true,
                    "hitBreakpointIds": hits,
                })).await;
            }
            "next" | "stepIn" | "stepOut" => {
                wire.respond(&request, true, None, json!({})).await;
                wire.event("stopped", json!({"reason": "step", "threadId": 1})).await;
            }
            "pause" => {
                wire.respond(&request, true, None, json!({})).await;
                wire.event("stopped", json!({"reason": "pause", "threadId": 1})).await;
            }
            "disconnect" => {
                wire.respond(&request, true, None, json!({})).await;
                break;
            }
            _ => {
                wire.respond(&request, false, Some("unsupported"), json!({})).await;
            }
        }
    }
}

async fn manager_with_session() -> (FakeAdapter, SessionManager, String) {
    let adapter = FakeAdapter::spawn().await;
    let manager = SessionManager::new(adapter.config());
    let session = manager.start_session(None, None, None).await.unwrap();
    (adapter, manager, session.session_id)
}

#[tokio::test]
async fn test_session_lifecycle() {
    let (_adapter, manager, session_id) = manager_with_session().await;

    let sessions = manager.list_sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, session_id);
    assert!(sessions[0].is_connected);
    assert_eq!(sessions[0].process_id, Some(4242));
    assert_eq!(sessions[0].status, RunState::Connected);

    let stopped = manager.stop_session(&session_id, false).await.unwrap();
    assert!(!stopped.is_connected);
    assert!(manager.list_sessions().await.is_empty());
    assert!(matches!(
        manager.session_status(&session_id).await,
        Err(DebugpyError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_failed_connect_registers_nothing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let manager = SessionManager::new(Config { connect_timeout_secs: 2, ..Config::default() });
    let result = manager.start_session(Some("127.0.0.1".to_string()), Some(port), None).await;
    assert!(matches!(result, Err(DebugpyError::ConnectionFailed(_))));
    assert!(manager.list_sessions().await.is_empty());
}

#[tokio::test]
async fn test_session_limit() {
    let adapter = FakeAdapter::spawn().await;
    let manager = SessionManager::new(Config { max_sessions: 1, ..adapter.config() });

    manager.start_session(None, None, None).await.unwrap();
    let second = manager.start_session(None, None, None).await;
    assert!(matches!(second, Err(DebugpyError::SessionLimitExceeded(1))));
    assert_eq!(manager.list_sessions().await.len(), 1);
}

#[tokio::test]
async fn test_breakpoint_changes_resend_whole_file() {
    let (adapter, manager, id) = manager_with_session().await;

    let first = manager.set_breakpoint(&id, APP, 10, None).await.unwrap();
    let second = manager.set_breakpoint(&id, APP, 20, Some("x > 1".to_string())).await.unwrap();
    assert_eq!((first.breakpoint_id, second.breakpoint_id), (1, 2));
    assert!(second.verified);
    assert_eq!(adapter.lines(APP), vec![10, 20]);

    manager.clear_breakpoint(&id, 1).await.unwrap();
    assert_eq!(adapter.lines(APP), vec![20]);

    let third = manager.set_breakpoint(&id, APP, 30, None).await.unwrap();
    assert_eq!(third.breakpoint_id, 3);
    assert_eq!(adapter.lines(APP), vec![20, 30]);

    let disabled = manager.set_breakpoint_enabled(&id, 2, false).await.unwrap();
    assert!(!disabled.is_enabled);
    assert_eq!(adapter.lines(APP), vec![30]);

    manager.set_breakpoint_enabled(&id, 2, true).await.unwrap();
    assert_eq!(adapter.lines(APP), vec![20, 30]);

    let listed: Vec<u32> = manager
        .list_breakpoints(&id)
        .await
        .unwrap()
        .iter()
        .map(|bp| bp.breakpoint_id)
        .collect();
    assert_eq!(listed, vec![2, 3]);
}

#[tokio::test]
async fn test_unverified_breakpoint_is_kept() {
    let (_adapter, manager, id) = manager_with_session().await;

    let breakpoint = manager.set_breakpoint(&id, APP, 999, None).await.unwrap();
    assert!(!breakpoint.verified);
    assert_eq!(breakpoint.message.as_deref(), Some("Line not executable"));
    assert_eq!(manager.list_breakpoints(&id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_breakpoint_argument_errors() {
    let (_adapter, manager, id) = manager_with_session().await;

    assert!(matches!(
        manager.set_breakpoint(&id, APP, 0, None).await,
        Err(DebugpyError::InvalidBreakpoint(_))
    ));
    assert!(matches!(
        manager.set_breakpoint(&id, "  ", 3, None).await,
        Err(DebugpyError::InvalidBreakpoint(_))
    ));
    assert!(matches!(
        manager.clear_breakpoint(&id, 77).await,
        Err(DebugpyError::BreakpointNotFound(77))
    ));
    assert!(matches!(
        manager.set_breakpoint("nope", APP, 3, None).await,
        Err(DebugpyError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_continue_reports_stop_and_hit_count() {
    let (_adapter, manager, id) = manager_with_session().await;
    manager.set_breakpoint(&id, APP, 12, None).await.unwrap();

    let report = manager.continue_execution(&id, None).await.unwrap();
    assert_eq!(report.thread_id, 1);
    let stop = report.stopped.expect("adapter stops after continue");
    assert_eq!(stop.reason, "breakpoint");
    let frame = stop.frame.expect("top frame");
    assert_eq!(frame.name, "compute");
    assert_eq!(frame.file_path, APP);
    assert_eq!(frame.line_number, 12);

    let breakpoints = manager.list_breakpoints(&id).await.unwrap();
    assert_eq!(breakpoints[0].hit_count, 1);

    let status = manager.session_status(&id).await.unwrap();
    assert_eq!(status.session.status, RunState::Stopped);
    assert_eq!(status.breakpoints_count, 1);
    assert_eq!(status.stop.unwrap().reason, "breakpoint");
}

#[tokio::test]
async fn test_steps_and_pause_report_location() {
    let (_adapter, manager, id) = manager_with_session().await;

    for kind in [StepKind::Over, StepKind::Into, StepKind::Out] {
        let report = manager.step(&id, kind, Some(1)).await.unwrap();
        let stop = report.stopped.unwrap();
        assert_eq!(stop.reason, "step");
        assert_eq!(stop.thread_id, Some(1));
    }

    let report = manager.pause_execution(&id, None).await.unwrap();
    assert_eq!(report.action, "pause");
    assert_eq!(report.stopped.unwrap().reason, "pause");
}

#[tokio::test]
async fn test_inspect_variables_defaults_to_top_frame() {
    let (_adapter, manager, id) = manager_with_session().await;

    let (frame_id, variables) = manager.inspect_variables(&id, None).await.unwrap();
    assert_eq!(frame_id, 100);

    let x = variables.iter().find(|v| v.name == "x").unwrap();
    assert_eq!((x.value.as_str(), x.type_name.as_str(), x.scope.as_str()), ("42", "int", "Locals"));
    assert!(!x.is_expandable);
    assert!(variables.iter().find(|v| v.name == "items").unwrap().is_expandable);
    assert_eq!(variables.iter().find(|v| v.name == "__name__").unwrap().scope, "Globals");

    let (frame_id, _) = manager.inspect_variables(&id, Some(101)).await.unwrap();
    assert_eq!(frame_id, 101);
}

#[tokio::test]
async fn test_inspect_stack_levels() {
    let (_adapter, manager, id) = manager_with_session().await;

    let (thread_id, frames) = manager.inspect_stack(&id, None, None).await.unwrap();
    assert_eq!(thread_id, 1);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].name, "<module>");

    let (_, frames) = manager.inspect_stack(&id, Some(1), Some(1)).await.unwrap();
    assert_eq!(frames.len(), 1);
}

#[tokio::test]
async fn test_evaluate_expression() {
    let (_adapter, manager, id) = manager_with_session().await;

    let detached = manager.evaluate_expression(&id, "x", None, None).await.unwrap();
    assert_eq!(detached.result, "x@none");

    manager.pause_execution(&id, None).await.unwrap();
    let in_frame = manager.evaluate_expression(&id, "x", None, None).await.unwrap();
    assert!(!in_frame.is_error);
    assert_eq!(in_frame.result, "x@100");
    assert_eq!(in_frame.type_name, "str");

    let failed = manager.evaluate_expression(&id, "boom", None, None).await.unwrap();
    assert!(failed.is_error);
    assert!(failed.error_message.unwrap().contains("NameError"));
}

#[tokio::test]
async fn test_threads_and_events() {
    let (_adapter, manager, id) = manager_with_session().await;

    let threads = manager.list_threads(&id).await.unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].name, "MainThread");

    let events = manager.debug_events(&id, 50).await.unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(kinds, vec!["process", "initialized"]);
    assert_eq!(manager.debug_events(&id, 1).await.unwrap()[0].event_type, "initialized");
}

#[tokio::test]
async fn test_detach_unregisters_session() {
    let (_adapter, manager, id) = manager_with_session().await;

    let info = manager.detach_from_process(&id).await.unwrap();
    assert_eq!(info.process_id, Some(4242));
    assert!(manager.list_sessions().await.is_empty());
    assert!(matches!(
        manager.detach_from_process(&id).await,
        Err(DebugpyError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_shutdown_disconnects_everything() {
    let (adapter, manager, _id) = manager_with_session().await;
    manager.start_session(None, Some(adapter.port), None).await.unwrap();

    manager.shutdown().await;
    assert!(manager.list_sessions().await.is_empty());
}

#[tokio::test]
async fn test_hit_count_survives_resync() {
    let (adapter, manager, id) = manager_with_session().await;
    let first = manager.set_breakpoint(&id, APP, 12, None).await.unwrap();

    manager.continue_execution(&id, None).await.unwrap();
    let hits = |bps: Vec<debugpy_mcp::debugger::Breakpoint>| {
        bps.iter().find(|bp| bp.breakpoint_id == first.breakpoint_id).unwrap().hit_count
    };

    // a neighbour in the same file makes the adapter hand out fresh ids
    manager.set_breakpoint(&id, APP, 40, None).await.unwrap();
    assert_eq!(adapter.lines(APP), vec![12, 40]);
    assert_eq!(hits(manager.list_breakpoints(&id).await.unwrap()), 1);

    manager.set_breakpoint_enabled(&id, first.breakpoint_id, false).await.unwrap();
    manager.set_breakpoint_enabled(&id, first.breakpoint_id, true).await.unwrap();
    assert_eq!(hits(manager.list_breakpoints(&id).await.unwrap()), 1);

    // the adapter reports the first breakpoint of the latest reply, which is still ours
    manager.continue_execution(&id, None).await.unwrap();
    manager.clear_breakpoint(&id, 2).await.unwrap();
    assert_eq!(hits(manager.list_breakpoints(&id).await.unwrap()), 2);
}

#[tokio::test]
async fn test_rejected_breakpoint_sync_rolls_back() {
    let (adapter, manager, id) = manager_with_session().await;
    manager.set_breakpoint(&id, APP, 10, None).await.unwrap();

    adapter.reject_breakpoints(true);
    let rejected = manager.set_breakpoint(&id, APP, 20, None).await;
    match rejected {
        Err(DebugpyError::InvalidBreakpoint(message)) => assert!(message.contains("Source is not available")),
        other => panic!("unexpected result: {:?}", other.map(|bp| bp.breakpoint_id)),
    }
    let listed = manager.list_breakpoints(&id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].breakpoint_id, 1);

    assert!(manager.clear_breakpoint(&id, 1).await.is_err());
    assert_eq!(manager.list_breakpoints(&id).await.unwrap().len(), 1);

    assert!(manager.set_breakpoint_enabled(&id, 1, false).await.is_err());
    assert!(manager.list_breakpoints(&id).await.unwrap()[0].is_enabled);
    assert_eq!(adapter.lines(APP), vec![10]);

    adapter.reject_breakpoints(false);
    let next = manager.set_breakpoint(&id, APP, 30, None).await.unwrap();
    assert_eq!(next.breakpoint_id, 3);
    assert_eq!(adapter.lines(APP), vec![10, 30]);
}

#[tokio::test]
async fn test_reverse_request_is_refused() {
    let (adapter, manager, id) = manager_with_session().await;

    let result = manager.evaluate_expression(&id, "launch_terminal", None, None).await.unwrap();
    assert!(!result.is_error);

    let replies = adapter.script.reverse_replies.lock().unwrap().clone();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].command, "runInTerminal");
    assert!(!replies[0].success);
}

#[tokio::test]
async fn test_adapter_hangup_fails_pending_request() {
    let (_adapter, manager, id) = manager_with_session().await;

    let result = manager.evaluate_expression(&id, "hang_up", None, None).await;
    assert!(matches!(result, Err(DebugpyError::ConnectionClosed)));

    let status = manager.session_status(&id).await.unwrap();
    assert!(!status.session.is_connected);
    assert_eq!(status.session.status, RunState::Disconnected);
}

fn client_options(connect_timeout: Duration) -> ClientOptions {
    ClientOptions {
        connect_timeout,
        request_timeout: Duration::from_secs(5),
        max_events: 50,
        just_my_code: true,
    }
}

#[tokio::test]
async fn test_connect_with_retry_waits_for_listener() {
    let port = {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        reserved.local_addr().unwrap().port()
    };

    let late_listener = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        FakeAdapter::serve_on(listener)
    });

    let client = DapClient::connect_with_retry("retry", "127.0.0.1", port, &client_options(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(client.is_connected().await);
    assert_eq!(client.snapshot().await.process_id, Some(4242));

    late_listener.await.unwrap();
    client.disconnect(false).await.unwrap();
}

#[tokio::test]
async fn test_connect_with_retry_gives_up() {
    let port = {
        let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        unused.local_addr().unwrap().port()
    };

    let started = std::time::Instant::now();
    let result = DapClient::connect_with_retry("retry", "127.0.0.1", port, &client_options(Duration::from_millis(300))).await;
    assert!(matches!(result, Err(DebugpyError::ConnectionFailed(_))));
    assert!(started.elapsed() >= Duration::from_millis(300));
}
