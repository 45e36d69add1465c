//! DAP-to-backend bridge core: the event loop and every module it
//! drives. Split out from the `godlv-bridge` binary (mirroring the
//! `db-backend`/`db_backend` lib+bin split elsewhere in this
//! workspace) so integration tests can drive `run_adapter` directly
//! against an in-process mock backend instead of needing a subprocess
//! harness.

pub mod api_version;
pub mod backend_transport;
pub mod breakpoints;
pub mod config;
pub mod dap_io;
pub mod disconnect;
pub mod errors;
pub mod events;
pub mod globals;
pub mod launcher;
pub mod path_mapper;
pub mod session;
pub mod variables;

use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::mpsc;

use crate::api_version::{LoadConfig, dialect_for};
use crate::backend_transport::BackendTransport;
use crate::breakpoints::RequestedBreakpoint;
use crate::config::AdapterConfig;
use crate::dap_io::{DapReader, encode};
use crate::disconnect::{AfterHalt, DisconnectStep, HaltOutcome, Locality};
use crate::errors::ErrorCode;
use crate::events::{OutputCategory, StopReason};
use crate::launcher::{LaunchMode, LaunchRequest};
use crate::path_mapper::{PathMapper, Separator};
use crate::session::{CommandCompletion, RunState, SessionController, SetBreakpointsPlan, ThreadsDecision, VariablesDecision};
use crate::variables::FrameRef;

/// Internal events the adapter's single select loop reacts to. Keeps
/// the "single logical owner" shape from the concurrency model: only
/// this loop mutates `SessionController` state.
enum LoopEvent {
    ClientMessage(Value),
    ClientClosed,
    BackendOutput(bool, String),
    CommandDone { epoch: u64, goroutine_id: i64, exited: bool },
    BackendExited(std::io::Result<std::process::ExitStatus>),
}

struct Output<W> {
    writer: W,
    next_seq: i64,
}

impl<W: AsyncWrite + Unpin> Output<W> {
    async fn send_response(&mut self, request_seq: i64, command: &str, success: bool, body: Value) -> std::io::Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let msg = json!({
            "seq": seq,
            "type": "response",
            "request_seq": request_seq,
            "success": success,
            "command": command,
            "body": body,
        });
        self.writer.write_all(&encode(&msg)).await
    }

    async fn send_error_response(&mut self, request_seq: i64, command: &str, code: ErrorCode, message: &str) -> std::io::Result<()> {
        let body = json!({"error": {"id": code.as_i64(), "format": message}});
        self.send_response(request_seq, command, false, body).await
    }

    async fn send_event(&mut self, event: &str, body: Value) -> std::io::Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let msg = json!({"seq": seq, "type": "event", "event": event, "body": body});
        self.writer.write_all(&encode(&msg)).await
    }
}

fn get_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

fn get_i64(v: &Value, key: &str) -> Option<i64> {
    v.get(key).and_then(Value::as_i64)
}

fn get_bool(v: &Value, key: &str) -> bool {
    v.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn parse_mode(arguments: &Value) -> LaunchMode {
    match get_str(arguments, "mode").unwrap_or("debug") {
        "test" => LaunchMode::Test,
        "exec" => LaunchMode::Exec,
        "remote" => LaunchMode::AttachRemote,
        _ => LaunchMode::Debug,
    }
}

fn parse_env(arguments: &Value) -> HashMap<String, String> {
    arguments
        .get("env")
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Reads and parses every `envFile` entry (a bare string or a list),
/// in the order given — later files override earlier ones once merged
/// (spec §4.2 "env ... merged from process env, one or more env-files,
/// and per-launch overrides — last wins").
fn read_env_files(arguments: &Value) -> Result<Vec<HashMap<String, String>>, String> {
    let paths: Vec<String> = match arguments.get("envFile") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        _ => Vec::new(),
    };

    let mut parsed = Vec::with_capacity(paths.len());
    for path in paths {
        let contents = std::fs::read_to_string(&path).map_err(|e| format!("cannot read env file {path}: {e}"))?;
        parsed.push(launcher::parse_env_file(&contents).map_err(|e| e.to_string())?);
    }
    Ok(parsed)
}

/// Resolves the GOPATH-relative package path for a directory `program`
/// when the launch has no explicit module mapping (spec §4.2 validation
/// rule for an inferred-GOPATH workspace).
fn infer_gopath_package(arguments: &Value, program: Option<&Path>, cfg: &AdapterConfig) -> Option<String> {
    let has_explicit_mapping = arguments
        .get("packagePathToGoModPathMap")
        .and_then(Value::as_object)
        .map(|m| !m.is_empty())
        .unwrap_or(false);
    if has_explicit_mapping {
        return None;
    }

    let dir = program.filter(|p| p.is_dir())?;
    let gopath = cfg.gopath.first()?;
    launcher::infer_gopath_package(dir, Path::new(gopath))
}

fn parse_requested_breakpoints(arguments: &Value, path_mapper: &PathMapper) -> (String, Vec<RequestedBreakpoint>) {
    let local_file = get_str(arguments, "source").unwrap_or("");
    let local_file = arguments
        .get("source")
        .and_then(|s| s.get("path"))
        .and_then(Value::as_str)
        .unwrap_or(local_file)
        .to_string();
    let remote_file = path_mapper.to_remote(&local_file);

    let breakpoints = arguments
        .get("breakpoints")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let requested = breakpoints
        .iter()
        .map(|bp| RequestedBreakpoint {
            remote_file: remote_file.clone(),
            line: get_i64(bp, "line").unwrap_or(0),
            condition: get_str(bp, "condition").map(str::to_string),
        })
        .collect();

    (local_file, requested)
}

/// Drives one DAP client connection end to end: `initialize` through
/// `disconnect`. No multi-session fan-out (non-goal).
pub async fn run_adapter<R, W>(mut reader: R, writer: W, cfg: AdapterConfig) -> Result<(), Box<dyn Error>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let mut out = Output { writer, next_seq: 1 };

    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<LoopEvent>();
    {
        let client_tx = client_tx.clone();
        tokio::spawn(async move {
            let mut dap_reader = DapReader::new();
            let mut buf = [0u8; 8 * 1024];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        let _ = client_tx.send(LoopEvent::ClientClosed);
                        break;
                    }
                    Ok(n) => {
                        dap_reader.add_bytes(&buf[..n]);
                        while let Some(result) = dap_reader.next_message() {
                            match result {
                                Ok(value) => {
                                    if client_tx.send(LoopEvent::ClientMessage(value)).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => log::error!("malformed client message: {e}"),
                            }
                        }
                    }
                }
            }
        });
    }

    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<(bool, String)>();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<(u64, i64, bool)>();

    let mut session: Option<SessionController> = None;
    let mut child: Option<Child> = None;
    let mut is_no_debug = false;
    let mut stop_on_entry = false;

    loop {
        let event = tokio::select! {
            ev = client_rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
            Some((is_err, text)) = output_rx.recv() => LoopEvent::BackendOutput(is_err, text),
            Some((epoch, goroutine_id, exited)) = command_rx.recv() => LoopEvent::CommandDone { epoch, goroutine_id, exited },
            status = wait_child(&mut child) => LoopEvent::BackendExited(status),
        };

        match event {
            LoopEvent::ClientClosed => break,
            LoopEvent::BackendOutput(is_err, text) => {
                let category = if is_err { OutputCategory::Stderr } else { OutputCategory::Stdout };
                out.send_event("output", SessionController::output_event(category, &text)).await?;
            }
            LoopEvent::BackendExited(status) => {
                child = None;
                let code = status.ok().and_then(|s| s.code());
                if events::exit_code_signals_exited(code) {
                    out.send_event("terminated", events::terminated_event()).await?;
                }
            }
            LoopEvent::CommandDone { epoch, goroutine_id, exited } => {
                if let Some(ctl) = session.as_mut() {
                    let completion = ctl.complete_command(epoch, goroutine_id);
                    if exited {
                        // The backend's own State reported the target has
                        // exited: supersede whatever Stopped/Suppressed
                        // `complete_command` would otherwise have produced.
                        if let Some(ev) = ctl.check_exited(&json!({"exited": true})) {
                            out.send_event("terminated", ev).await?;
                        }
                    } else {
                        match completion {
                            CommandCompletion::Stopped(body) => {
                                out.send_event("stopped", body).await?;
                            }
                            CommandCompletion::Suppressed | CommandCompletion::Stale => {}
                        }
                    }
                }
            }
            LoopEvent::ClientMessage(msg) => {
                let request_seq = get_i64(&msg, "seq").unwrap_or(0);
                let command = get_str(&msg, "command").unwrap_or("").to_string();
                let arguments = msg.get("arguments").cloned().unwrap_or(json!({}));

                match command.as_str() {
                    "initialize" => {
                        let body = json!({
                            "supportsConfigurationDoneRequest": true,
                            "supportsSetVariable": true,
                        });
                        out.send_response(request_seq, &command, true, body).await?;
                    }
                    "launch" | "attach" => {
                        is_no_debug = get_bool(&arguments, "noDebug");
                        stop_on_entry = get_bool(&arguments, "stopOnEntry");
                        let requested_api_version = get_i64(&arguments, "apiVersion").unwrap_or(2) as u8;

                        if is_no_debug_run_bypass(&command, is_no_debug, &arguments) {
                            // spec §4.2/§6 Property 7: bypass the backend entirely,
                            // no RPC connection is ever established.
                            match spawn_no_debug_run(&arguments, output_tx.clone()).await {
                                Ok(spawned) => {
                                    session = None;
                                    child = Some(spawned);
                                    out.send_event("initialized", json!({})).await?;
                                    out.send_response(request_seq, &command, true, json!({})).await?;
                                }
                                Err(message) => {
                                    out.send_error_response(request_seq, &command, ErrorCode::LaunchAttach, &message).await?;
                                }
                            }
                            continue;
                        }

                        match start_session(&command, &arguments, &cfg, output_tx.clone()).await {
                            Ok((mut ctl, spawned_child, _artifact_path)) => {
                                match ctl.transport.call("GetVersion", json!({})).await {
                                    Ok(response) => {
                                        let reported = response.get("APIVersion").and_then(Value::as_i64).unwrap_or(i64::from(requested_api_version));
                                        if reported as u8 != requested_api_version {
                                            if let Some(mut c) = spawned_child {
                                                let _ = c.kill().await;
                                            }
                                            let message = format!(
                                                "backend reports apiVersion {reported}, but the session requested {requested_api_version} — change 'apiVersion' in the launch configuration"
                                            );
                                            out.send_error_response(request_seq, &command, ErrorCode::Version, &message).await?;
                                            continue;
                                        }
                                    }
                                    Err(err) => {
                                        if let Some(mut c) = spawned_child {
                                            let _ = c.kill().await;
                                        }
                                        out.send_error_response(request_seq, &command, ErrorCode::Version, &err.to_string()).await?;
                                        continue;
                                    }
                                }

                                let init_event = ctl.on_backend_ready();
                                session = Some(ctl);
                                child = spawned_child;
                                out.send_event("initialized", init_event).await?;
                                out.send_response(request_seq, &command, true, json!({})).await?;
                            }
                            Err(message) => {
                                out.send_error_response(request_seq, &command, ErrorCode::LaunchAttach, &message).await?;
                            }
                        }
                    }
                    "configurationDone" => {
                        if let Some(ctl) = session.as_mut() {
                            if stop_on_entry {
                                let ev = ctl.configuration_done_stop_on_entry();
                                out.send_event("stopped", ev).await?;
                            } else {
                                issue_continue(ctl, &command_tx);
                            }
                        }
                        out.send_response(request_seq, &command, true, json!({})).await?;
                    }
                    "setBreakpoints" => {
                        if let Some(ctl) = session.as_mut() {
                            let (local_file, requested) = parse_requested_breakpoints(&arguments, &ctl.path_mapper);
                            let plan = ctl.begin_set_breakpoints();
                            if let SetBreakpointsPlan::ViaHalt { halt_call } = plan {
                                if let Err(err) = ctl.transport.call(halt_call.method, halt_call.args).await {
                                    out.send_error_response(request_seq, &command, ErrorCode::SetBreakpointsHalt, &err.to_string()).await?;
                                    continue;
                                }
                            }

                            let (clear_calls, create_calls) = ctl.prepare_breakpoint_calls(&local_file, &requested);
                            for call in &clear_calls {
                                let _ = ctl.transport.call(call.method, call.args.clone()).await;
                            }

                            let mut create_results = Vec::with_capacity(create_calls.len());
                            let mut any_already_exists = false;
                            for call in &create_calls {
                                match ctl.transport.call(call.method, call.args.clone()).await {
                                    Ok(value) => create_results.push(Ok(value)),
                                    Err(err) => {
                                        let message = err.to_string();
                                        if crate::breakpoints::BreakpointManager::is_already_exists(&message) {
                                            any_already_exists = true;
                                        }
                                        create_results.push(Err(message));
                                    }
                                }
                            }

                            let listing_call = ctl.dialect.list_breakpoints();
                            let listing = if any_already_exists {
                                ctl.transport.call(listing_call.method, listing_call.args).await.ok()
                            } else {
                                None
                            };

                            let response = ctl.finish_set_breakpoints(&local_file, &requested, create_results, listing.as_ref());
                            let body = json!({
                                "breakpoints": response.iter().map(|b| json!({"verified": b.verified, "line": b.line})).collect::<Vec<_>>(),
                            });

                            if matches!(ctl.state, RunState::Running) {
                                issue_continue(ctl, &command_tx);
                            }

                            out.send_response(request_seq, &command, true, body).await?;
                        } else {
                            out.send_response(request_seq, &command, true, json!({"breakpoints": []})).await?;
                        }
                    }
                    "threads" => {
                        if let Some(ctl) = session.as_mut() {
                            let threads = match ctl.threads_decision() {
                                ThreadsDecision::Synthetic(threads) => threads,
                                ThreadsDecision::NeedsRpc(call) => match ctl.transport.call(call.method, call.args).await {
                                    Ok(response) => ctl.parse_threads_response(&response),
                                    Err(err) => {
                                        out.send_error_response(request_seq, &command, ErrorCode::Threads, &err.to_string()).await?;
                                        continue;
                                    }
                                },
                            };
                            let body = json!({"threads": threads.iter().map(|t| json!({"id": t.id, "name": t.name})).collect::<Vec<_>>()});
                            out.send_response(request_seq, &command, true, body).await?;
                        }
                    }
                    "stackTrace" => {
                        if let Some(ctl) = session.as_mut() {
                            let goroutine_id = get_i64(&arguments, "threadId").unwrap_or(1);
                            let start_frame = get_i64(&arguments, "startFrame").unwrap_or(0);
                            let levels = get_i64(&arguments, "levels").unwrap_or(0);
                            let call = ctl.stack_trace_call(goroutine_id);
                            match ctl.transport.call(call.method, call.args).await {
                                Ok(response) => {
                                    let frames = ctl.render_stack_trace(goroutine_id, &response, start_frame, levels);
                                    let body = json!({
                                        "stackFrames": frames.iter().map(|f| json!({
                                            "id": f.id,
                                            "name": f.name,
                                            "source": {"path": f.source_path},
                                            "line": f.line,
                                            "column": f.column,
                                        })).collect::<Vec<_>>(),
                                        "totalFrames": frames.len(),
                                    });
                                    out.send_response(request_seq, &command, true, body).await?;
                                }
                                Err(err) => {
                                    out.send_error_response(request_seq, &command, ErrorCode::StackTrace, &err.to_string()).await?;
                                }
                            }
                        }
                    }
                    "scopes" => {
                        if let Some(ctl) = session.as_mut() {
                            let frame_handle = get_i64(&arguments, "frameId").unwrap_or(0);
                            match ctl.scopes_calls(frame_handle) {
                                Ok((frame, args_call, locals_call)) => {
                                    let args_response = ctl.transport.call(args_call.method, args_call.args).await;
                                    let locals_response = ctl.transport.call(locals_call.method, locals_call.args).await;
                                    match (args_response, locals_response) {
                                        (Ok(args_resp), Ok(locals_resp)) => {
                                            let handle = ctl.build_locals_scope(frame, &args_resp, &locals_resp);
                                            let mut scopes = vec![json!({"name": "Locals", "variablesReference": handle, "expensive": false})];

                                            if ctl.show_globals {
                                                match globals_scope(ctl, frame).await {
                                                    Ok(Some(scope)) => scopes.push(scope),
                                                    Ok(None) => {}
                                                    Err(err) => {
                                                        out.send_error_response(request_seq, &command, ErrorCode::Globals, &err).await?;
                                                        continue;
                                                    }
                                                }
                                            }

                                            let body = json!({"scopes": scopes});
                                            out.send_response(request_seq, &command, true, body).await?;
                                        }
                                        (Err(err), _) => {
                                            out.send_error_response(request_seq, &command, ErrorCode::Args, &err.to_string()).await?;
                                        }
                                        (_, Err(err)) => {
                                            out.send_error_response(request_seq, &command, ErrorCode::ScopesLocals, &err.to_string()).await?;
                                        }
                                    }
                                }
                                Err(err) => {
                                    out.send_error_response(request_seq, &command, ErrorCode::ScopesLocals, &err.to_string()).await?;
                                }
                            }
                        }
                    }
                    "variables" => {
                        if let Some(ctl) = session.as_mut() {
                            let handle = get_i64(&arguments, "variablesReference").unwrap_or(0);
                            match ctl.variables_decision(handle) {
                                Ok(VariablesDecision::Ready(var_ref)) => {
                                    let rendered = ctl.render_variable_children(&var_ref);
                                    out.send_response(request_seq, &command, true, variables_body(&rendered)).await?;
                                }
                                Ok(VariablesDecision::NeedsEval { call, parent_fqn, parent_kind, goroutine_id, frame_index }) => {
                                    match ctl.transport.call(call.method, call.args).await {
                                        Ok(response) => {
                                            let rendered = ctl.render_eval_children(&response, &parent_fqn, &parent_kind, goroutine_id, frame_index);
                                            out.send_response(request_seq, &command, true, variables_body(&rendered)).await?;
                                        }
                                        Err(err) => {
                                            out.send_error_response(request_seq, &command, ErrorCode::ScopesLocals, &err.to_string()).await?;
                                        }
                                    }
                                }
                                Err(err) => {
                                    out.send_error_response(request_seq, &command, ErrorCode::ScopesLocals, &err.to_string()).await?;
                                }
                            }
                        }
                    }
                    "continue" => {
                        if let Some(ctl) = session.as_mut() {
                            issue_continue(ctl, &command_tx);
                        }
                        out.send_response(request_seq, &command, true, json!({"allThreadsContinued": true})).await?;
                    }
                    "next" | "stepIn" | "stepOut" => {
                        if let Some(ctl) = session.as_mut() {
                            let backend_name = match command.as_str() {
                                "next" => "next",
                                "stepIn" => "step",
                                _ => "stepOut",
                            };
                            issue_step(ctl, backend_name, &command_tx);
                        }
                        out.send_response(request_seq, &command, true, json!({})).await?;
                    }
                    "pause" => {
                        if let Some(ctl) = session.as_mut()
                            && let Some(call) = ctl.request_pause()
                        {
                            let _ = ctl.transport.call(call.method, call.args).await;
                        }
                        out.send_response(request_seq, &command, true, json!({})).await?;
                    }
                    "evaluate" => {
                        if let Some(ctl) = session.as_mut() {
                            let frame_handle = get_i64(&arguments, "frameId").unwrap_or(0);
                            let expr = get_str(&arguments, "expression").unwrap_or("").to_string();
                            match ctl.evaluate_call(frame_handle, &expr) {
                                Ok(call) => match ctl.transport.call(call.method, call.args).await {
                                    Ok(response) => match ctl.render_evaluate_result(&response, frame_handle, &expr) {
                                        Ok(rendered) => {
                                            let body = json!({
                                                "result": rendered.value,
                                                "type": rendered.var_type,
                                                "variablesReference": rendered.variables_reference,
                                            });
                                            out.send_response(request_seq, &command, true, body).await?;
                                        }
                                        Err(err) => {
                                            out.send_error_response(request_seq, &command, ErrorCode::Evaluate, &err.to_string()).await?;
                                        }
                                    },
                                    Err(err) => {
                                        out.send_error_response(request_seq, &command, ErrorCode::Evaluate, &err.to_string()).await?;
                                    }
                                },
                                Err(err) => {
                                    out.send_error_response(request_seq, &command, ErrorCode::Evaluate, &err.to_string()).await?;
                                }
                            }
                        }
                    }
                    "setVariable" => {
                        if let Some(ctl) = session.as_mut() {
                            let container_handle = get_i64(&arguments, "variablesReference").unwrap_or(0);
                            let name = get_str(&arguments, "name").unwrap_or("").to_string();
                            let value = get_str(&arguments, "value").unwrap_or("").to_string();
                            match ctl.set_variable_call(container_handle, &name, &value) {
                                Ok((call, fqn, goroutine_id, frame_index)) => {
                                    match ctl.transport.call(call.method, call.args).await {
                                        Ok(_) => {
                                            let scope = json!({"GoroutineID": goroutine_id, "Frame": frame_index});
                                            let eval_call = ctl.dialect.eval(scope, &fqn, ctl.load_config);
                                            match ctl.transport.call(eval_call.method, eval_call.args).await {
                                                Ok(response) => {
                                                    let node = ctl.dialect.unwrap_variable(&response).clone();
                                                    let rendered = ctl.variables.render_entry(&name, &node, &fqn, goroutine_id, frame_index);
                                                    let body = json!({
                                                        "value": rendered.value,
                                                        "type": rendered.var_type,
                                                        "variablesReference": rendered.variables_reference,
                                                    });
                                                    out.send_response(request_seq, &command, true, body).await?;
                                                }
                                                Err(err) => {
                                                    out.send_error_response(request_seq, &command, ErrorCode::PauseSetVariable, &err.to_string()).await?;
                                                }
                                            }
                                        }
                                        Err(err) => {
                                            out.send_error_response(request_seq, &command, ErrorCode::PauseSetVariable, &err.to_string()).await?;
                                        }
                                    }
                                }
                                Err(err) => {
                                    out.send_error_response(request_seq, &command, ErrorCode::PauseSetVariable, &err.to_string()).await?;
                                }
                            }
                        }
                    }
                    "disconnect" => {
                        if let Some(mut ctl) = session.take() {
                            handle_disconnect(&mut ctl, &mut child, is_no_debug).await;
                        } else if let Some(mut c) = child.take() {
                            // no-debug-run bypass: no backend to halt/detach,
                            // just tear down the `go run` child directly.
                            let _ = c.kill().await;
                        }
                        out.send_response(request_seq, &command, true, json!({})).await?;
                        break;
                    }
                    other => {
                        log::warn!("unhandled DAP command: {other}");
                        out.send_response(request_seq, &command, true, json!({})).await?;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<std::process::ExitStatus> {
    match child {
        Some(c) => c.wait().await,
        None => std::future::pending().await,
    }
}

/// Resolves the session's package name (caching per directory), issues
/// `ListPackageVars`, and builds the "Globals" scope entry — or `None`
/// if the package couldn't be determined (spec §4.7 "Globals",
/// silently omitted per spec §9 Open Question 3).
async fn globals_scope(ctl: &mut SessionController, frame: FrameRef) -> Result<Option<Value>, String> {
    let dir = PathBuf::from(ctl.path_mapper.local_root.clone());
    let pkg = match ctl.globals.get_cached(&dir) {
        Some(cached) => cached,
        None => {
            let dir_for_blocking = dir.clone();
            let name = tokio::task::spawn_blocking(move || globals::run_go_list(&dir_for_blocking)).await.unwrap_or(None);
            ctl.globals.store(dir.clone(), name.clone());
            name
        }
    };

    let Some(pkg) = pkg else {
        return Ok(None);
    };

    let call = ctl.globals_call(&pkg);
    match ctl.transport.call(call.method, call.args).await {
        Ok(response) => {
            let handle = ctl.build_globals_scope(frame, &pkg, &response);
            Ok(Some(json!({"name": "Globals", "variablesReference": handle, "expensive": false})))
        }
        Err(err) => Err(err.to_string()),
    }
}

fn variables_body(rendered: &[crate::variables::RenderedVariable]) -> Value {
    json!({
        "variables": rendered.iter().map(|v| json!({
            "name": v.name,
            "value": v.value,
            "type": v.var_type,
            "variablesReference": v.variables_reference,
        })).collect::<Vec<_>>(),
    })
}

/// Spawns a `continue` Command as a detached task so a long-running
/// backend call never blocks the event loop from answering `threads`
/// synthetically or processing `setBreakpoints`/`disconnect` meanwhile.
fn issue_continue(ctl: &mut SessionController, command_tx: &mpsc::UnboundedSender<(u64, i64, bool)>) {
    issue_command(ctl, "continue", StopReason::Breakpoint, command_tx);
}

fn issue_step(ctl: &mut SessionController, name: &'static str, command_tx: &mpsc::UnboundedSender<(u64, i64, bool)>) {
    issue_command(ctl, name, StopReason::Step, command_tx);
}

fn issue_command(
    ctl: &mut SessionController,
    name: &'static str,
    reason: StopReason,
    command_tx: &mpsc::UnboundedSender<(u64, i64, bool)>,
) {
    let (call, epoch) = ctl.begin_command(name, reason);
    let transport = ctl.transport.clone();
    let dialect_version = ctl.dialect.version();
    let command_tx = command_tx.clone();
    tokio::spawn(async move {
        let dialect = dialect_for(dialect_version);
        let (goroutine_id, exited) = match transport.call(call.method, call.args).await {
            Ok(response) => {
                let state = dialect.unwrap_state(&response);
                let goroutine_id = state.get("currentGoroutine").and_then(|g| g.get("id")).and_then(Value::as_i64).unwrap_or(1);
                (goroutine_id, events::state_signals_exited(&state))
            }
            Err(_) => (1, false),
        };
        let _ = command_tx.send((epoch, goroutine_id, exited));
    });
}

/// Whether this `launch` request should bypass the backend entirely and
/// run `go run` directly (spec §4.2 no-debug-run, Testable Property 7).
/// Only applies to `launch` (never `attach`) with `noDebug: true` and a
/// `mode` that resolves to `debug` (the default when unset).
fn is_no_debug_run_bypass(command: &str, is_no_debug: bool, arguments: &Value) -> bool {
    command == "launch" && is_no_debug && matches!(parse_mode(arguments), LaunchMode::Debug)
}

/// Spawns `go run <program> [args]` directly, bypassing the backend and
/// the JSON-RPC transport entirely (spec §4.2 no-debug-run path,
/// Testable Property 7). stdout/stderr are streamed through `output_tx`
/// as `OutputEvent`s exactly like a real backend's would be.
async fn spawn_no_debug_run(arguments: &Value, output_tx: mpsc::UnboundedSender<(bool, String)>) -> Result<Child, String> {
    let program = arguments.get("program").and_then(Value::as_str).map(PathBuf::from).ok_or("the 'program' attribute is missing in the debug configuration")?;
    let cwd = arguments.get("cwd").and_then(Value::as_str).map(PathBuf::from);

    let env_files = read_env_files(arguments)?;
    let process_env: HashMap<String, String> = std::env::vars().collect();
    let merged_env = launcher::merge_env(&process_env, &env_files, &parse_env(arguments));

    let req = LaunchRequest {
        mode: LaunchMode::NoDebugRun,
        program: Some(program),
        cwd: cwd.clone(),
        env: merged_env.clone(),
        build_flags: Vec::new(),
        program_args: arguments.get("args").and_then(Value::as_array).map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()).unwrap_or_default(),
        backend_path: PathBuf::from("go"),
        log: false,
        log_output: None,
        init: None,
        backend_name: None,
        host: "127.0.0.1".to_string(),
        port: None,
        api_version: 2,
        gopath_package: None,
        output: None,
    };

    let (argv, spawn_cwd) = launcher::build_argv(&req).map_err(|e| e.to_string())?;
    launcher::spawn_go_run(argv, spawn_cwd, &merged_env, output_tx).await.map_err(|e| e.to_string())
}

/// Builds the launch/attach request and spawns (or connects to) the
/// backend, returning an initialized `SessionController`.
async fn start_session(
    command: &str,
    arguments: &Value,
    cfg: &AdapterConfig,
    output_tx: mpsc::UnboundedSender<(bool, String)>,
) -> Result<(SessionController, Option<Child>, Option<PathBuf>), String> {
    let api_version = get_i64(arguments, "apiVersion").unwrap_or(2) as u8;
    let host = get_str(arguments, "host").unwrap_or("127.0.0.1").to_string();
    let port = get_i64(arguments, "port").map(|p| p as u16);
    let program = arguments.get("program").and_then(Value::as_str).map(PathBuf::from);
    let cwd = arguments.get("cwd").and_then(Value::as_str).map(PathBuf::from);
    let backend_path = arguments
        .get("dlvToolPath")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("dlv"));

    let mode = if command == "attach" {
        if get_str(arguments, "mode").unwrap_or("local") == "remote" {
            LaunchMode::AttachRemote
        } else {
            let pid = get_i64(arguments, "processId").ok_or("the 'processId' attribute is missing for a local attach")? as u32;
            LaunchMode::AttachLocal { pid }
        }
    } else if get_bool(arguments, "noDebug") {
        LaunchMode::NoDebugRun
    } else {
        parse_mode(arguments)
    };

    let env_files = read_env_files(arguments)?;
    let process_env: HashMap<String, String> = std::env::vars().collect();
    let merged_env = launcher::merge_env(&process_env, &env_files, &parse_env(arguments));
    let gopath_package = if matches!(mode, LaunchMode::Debug | LaunchMode::Test) {
        infer_gopath_package(arguments, program.as_deref(), cfg)
    } else {
        None
    };

    let req = LaunchRequest {
        mode: mode.clone(),
        program: program.clone(),
        cwd: cwd.clone(),
        env: merged_env,
        build_flags: arguments.get("buildFlags").and_then(Value::as_array).map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()).unwrap_or_default(),
        program_args: arguments.get("args").and_then(Value::as_array).map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()).unwrap_or_default(),
        backend_path: backend_path.clone(),
        log: get_bool(arguments, "showLog"),
        log_output: get_str(arguments, "logOutput").map(str::to_string),
        init: get_str(arguments, "init").map(str::to_string),
        backend_name: get_str(arguments, "backend").map(str::to_string),
        host: host.clone(),
        // Resolved once here so every later read of `req.port` (argv
        // construction and the actual spawn/listen address) agrees on
        // the same randomly-picked port when the client didn't pin one.
        port: Some(port.unwrap_or_else(launcher::random_port)),
        api_version,
        gopath_package,
        output: get_str(arguments, "output").map(str::to_string),
    };

    let remote_path = get_str(arguments, "remotePath").unwrap_or("").to_string();
    let local_root = cwd.as_ref().or(program.as_ref()).map(|p| p.display().to_string()).unwrap_or_default();
    let path_mapper = PathMapper {
        local_root,
        remote_root: remote_path,
        local_sep: Separator::Slash,
        remote_sep: Separator::Slash,
        goroot: cfg.goroot.clone(),
        gopath: cfg.gopath.clone(),
    };

    let load_config = LoadConfig::default();
    let stack_trace_depth = get_i64(arguments, "stackTraceDepth").unwrap_or(50);
    let show_globals = get_bool(arguments, "showGlobalVariables");

    let (transport, child, listen_addr, artifact) = match &mode {
        LaunchMode::AttachRemote => {
            launcher::connect_remote_grace_delay().await;
            let addr = format!("{host}:{}", port.ok_or("the 'port' attribute is required for a remote attach")?);
            let transport = BackendTransport::connect(&addr).await.map_err(|e| e.to_string())?;
            (transport, None, addr, None)
        }
        _ => {
            let (argv, spawn_cwd) = launcher::build_argv(&req).map_err(|e| e.to_string())?;
            let spawned = launcher::spawn(&req, argv, spawn_cwd.clone(), &req.env, output_tx, Duration::from_secs(30))
                .await
                .map_err(|e| e.to_string())?;
            let transport = BackendTransport::connect(&spawned.listen_addr).await.map_err(|e| e.to_string())?;
            let artifact = match &mode {
                LaunchMode::Debug | LaunchMode::Test => Some(spawn_cwd.join(launcher::artifact_basename(&req.output))),
                _ => None,
            };
            (transport, Some(spawned.child), spawned.listen_addr, artifact)
        }
    };
    let _listen_addr = listen_addr;

    let locality = if matches!(mode, LaunchMode::AttachRemote) { Locality::Remote } else { Locality::Local };
    let dialect = dialect_for(api_version);

    let mut ctl = SessionController::new(dialect, transport, path_mapper, load_config, stack_trace_depth, show_globals, locality);
    ctl.artifact_path = artifact.clone();
    Ok((ctl, child, artifact))
}

/// Tri-modal shutdown per the disconnect orchestrator (spec §4.5/§4.9).
async fn handle_disconnect(ctl: &mut SessionController, child: &mut Option<Child>, is_no_debug: bool) {
    match ctl.begin_disconnect(is_no_debug) {
        DisconnectStep::CloseSocketOnly | DisconnectStep::ResolveImmediately => {}
        DisconnectStep::IssueHalt => {
            let halt_call = ctl.dialect.command("halt");
            let outcome = match tokio::time::timeout(crate::disconnect::HALT_WATCHDOG, ctl.transport.call(halt_call.method, halt_call.args)).await {
                Ok(Ok(value)) => HaltOutcome::Completed(Ok(value)),
                Ok(Err(err)) => HaltOutcome::Completed(Err(json!({"error": err.to_string()}))),
                Err(_) => HaltOutcome::TimedOut,
            };

            match ctl.classify_halt(&outcome) {
                AfterHalt::ForceCleanup => force_cleanup(ctl, child).await,
                AfterHalt::SkipDetach => {}
                AfterHalt::IssueDetach => {
                    let detach_call = ctl.detach_call();
                    if ctl.transport.call(detach_call.method, detach_call.args).await.is_err() {
                        force_cleanup(ctl, child).await;
                    }
                }
            }
        }
    }
}

async fn force_cleanup(ctl: &SessionController, child: &mut Option<Child>) {
    if let Some(c) = child.as_mut() {
        let _ = c.kill().await;
    }
    ctl.remove_artifact();
}
