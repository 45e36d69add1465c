//! Implements the DAP request handlers and owns the high-level
//! run-state machine (spec §4.5).
//!
//! Split into two layers on purpose: plain decision methods (no
//! `async`, fully unit-testable) that own the continue-epoch and
//! `skip_stop_event_once` bookkeeping, and thin `async` leaves that
//! issue the one-shot RPCs a decision calls for. The caller (the event
//! loop in `main.rs`) is the only place that actually races futures
//! against each other with `tokio::select!`, matching the single
//! logical owner described for the concurrency model: the controller
//! itself never blocks waiting on a backend RPC it doesn't need to.

use std::path::PathBuf;

use serde_json::{Value, json};

use crate::api_version::{ApiDialect, LoadConfig, RpcCall};
use crate::backend_transport::BackendTransport;
use crate::breakpoints::{BreakpointManager, RequestedBreakpoint, VerifiedBreakpoint};
use crate::disconnect::{self, AfterHalt, DisconnectStep, HaltOutcome, Locality};
use crate::events::{self, OutputCategory, StopReason};
use crate::globals::PackageNameCache;
use crate::path_mapper::PathMapper;
use crate::variables::{
    FrameRef, HandleLookupError, RenderedVariable, VariableRef, VariableRenderer, needs_fresh_eval,
};

/// The backend-run-state from spec §4.5's transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotConnected,
    ConnectedStopped,
    Running,
    Exited,
}

/// A synthesized or backend-reported thread (spec §3 "Goroutine").
#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub id: i64,
    pub name: String,
}

/// Outcome of `threads_decision`: either answer immediately from the
/// synthetic fallback (Testable Property 6), or issue the RPC.
#[derive(Debug)]
pub enum ThreadsDecision {
    Synthetic(Vec<Thread>),
    NeedsRpc(RpcCall),
}

/// Outcome of resolving a long-running `Command` (continue/next/stepIn/
/// stepOut, possibly interrupted by a concurrent pause or breakpoint
/// edit).
#[derive(Debug)]
pub enum CommandCompletion {
    /// The epoch didn't match the controller's current one: a stale
    /// completion from a superseded command (Testable Property 5).
    Stale,
    /// `skip_stop_event_once` consumed this completion; nothing is sent
    /// to the client.
    Suppressed,
    /// The client should be sent this `Stopped` event.
    Stopped(Value),
}

/// What the caller must do to carry out a `setBreakpoints` request
/// (spec §4.5 "Breakpoint-edit-during-run protocol").
#[derive(Debug)]
pub enum SetBreakpointsPlan {
    /// Session is already stopped: reconcile immediately.
    Direct,
    /// Session is running: issue `Command{halt}` first. The original
    /// in-flight continue's completion (tracked elsewhere) will resolve
    /// with `CommandCompletion::Suppressed`; the caller then reconciles
    /// and issues a fresh continue.
    ViaHalt { halt_call: RpcCall },
}

/// One rendered DAP `StackFrame`.
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrameDto {
    pub id: i64,
    pub name: String,
    pub source_path: String,
    pub line: i64,
    pub column: i64,
}

/// What the caller must do to answer a `variables` request.
#[derive(Debug)]
pub enum VariablesDecision {
    Ready(VariableRef),
    NeedsEval {
        call: RpcCall,
        parent_fqn: String,
        /// The expanded node's reflect-kind, carried through so the
        /// fresh Eval's children are rendered with the same map/boxed-
        /// element rules as an already-loaded node would be (spec §4.7).
        parent_kind: String,
        goroutine_id: i64,
        frame_index: i64,
    },
}

fn get_str<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("")
}

fn get_i64(v: &Value, key: &str) -> i64 {
    v.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn get_bool(v: &Value, key: &str) -> bool {
    v.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Dialect-invariant: `ListGoroutines` has no per-version shape
/// difference (spec §4.4 does not list it among the differing RPCs), so
/// it's issued directly here instead of through `ApiDialect`.
fn list_goroutines_call() -> RpcCall {
    RpcCall {
        method: "ListGoroutines",
        args: json!({}),
    }
}

fn parse_threads(dialect: &dyn ApiDialect, response: &Value) -> Vec<Thread> {
    let list = dialect.unwrap_locations(response);
    let items: Vec<Thread> = list
        .as_array()
        .into_iter()
        .flatten()
        .map(|g| Thread {
            id: get_i64(g, "id"),
            name: format!("Goroutine {}", get_i64(g, "id")),
        })
        .collect();

    if items.is_empty() {
        vec![Thread { id: 1, name: "Dummy".to_string() }]
    } else {
        items
    }
}

fn child_fqn(parent_fqn: &str, child_name: &str) -> String {
    if parent_fqn.is_empty() {
        child_name.to_string()
    } else {
        format!("{parent_fqn}.{child_name}")
    }
}

/// Owns the explicit run-state machine, the continue-epoch/skip-flag
/// bookkeeping, the backend transport, and the per-session
/// collaborators (spec §4.5).
pub struct SessionController {
    pub state: RunState,
    pub dialect: Box<dyn ApiDialect>,
    pub transport: BackendTransport,
    pub path_mapper: PathMapper,
    pub breakpoints: BreakpointManager,
    pub variables: VariableRenderer,
    pub load_config: LoadConfig,
    pub stack_trace_depth: i64,
    pub show_globals: bool,
    pub locality: Locality,
    pub artifact_path: Option<PathBuf>,
    pub current_goroutine_id: i64,
    pub globals: PackageNameCache,

    continue_epoch: u64,
    command_in_flight: bool,
    skip_stop_event_once: bool,
    pending_reason: StopReason,
    pending_pause: bool,
}

impl SessionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dialect: Box<dyn ApiDialect>,
        transport: BackendTransport,
        path_mapper: PathMapper,
        load_config: LoadConfig,
        stack_trace_depth: i64,
        show_globals: bool,
        locality: Locality,
    ) -> Self {
        Self {
            state: RunState::NotConnected,
            dialect,
            transport,
            path_mapper,
            breakpoints: BreakpointManager::new(),
            variables: VariableRenderer::new(),
            load_config,
            stack_trace_depth,
            show_globals,
            locality,
            artifact_path: None,
            current_goroutine_id: 1,
            globals: PackageNameCache::new(),
            continue_epoch: 0,
            command_in_flight: false,
            skip_stop_event_once: false,
            pending_reason: StopReason::Entry,
            pending_pause: false,
        }
    }

    /// Transition `not-connected -> connected-stopped` once the
    /// launcher reports readiness and the transport is live.
    pub fn on_backend_ready(&mut self) -> Value {
        self.state = RunState::ConnectedStopped;
        events::initialized_event()
    }

    /// `configurationDone` with `stopOnEntry=true`: emit Stopped("entry")
    /// without issuing continue.
    pub fn configuration_done_stop_on_entry(&mut self) -> Value {
        events::stopped_event(StopReason::Entry, self.current_goroutine_id)
    }

    /// Begins a long-running backend `Command` (continue/next/stepIn/
    /// stepOut). Bumps the epoch and marks a command in flight; only
    /// `continue` transitions the run-state to `Running` (next/step/etc
    /// are issued while already stopped per the transition table).
    pub fn begin_command(&mut self, name: &'static str, default_reason: StopReason) -> (RpcCall, u64) {
        self.continue_epoch += 1;
        self.command_in_flight = true;
        self.pending_reason = default_reason;
        if name == "continue" {
            self.state = RunState::Running;
        }
        (self.dialect.command(name), self.continue_epoch)
    }

    /// Requests a `halt` to interrupt whatever command is currently in
    /// flight (client-issued pause). Returns `None` if nothing is in
    /// flight to interrupt — the session is already stopped.
    pub fn request_pause(&mut self) -> Option<RpcCall> {
        if !self.command_in_flight {
            return None;
        }
        self.pending_pause = true;
        Some(self.dialect.command("halt"))
    }

    /// Resolves the completion of whichever command `epoch` tagged.
    pub fn complete_command(&mut self, epoch: u64, goroutine_id: i64) -> CommandCompletion {
        if epoch != self.continue_epoch {
            return CommandCompletion::Stale;
        }

        self.command_in_flight = false;
        self.state = RunState::ConnectedStopped;
        self.current_goroutine_id = goroutine_id;
        self.variables.reset_on_stop();

        let reason = if self.pending_pause {
            self.pending_pause = false;
            StopReason::Pause
        } else {
            self.pending_reason
        };

        if self.skip_stop_event_once {
            self.skip_stop_event_once = false;
            CommandCompletion::Suppressed
        } else {
            CommandCompletion::Stopped(events::stopped_event(reason, goroutine_id))
        }
    }

    /// Observes a backend `State` response or process exit and decides
    /// whether a `Terminated` event must be sent.
    pub fn check_exited(&mut self, state: &Value) -> Option<Value> {
        if events::state_signals_exited(state) {
            self.state = RunState::Exited;
            Some(events::terminated_event())
        } else {
            None
        }
    }

    /// `threads` request (spec §4.5 "Threads while running", Testable
    /// Property 6): synthesizes without issuing any backend RPC while a
    /// command is in flight.
    pub fn threads_decision(&self) -> ThreadsDecision {
        if self.command_in_flight {
            ThreadsDecision::Synthetic(vec![Thread { id: 1, name: "Dummy".to_string() }])
        } else {
            ThreadsDecision::NeedsRpc(list_goroutines_call())
        }
    }

    pub fn parse_threads_response(&self, response: &Value) -> Vec<Thread> {
        parse_threads(self.dialect.as_ref(), response)
    }

    /// Builds the `Stacktrace`/`StacktraceGoroutine` call.
    pub fn stack_trace_call(&self, goroutine_id: i64) -> RpcCall {
        self.dialect.stacktrace(goroutine_id, self.stack_trace_depth, false)
    }

    /// Renders a stacktrace response into DAP stack frames, honouring
    /// `startFrame`/`levels`, minting a fresh frame handle per entry,
    /// and path-mapping each source file back to the local workspace.
    pub fn render_stack_trace(
        &mut self,
        goroutine_id: i64,
        response: &Value,
        start_frame: i64,
        levels: i64,
    ) -> Vec<StackFrameDto> {
        let locations = self.dialect.unwrap_locations(response);
        let frames = locations.as_array().cloned().unwrap_or_default();

        let start = start_frame.max(0) as usize;
        let end = if levels <= 0 {
            frames.len()
        } else {
            (start + levels as usize).min(frames.len())
        };

        frames
            .into_iter()
            .enumerate()
            .skip(start)
            .take(end.saturating_sub(start))
            .map(|(index, frame)| {
                let handle = self.variables.frame_handles.insert(FrameRef {
                    goroutine_id,
                    frame_index: index as i64,
                });
                let remote_file = get_str(&frame, "file").to_string();
                StackFrameDto {
                    id: handle,
                    name: get_str(&frame, "function").to_string(),
                    source_path: self.path_mapper.to_local(&remote_file),
                    line: get_i64(&frame, "line"),
                    column: 0,
                }
            })
            .collect()
    }

    /// Builds the `ListFunctionArgs`/`ListLocalVars` calls for a
    /// `scopes` request against the frame behind `frame_handle`.
    pub fn scopes_calls(&self, frame_handle: i64) -> Result<(FrameRef, RpcCall, RpcCall), HandleLookupError> {
        let frame = *self.variables.frame_handles.get(frame_handle)?;
        let scope = json!({"GoroutineID": frame.goroutine_id, "Frame": frame.frame_index});
        let args_call = self.dialect.list_function_args(scope.clone(), self.load_config);
        let locals_call = self.dialect.list_local_vars(scope, self.load_config);
        Ok((frame, args_call, locals_call))
    }

    /// Merges the args/locals responses into a single "Locals" scope
    /// (vscode-go convention: one merged scope, args first), mints a
    /// container handle, and returns it as the scope's
    /// `variablesReference`.
    pub fn build_locals_scope(&mut self, frame: FrameRef, args_response: &Value, locals_response: &Value) -> i64 {
        let args = self.dialect.unwrap_variables(args_response).as_array().cloned().unwrap_or_default();
        let locals = self.dialect.unwrap_variables(locals_response).as_array().cloned().unwrap_or_default();

        let mut merged: Vec<(String, Value)> = args
            .into_iter()
            .chain(locals)
            .map(|node| (get_str(&node, "name").to_string(), node))
            .collect();

        crate::variables::disambiguate_shadows(&mut merged);

        let children: Vec<Value> = merged
            .into_iter()
            .map(|(name, mut node)| {
                node["name"] = json!(name);
                node
            })
            .collect();

        let container = json!({"kind": "ScopeRoot", "children": children});
        self.variables.variable_handles.insert(VariableRef {
            node: container,
            fqn: String::new(),
            eval_expr: String::new(),
            goroutine_id: frame.goroutine_id,
            frame_index: frame.frame_index,
        })
    }

    /// Builds the `ListPackageVars` call for the session's package-var
    /// filter (spec §4.7 "Globals"), given an already-resolved package
    /// name (looked up via `go list`, cached per directory — spec §5).
    pub fn globals_call(&self, pkg: &str) -> RpcCall {
        let filter = crate::globals::package_filter(pkg);
        self.dialect.list_package_vars(&filter, self.load_config)
    }

    /// Builds the "Globals" scope container from a `ListPackageVars`
    /// response: strips the `<pkg>.` prefix from each name, drops the
    /// `initdone·` entry, and mints a scope handle (spec §4.7).
    pub fn build_globals_scope(&mut self, frame: FrameRef, pkg: &str, response: &Value) -> i64 {
        let list = self.dialect.unwrap_variables(response).as_array().cloned().unwrap_or_default();
        let stripped = crate::globals::strip_package_prefix(pkg, &list);
        let container = json!({"kind": "ScopeRoot", "children": stripped});
        self.variables.variable_handles.insert(VariableRef {
            node: container,
            fqn: String::new(),
            eval_expr: String::new(),
            goroutine_id: frame.goroutine_id,
            frame_index: frame.frame_index,
        })
    }

    /// What the caller must do to answer a `variables` request for
    /// `handle`: render immediately if already loaded, or issue a fresh
    /// `Eval` first (spec §4.7 "Lazy expansion").
    pub fn variables_decision(&self, handle: i64) -> Result<VariablesDecision, HandleLookupError> {
        let var_ref = self.variables.variable_handles.get(handle)?.clone();
        if needs_fresh_eval(&var_ref.node) {
            let scope = json!({"GoroutineID": var_ref.goroutine_id, "Frame": var_ref.frame_index});
            let call = self.dialect.eval(scope, &var_ref.eval_expr, self.load_config);
            let parent_kind = get_str(&var_ref.node, "kind").to_string();
            Ok(VariablesDecision::NeedsEval {
                call,
                parent_fqn: var_ref.fqn,
                parent_kind,
                goroutine_id: var_ref.goroutine_id,
                frame_index: var_ref.frame_index,
            })
        } else {
            Ok(VariablesDecision::Ready(var_ref))
        }
    }

    /// Renders the already-loaded children of `var_ref`, minting fresh
    /// variable handles for any expandable grandchildren.
    pub fn render_variable_children(&mut self, var_ref: &VariableRef) -> Vec<RenderedVariable> {
        let children = var_ref.node.get("children").and_then(Value::as_array).cloned().unwrap_or_default();
        let parent_kind = get_str(&var_ref.node, "kind").to_string();
        self.render_children_of_kind(&children, &parent_kind, &var_ref.fqn, var_ref.goroutine_id, var_ref.frame_index)
    }

    /// Renders the children carried by a fresh `Eval` response (the
    /// `NeedsEval` branch of [`variables_decision`]).
    pub fn render_eval_children(
        &mut self,
        eval_response: &Value,
        parent_fqn: &str,
        parent_kind: &str,
        goroutine_id: i64,
        frame_index: i64,
    ) -> Vec<RenderedVariable> {
        let node = self.dialect.unwrap_variable(eval_response).clone();
        let children = node.get("children").and_then(Value::as_array).cloned().unwrap_or_default();
        self.render_children_of_kind(&children, parent_kind, parent_fqn, goroutine_id, frame_index)
    }

    /// Dispatches child rendering on the parent's reflect-kind (spec
    /// §4.7 "Lazy expansion"): map children are alternating key/value
    /// pairs evaluated by index rather than by field name; slice/array
    /// elements that are themselves boxed (address-only) placeholders
    /// are re-evaluated by address rather than by name; everything else
    /// uses the general `<parent-fqn>.<child-name>` rule.
    fn render_children_of_kind(
        &mut self,
        children: &[Value],
        parent_kind: &str,
        parent_fqn: &str,
        goroutine_id: i64,
        frame_index: i64,
    ) -> Vec<RenderedVariable> {
        if parent_kind == "Map" {
            return self.render_map_children(children, parent_fqn, goroutine_id, frame_index);
        }

        let boxed_elements = matches!(parent_kind, "Slice" | "Array");
        children
            .iter()
            .map(|child| {
                let name = get_str(child, "name").to_string();
                let fqn = child_fqn(parent_fqn, &name);
                let eval_expr = if boxed_elements && get_bool(child, "onlyAddr") {
                    let addr = get_i64(child, "address");
                    crate::variables::boxed_element_eval_expr(&format!("0x{addr:x}"), get_str(child, "type"))
                } else {
                    fqn.clone()
                };
                self.variables.render_entry_with_eval(&name, child, &fqn, &eval_expr, goroutine_id, frame_index)
            })
            .collect()
    }

    /// Renders a map's children as alternating key/value pairs (spec
    /// §4.7): keys render and get handles like any other value, but
    /// each value's fqn/eval expression is `<map-fqn>[<rendered-key>]`
    /// rather than `<map-fqn>.<name>`, since map entries aren't named
    /// struct fields.
    fn render_map_children(
        &mut self,
        children: &[Value],
        map_fqn: &str,
        goroutine_id: i64,
        frame_index: i64,
    ) -> Vec<RenderedVariable> {
        let mut out = Vec::with_capacity(children.len());
        let mut pending_key: Option<String> = None;
        for (index, child) in children.iter().enumerate() {
            let name = get_str(child, "name").to_string();
            if index % 2 == 0 {
                let fqn = child_fqn(map_fqn, &name);
                out.push(self.variables.render_entry(&name, child, &fqn, goroutine_id, frame_index));
                pending_key = Some(crate::variables::render_value(child));
            } else {
                let rendered_key = pending_key.take().unwrap_or_default();
                let expr = crate::variables::map_entry_eval_expr(map_fqn, &rendered_key);
                out.push(self.variables.render_entry_with_eval(&name, child, &expr, &expr, goroutine_id, frame_index));
            }
        }
        out
    }

    /// Builds the `Eval` call for an `evaluate` request scoped to a
    /// stack frame.
    pub fn evaluate_call(&self, frame_handle: i64, expr: &str) -> Result<RpcCall, HandleLookupError> {
        let frame = *self.variables.frame_handles.get(frame_handle)?;
        let scope = json!({"GoroutineID": frame.goroutine_id, "Frame": frame.frame_index});
        Ok(self.dialect.eval(scope, expr, self.load_config))
    }

    pub fn render_evaluate_result(
        &mut self,
        response: &Value,
        frame_handle: i64,
        expr: &str,
    ) -> Result<RenderedVariable, HandleLookupError> {
        let frame = *self.variables.frame_handles.get(frame_handle)?;
        let node = self.dialect.unwrap_variable(response).clone();
        Ok(self.variables.render_entry(expr, &node, expr, frame.goroutine_id, frame.frame_index))
    }

    /// Builds the `Set`/`SetSymbol` call for a `setVariable` request,
    /// propagating the fully-qualified name from the parent container
    /// (spec §4.7 "Fully-qualified-name propagation").
    pub fn set_variable_call(
        &self,
        container_handle: i64,
        name: &str,
        value: &str,
    ) -> Result<(RpcCall, String, i64, i64), HandleLookupError> {
        let var_ref = self.variables.variable_handles.get(container_handle)?;
        let scope = json!({"GoroutineID": var_ref.goroutine_id, "Frame": var_ref.frame_index});
        let fqn = child_fqn(&var_ref.fqn, name);
        Ok((
            self.dialect.set_symbol(scope, &fqn, value),
            fqn,
            var_ref.goroutine_id,
            var_ref.frame_index,
        ))
    }

    /// Decides the `setBreakpoints` plan per spec §4.5's
    /// halt-edit-resume protocol.
    pub fn begin_set_breakpoints(&mut self) -> SetBreakpointsPlan {
        if matches!(self.state, RunState::Running) {
            self.skip_stop_event_once = true;
            SetBreakpointsPlan::ViaHalt {
                halt_call: self.dialect.command("halt"),
            }
        } else {
            SetBreakpointsPlan::Direct
        }
    }

    /// Builds the clear/create RPCs needed to reconcile one file's
    /// breakpoint set (spec §4.6). The caller issues these, then calls
    /// [`SessionController::finish_set_breakpoints`] with the results.
    pub fn prepare_breakpoint_calls(
        &self,
        local_file: &str,
        requested: &[RequestedBreakpoint],
    ) -> (Vec<RpcCall>, Vec<RpcCall>) {
        let clear_calls = self.breakpoints.clear_calls(local_file, self.dialect.as_ref());
        let create_calls = requested
            .iter()
            .map(|r| self.breakpoints.create_call(r, self.load_config, self.dialect.as_ref()))
            .collect();
        (clear_calls, create_calls)
    }

    /// Finalizes one file's breakpoint set from create-call outcomes,
    /// recovering "already exists" failures via a `ListBreakpoints`
    /// response supplied by the caller (spec §4.6).
    pub fn finish_set_breakpoints(
        &mut self,
        local_file: &str,
        requested: &[RequestedBreakpoint],
        create_results: Vec<Result<Value, String>>,
        listing_response: Option<&Value>,
    ) -> Vec<VerifiedBreakpoint> {
        let mut records = Vec::with_capacity(requested.len());
        for (req, result) in requested.iter().zip(create_results) {
            let record = match result {
                Ok(response) => {
                    BreakpointManager::record_from_create_response(&response, req, self.dialect.as_ref())
                }
                Err(message) if BreakpointManager::is_already_exists(&message) => match listing_response {
                    Some(listing) => BreakpointManager::adopt_from_listing(listing, req, self.dialect.as_ref()),
                    None => crate::breakpoints::BreakpointRecord {
                        backend_id: -1,
                        remote_file: req.remote_file.clone(),
                        line: req.line,
                        condition: req.condition.clone(),
                        verified: false,
                    },
                },
                Err(_) => crate::breakpoints::BreakpointRecord {
                    backend_id: -1,
                    remote_file: req.remote_file.clone(),
                    line: req.line,
                    condition: req.condition.clone(),
                    verified: false,
                },
            };
            records.push(record);
        }

        let response = BreakpointManager::to_client_response(requested, &records);
        self.breakpoints.replace_file(local_file, records);
        response
    }

    /// Builds the stdout/stderr forwarding event for launched-process
    /// output (spec §4.8).
    pub fn output_event(category: OutputCategory, text: &str) -> Value {
        events::output_event(category, text)
    }

    /// Decides the first disconnect step (spec §4.5 item 1-2).
    pub fn begin_disconnect(&self, is_no_debug: bool) -> DisconnectStep {
        disconnect::first_step(self.locality, is_no_debug)
    }

    /// Classifies the resolved halt outcome during disconnect.
    pub fn classify_halt(&self, outcome: &HaltOutcome) -> AfterHalt {
        disconnect::classify_halt_outcome(outcome)
    }

    /// Builds the `Detach` call for the final disconnect step.
    pub fn detach_call(&self) -> RpcCall {
        disconnect::detach_call(self.locality, self.dialect.as_ref())
    }

    pub fn remove_artifact(&self) {
        disconnect::remove_artifact_best_effort(self.artifact_path.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_version::V2;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn controller_with_mock_transport() -> SessionController {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let req: Value = serde_json::from_slice(&buf[..n]).unwrap();
                                let id = req["id"].as_u64().unwrap();
                                let resp = json!({"id": id, "result": {"State": {"exited": false}}, "error": null});
                                if sock.write_all(serde_json::to_string(&resp).unwrap().as_bytes()).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        let transport = BackendTransport::connect(&addr.to_string()).await.unwrap();
        SessionController::new(
            Box::new(V2),
            transport,
            PathMapper {
                local_root: "/w".into(),
                remote_root: "/r".into(),
                local_sep: crate::path_mapper::Separator::Slash,
                remote_sep: crate::path_mapper::Separator::Slash,
                goroot: None,
                gopath: vec![],
            },
            LoadConfig::default(),
            50,
            false,
            Locality::Local,
        )
    }

    #[tokio::test]
    async fn backend_ready_transitions_to_connected_stopped() {
        let mut ctl = controller_with_mock_transport().await;
        assert_eq!(ctl.state, RunState::NotConnected);
        ctl.on_backend_ready();
        assert_eq!(ctl.state, RunState::ConnectedStopped);
    }

    #[tokio::test]
    async fn property5_stale_completion_is_ignored() {
        let mut ctl = controller_with_mock_transport().await;
        ctl.on_backend_ready();
        let (_call1, epoch1) = ctl.begin_command("continue", StopReason::Breakpoint);
        let (_call2, epoch2) = ctl.begin_command("continue", StopReason::Breakpoint);
        assert_ne!(epoch1, epoch2);

        assert!(matches!(ctl.complete_command(epoch1, 1), CommandCompletion::Stale));
        assert!(matches!(ctl.complete_command(epoch2, 1), CommandCompletion::Stopped(_)));
    }

    #[tokio::test]
    async fn scenario_s2_skip_flag_suppresses_one_stopped_event() {
        let mut ctl = controller_with_mock_transport().await;
        ctl.on_backend_ready();
        let (_call, epoch) = ctl.begin_command("continue", StopReason::Breakpoint);
        assert_eq!(ctl.state, RunState::Running);

        match ctl.begin_set_breakpoints() {
            SetBreakpointsPlan::ViaHalt { .. } => {}
            other => panic!("expected ViaHalt, got {other:?}"),
        }

        assert!(matches!(ctl.complete_command(epoch, 1), CommandCompletion::Suppressed));
        assert_eq!(ctl.state, RunState::ConnectedStopped);

        let (_call, epoch2) = ctl.begin_command("continue", StopReason::Breakpoint);
        assert!(matches!(ctl.complete_command(epoch2, 1), CommandCompletion::Stopped(_)));
    }

    #[tokio::test]
    async fn property6_threads_synthesized_without_rpc_while_in_flight() {
        let mut ctl = controller_with_mock_transport().await;
        ctl.on_backend_ready();
        ctl.begin_command("continue", StopReason::Breakpoint);
        match ctl.threads_decision() {
            ThreadsDecision::Synthetic(threads) => {
                assert_eq!(threads, vec![Thread { id: 1, name: "Dummy".to_string() }]);
            }
            ThreadsDecision::NeedsRpc(_) => panic!("must not issue RPC while in flight"),
        }
    }

    #[tokio::test]
    async fn threads_needs_rpc_when_stopped() {
        let ctl = controller_with_mock_transport().await;
        assert!(matches!(ctl.threads_decision(), ThreadsDecision::NeedsRpc(_)));
    }

    #[test]
    fn parse_threads_falls_back_to_synthetic_dummy_when_empty() {
        let response = json!({"Locations": []});
        let threads = parse_threads(&V2, &response);
        assert_eq!(threads, vec![Thread { id: 1, name: "Dummy".to_string() }]);
    }

    #[test]
    fn configuration_done_stop_on_entry_emits_entry_reason() {
        let ev = events::stopped_event(StopReason::Entry, 1);
        assert_eq!(ev["reason"], json!("entry"));
    }

    #[tokio::test]
    async fn pause_while_stopped_has_nothing_to_interrupt() {
        let mut ctl = controller_with_mock_transport().await;
        ctl.on_backend_ready();
        assert!(ctl.request_pause().is_none());
    }

    #[tokio::test]
    async fn pause_while_running_overrides_stop_reason() {
        let mut ctl = controller_with_mock_transport().await;
        ctl.on_backend_ready();
        let (_call, epoch) = ctl.begin_command("continue", StopReason::Breakpoint);
        assert!(ctl.request_pause().is_some());
        match ctl.complete_command(epoch, 1) {
            CommandCompletion::Stopped(ev) => assert_eq!(ev["reason"], json!("pause")),
            other => panic!("expected Stopped, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn map_children_render_as_key_value_pairs_with_indexed_eval_expr() {
        let mut ctl = controller_with_mock_transport().await;
        let var_ref = VariableRef {
            node: json!({
                "kind": "Map",
                "children": [
                    {"name": "[key 0]", "kind": "String", "value": "a", "len": 1},
                    {"name": "0", "kind": "Int", "value": "1"},
                ],
            }),
            fqn: "m".to_string(),
            eval_expr: "m".to_string(),
            goroutine_id: 1,
            frame_index: 0,
        };

        let rendered = ctl.render_variable_children(&var_ref);
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[0].name, "[key 0]");
        assert_eq!(rendered[1].name, "0");
        assert_eq!(rendered[1].variables_reference, 0, "scalar map value isn't expandable");

        assert_eq!(crate::variables::map_entry_eval_expr("m", "\"a\""), "m[\"a\"]");
    }

    #[tokio::test]
    async fn boxed_slice_element_reevaluates_by_address_not_name() {
        let mut ctl = controller_with_mock_transport().await;
        let child = json!({
            "name": "[0]",
            "kind": "Struct",
            "type": "main.Foo",
            "onlyAddr": true,
            "address": 4096,
            "children": [{"name": "f"}],
        });
        let var_ref = VariableRef {
            node: json!({"kind": "Slice", "children": [child]}),
            fqn: "s".to_string(),
            eval_expr: "s".to_string(),
            goroutine_id: 1,
            frame_index: 0,
        };

        let rendered = ctl.render_variable_children(&var_ref);
        let element_handle = rendered[0].variables_reference;
        assert_ne!(element_handle, 0);
        let element_ref = ctl.variables.variable_handles.get(element_handle).unwrap();
        assert_eq!(element_ref.eval_expr, "*(*\"main.Foo\")(0x1000)");
        assert_eq!(element_ref.fqn, "s.[0]");
    }
}
