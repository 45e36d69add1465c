//! Produces DAP event bodies from backend state transitions (spec
//! §4.8). Pure functions only — no I/O, no handle-table mutation (that
//! happens in `variables::VariableRenderer::reset_on_stop`, which the
//! caller must invoke before using [`stopped_event`]'s output).

use serde_json::{Value, json};

/// Why the backend stopped, mapped onto DAP's `reason` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint,
    Step,
    Pause,
    Entry,
}

impl StopReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Breakpoint => "breakpoint",
            Self::Step => "step",
            Self::Pause => "pause",
            Self::Entry => "entry",
        }
    }
}

/// Builds a `Stopped` event body. `allThreadsStopped` is always `true`
/// because the backend stops the world (spec §4.8). Callers must reset
/// both handle tables before sending this event, never after.
pub fn stopped_event(reason: StopReason, goroutine_id: i64) -> Value {
    json!({
        "reason": reason.as_str(),
        "threadId": goroutine_id,
        "allThreadsStopped": true,
    })
}

/// Builds a `Terminated` event body (no restart support).
pub fn terminated_event() -> Value {
    json!({})
}

/// Whether the observed backend `State` response signals termination
/// (spec §4.8: "when the observed state has exited=true").
pub fn state_signals_exited(state: &Value) -> bool {
    state.get("exited").and_then(Value::as_bool).unwrap_or(false)
}

/// Whether a non-zero exit code from the spawned backend process
/// itself should be treated as termination (spec §4.8).
pub fn exit_code_signals_exited(code: Option<i32>) -> bool {
    matches!(code, Some(c) if c != 0)
}

/// The halt-error heuristic from spec §4.5/§9 Open Question 1: prefer a
/// typed "already exited" signal if the backend response carries one,
/// falling back to the fragile substring match on the error text.
/// Resolution recorded in the grounding ledger: the typed check is a
/// `targetExited` boolean field some newer backend versions set
/// alongside the string message; absent that field, fall back.
pub fn halt_error_signals_target_exited(error_body: &Value) -> bool {
    if let Some(typed) = error_body.get("targetExited").and_then(Value::as_bool) {
        return typed;
    }
    error_body
        .get("error")
        .and_then(Value::as_str)
        .map(|msg| msg.ends_with("has exited with status 0"))
        .unwrap_or(false)
}

/// Output category for an `Output` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCategory {
    Stdout,
    Stderr,
}

impl OutputCategory {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Builds an `Output` event body forwarding backend output verbatim, no
/// parsing (spec §4.8).
pub fn output_event(category: OutputCategory, text: &str) -> Value {
    json!({
        "category": category.as_str(),
        "output": text,
    })
}

/// Builds the `Initialized` event body (always empty).
pub fn initialized_event() -> Value {
    json!({})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_event_always_reports_all_threads_stopped() {
        let ev = stopped_event(StopReason::Breakpoint, 1);
        assert_eq!(ev["allThreadsStopped"], json!(true));
        assert_eq!(ev["reason"], json!("breakpoint"));
        assert_eq!(ev["threadId"], json!(1));
    }

    #[test]
    fn state_signals_exited_reads_flag() {
        assert!(state_signals_exited(&json!({"exited": true})));
        assert!(!state_signals_exited(&json!({"exited": false})));
        assert!(!state_signals_exited(&json!({})));
    }

    #[test]
    fn exit_code_zero_is_not_termination_signal() {
        assert!(!exit_code_signals_exited(Some(0)));
        assert!(exit_code_signals_exited(Some(1)));
        assert!(!exit_code_signals_exited(None));
    }

    #[test]
    fn halt_error_prefers_typed_signal() {
        let body = json!({"targetExited": true, "error": "something else entirely"});
        assert!(halt_error_signals_target_exited(&body));
    }

    #[test]
    fn halt_error_falls_back_to_substring_match() {
        let body = json!({"error": "Process 4242 has exited with status 0"});
        assert!(halt_error_signals_target_exited(&body));

        let unrelated = json!({"error": "connection refused"});
        assert!(!halt_error_signals_target_exited(&unrelated));
    }

    #[test]
    fn output_event_forwards_category_and_text_verbatim() {
        let ev = output_event(OutputCategory::Stderr, "panic: boom\n");
        assert_eq!(ev["category"], json!("stderr"));
        assert_eq!(ev["output"], json!("panic: boom\n"));
    }
}
