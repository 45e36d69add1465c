//! Tri-modal shutdown: remote detach, local halt+detach, or forced kill
//! with artifact cleanup (spec §4.5 item "Disconnect", §4.9).
//!
//! Grounded on the teacher's daemon teardown sequencing (`Drop`-driven
//! process-tree kill plus best-effort temp-file cleanup in
//! `backend_manager.rs`), generalized from "kill unconditionally" to
//! the graceful-then-forced staged protocol this spec requires.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::api_version::ApiDialect;
use crate::events::halt_error_signals_target_exited;

/// The 1s hard timeout on the graceful halt step (spec §4.5 item 2,
/// Testable Property 8).
pub const HALT_WATCHDOG: Duration = Duration::from_millis(1000);

/// What the controller must do next, decided without any I/O so the
/// actual async work (issuing RPCs, killing a process tree, unlinking a
/// file) stays in the caller where it can be awaited/driven by a test
/// double.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectStep {
    /// Remote session: nothing to do but close the socket.
    CloseSocketOnly,
    /// Local, no-debug session: nothing was ever attached.
    ResolveImmediately,
    /// Issue `Command{halt}` under the watchdog.
    IssueHalt,
}

/// Whether the session is local (owns the backend process) as opposed
/// to a remote attach (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    Local,
    Remote,
}

/// Decides the first disconnect step for a session (spec §4.5 item 1-2).
pub fn first_step(locality: Locality, is_no_debug: bool) -> DisconnectStep {
    match locality {
        Locality::Remote => DisconnectStep::CloseSocketOnly,
        Locality::Local if is_no_debug => DisconnectStep::ResolveImmediately,
        Locality::Local => DisconnectStep::IssueHalt,
    }
}

/// What to do after the halt step resolves (succeeds, errors, or times
/// out) — spec §4.5 items 2-4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AfterHalt {
    /// Halt timed out: kill the process tree and unlink the artifact,
    /// then resolve disconnect without attempting detach.
    ForceCleanup,
    /// Halt's error text indicates the target already exited; skip
    /// detach entirely.
    SkipDetach,
    /// Halt succeeded (or failed for an unrelated reason): issue
    /// `Detach{Kill: isLocal}`.
    IssueDetach,
}

/// Outcome of the watchdog-wrapped halt call.
#[derive(Debug)]
pub enum HaltOutcome {
    TimedOut,
    Completed(Result<Value, Value>),
}

/// Classifies a resolved halt outcome per spec §4.5 items 2-3.
pub fn classify_halt_outcome(outcome: &HaltOutcome) -> AfterHalt {
    match outcome {
        HaltOutcome::TimedOut => AfterHalt::ForceCleanup,
        HaltOutcome::Completed(Err(error_body)) if halt_error_signals_target_exited(error_body) => {
            AfterHalt::SkipDetach
        }
        HaltOutcome::Completed(_) => AfterHalt::IssueDetach,
    }
}

/// Whether a detach failure in a local session must trigger forced
/// cleanup (spec §4.5 item 4: "On detach error in a local session,
/// force-cleanup").
pub fn detach_error_requires_force_cleanup(locality: Locality, detach_result: &Result<Value, Value>) -> bool {
    matches!(locality, Locality::Local) && detach_result.is_err()
}

/// Builds the `Detach` RPC call for the disconnect's final step.
pub fn detach_call(locality: Locality, dialect: &dyn ApiDialect) -> crate::api_version::RpcCall {
    let kill = matches!(locality, Locality::Local);
    dialect.detach(kill)
}

/// Best-effort removal of a build artifact. Never surfaces an error to
/// the caller — disconnect must not block or fail because of it (spec
/// §4.9).
pub fn remove_artifact_best_effort(path: Option<&PathBuf>) {
    let Some(path) = path else { return };
    if let Err(err) = std::fs::remove_file(path) {
        log::warn!("disconnect: failed to remove artifact {}: {err}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_session_only_closes_socket() {
        assert_eq!(first_step(Locality::Remote, false), DisconnectStep::CloseSocketOnly);
    }

    #[test]
    fn local_no_debug_resolves_immediately() {
        assert_eq!(
            first_step(Locality::Local, true),
            DisconnectStep::ResolveImmediately
        );
    }

    #[test]
    fn local_debug_session_issues_halt() {
        assert_eq!(first_step(Locality::Local, false), DisconnectStep::IssueHalt);
    }

    #[test]
    fn scenario_s6_timed_out_halt_forces_cleanup() {
        let outcome = HaltOutcome::TimedOut;
        assert_eq!(classify_halt_outcome(&outcome), AfterHalt::ForceCleanup);
    }

    #[test]
    fn halt_error_matching_exit_text_skips_detach() {
        let outcome = HaltOutcome::Completed(Err(json!({"error": "Process has exited with status 0"})));
        assert_eq!(classify_halt_outcome(&outcome), AfterHalt::SkipDetach);
    }

    #[test]
    fn halt_success_issues_detach() {
        let outcome = HaltOutcome::Completed(Ok(json!({"State": {}})));
        assert_eq!(classify_halt_outcome(&outcome), AfterHalt::IssueDetach);
    }

    #[test]
    fn unrelated_halt_error_still_issues_detach() {
        let outcome = HaltOutcome::Completed(Err(json!({"error": "connection reset"})));
        assert_eq!(classify_halt_outcome(&outcome), AfterHalt::IssueDetach);
    }

    #[test]
    fn detach_error_in_local_session_forces_cleanup() {
        let err: Result<Value, Value> = Err(json!("boom"));
        assert!(detach_error_requires_force_cleanup(Locality::Local, &err));
    }

    #[test]
    fn detach_error_in_remote_session_does_not_force_cleanup() {
        let err: Result<Value, Value> = Err(json!("boom"));
        assert!(!detach_error_requires_force_cleanup(Locality::Remote, &err));
    }

    #[test]
    fn v1_detach_call_passes_bare_bool() {
        let call = detach_call(Locality::Local, &crate::api_version::V1);
        assert_eq!(call.args, json!(true));
    }
}
