//! Maintains the authoritative per-source breakpoint set and reconciles
//! it against the backend (spec §4.6).
//!
//! `setBreakpoints` is a full-replace operation per file: the manager
//! never diffs old against new, it clears everything the backend has
//! for that file and recreates from scratch, mirroring the "previous
//! set is exactly replaced" invariant from spec §3.

use serde_json::Value;

use crate::api_version::{ApiDialect, LoadConfig, RpcCall};

/// A single requested breakpoint, already path-mapped to the remote
/// file.
#[derive(Debug, Clone)]
pub struct RequestedBreakpoint {
    pub remote_file: String,
    pub line: i64,
    pub condition: Option<String>,
}

/// What the backend told us about one breakpoint once reconciliation
/// finished.
#[derive(Debug, Clone)]
pub struct BreakpointRecord {
    pub backend_id: i64,
    pub remote_file: String,
    pub line: i64,
    pub condition: Option<String>,
    pub verified: bool,
}

/// What the client sees back for a `setBreakpoints` response: order
/// matches the request.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedBreakpoint {
    pub verified: bool,
    pub line: i64,
}

fn get_i64(v: &Value, key: &str) -> i64 {
    v.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn get_str<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Owns the per-file breakpoint table. One instance per session.
#[derive(Debug, Default)]
pub struct BreakpointManager {
    by_file: std::collections::HashMap<String, Vec<BreakpointRecord>>,
}

/// Heuristic match for the backend's "breakpoint already exists at this
/// location" error text; the exact wording isn't contractual, only that
/// it's distinguishable from every other creation failure.
fn is_already_exists_error(message: &str) -> bool {
    message.to_ascii_lowercase().contains("already exist")
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records_for(&self, local_file: &str) -> &[BreakpointRecord] {
        self.by_file
            .get(local_file)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Builds the `ClearBreakpoint` calls needed to drop the file's
    /// current set before recreating it (spec §4.6 step 1).
    pub fn clear_calls(&self, local_file: &str, dialect: &dyn ApiDialect) -> Vec<RpcCall> {
        self.records_for(local_file)
            .iter()
            .map(|r| dialect.clear_breakpoint(r.backend_id))
            .collect()
    }

    /// Builds the `CreateBreakpoint` call for one requested breakpoint.
    pub fn create_call(
        &self,
        bp: &RequestedBreakpoint,
        cfg: LoadConfig,
        dialect: &dyn ApiDialect,
    ) -> RpcCall {
        let mut payload = serde_json::json!({
            "file": bp.remote_file,
            "line": bp.line,
        });
        if let Some(cond) = &bp.condition {
            payload["cond"] = Value::String(cond.clone());
        }
        payload["loadArgs"] = serde_json::json!({
            "followPointers": cfg.follow_pointers,
            "maxVariableRecurse": cfg.max_variable_recurse,
            "maxStringLen": cfg.max_string_len,
            "maxArrayValues": cfg.max_array_values,
            "maxStructFields": cfg.max_struct_fields,
        });
        payload["loadLocals"] = payload["loadArgs"].clone();
        dialect.create_breakpoint(payload)
    }

    /// Given the creation response (or error) for each requested
    /// breakpoint, finalizes the file's record set. `already_exists`
    /// entries must have already been resolved against a
    /// `ListBreakpoints` response by the caller via
    /// [`adopt_from_listing`] before this is called.
    pub fn replace_file(&mut self, local_file: &str, records: Vec<BreakpointRecord>) {
        self.by_file.insert(local_file.to_string(), records);
    }

    /// Parses one `CreateBreakpoint` success response into a verified
    /// record.
    pub fn record_from_create_response(
        response: &Value,
        requested: &RequestedBreakpoint,
        dialect: &dyn ApiDialect,
    ) -> BreakpointRecord {
        let bp = dialect.unwrap_breakpoint(response);
        BreakpointRecord {
            backend_id: get_i64(bp, "id"),
            remote_file: requested.remote_file.clone(),
            line: get_i64(bp, "line"),
            condition: requested.condition.clone(),
            verified: true,
        }
    }

    /// Recovers an "already exists" creation failure by finding the
    /// matching record in a `ListBreakpoints` response (spec §4.6). If
    /// no match is found the breakpoint is recorded unverified at the
    /// requested line.
    pub fn adopt_from_listing(
        listing_response: &Value,
        requested: &RequestedBreakpoint,
        dialect: &dyn ApiDialect,
    ) -> BreakpointRecord {
        let list = dialect.unwrap_breakpoints(listing_response);
        let found = list.as_array().and_then(|items| {
            items.iter().find(|bp| {
                get_str(bp, "file") == requested.remote_file && get_i64(bp, "line") == requested.line
            })
        });

        match found {
            Some(bp) => BreakpointRecord {
                backend_id: get_i64(bp, "id"),
                remote_file: requested.remote_file.clone(),
                line: get_i64(bp, "line"),
                condition: requested.condition.clone(),
                verified: true,
            },
            None => BreakpointRecord {
                backend_id: -1,
                remote_file: requested.remote_file.clone(),
                line: requested.line,
                condition: requested.condition.clone(),
                verified: false,
            },
        }
    }

    pub fn is_already_exists(message: &str) -> bool {
        is_already_exists_error(message)
    }

    /// Builds the client-visible `{verified, line}` list, preserving
    /// request order (spec §4.6 "Result to the client").
    pub fn to_client_response(
        requested: &[RequestedBreakpoint],
        records: &[BreakpointRecord],
    ) -> Vec<VerifiedBreakpoint> {
        requested
            .iter()
            .zip(records)
            .map(|(req, rec)| VerifiedBreakpoint {
                verified: rec.verified,
                line: if rec.verified { rec.line } else { req.line },
            })
            .collect()
    }
}
