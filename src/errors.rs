//! Error types shared across the bridge, plus the stable DAP error codes
//! from which `ErrorResponse` bodies are built (spec §7).

use std::fmt::Display;

/// Stable error codes surfaced to the client on the originating DAP
/// request. These are the adapter's own vocabulary, independent of any
/// JSON-RPC error code the backend itself uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Version = 2001,
    Threads = 2003,
    StackTrace = 2004,
    ScopesLocals = 2005,
    Args = 2006,
    Globals = 2007,
    SetBreakpointsHalt = 2008,
    Evaluate = 2009,
    PauseSetVariable = 2010,
    LaunchAttach = 3000,
}

impl ErrorCode {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Top-level error the session controller uses to build an
/// `ErrorResponse` body. Carries the stable code plus a human-readable
/// message (often the backend's stringified error, verbatim).
#[derive(Debug)]
pub struct AdapterError {
    pub code: ErrorCode,
    pub message: String,
}

impl AdapterError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_i64(), self.message)
    }
}

impl std::error::Error for AdapterError {}

/// A reference to an opaque handle (variable or stack-frame) that no
/// longer belongs to the arena's current generation — the handle was
/// issued before the last stop event.
#[derive(Debug)]
pub struct StaleHandle(pub i64);

impl Display for StaleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle {} is stale (from a previous stop)", self.0)
    }
}

impl std::error::Error for StaleHandle {}

/// A handle that was never issued by the arena at all.
#[derive(Debug)]
pub struct InvalidHandle(pub i64);

impl Display for InvalidHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle {} does not exist", self.0)
    }
}

impl std::error::Error for InvalidHandle {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_values_match_spec() {
        assert_eq!(ErrorCode::Version.as_i64(), 2001);
        assert_eq!(ErrorCode::Threads.as_i64(), 2003);
        assert_eq!(ErrorCode::StackTrace.as_i64(), 2004);
        assert_eq!(ErrorCode::ScopesLocals.as_i64(), 2005);
        assert_eq!(ErrorCode::Args.as_i64(), 2006);
        assert_eq!(ErrorCode::Globals.as_i64(), 2007);
        assert_eq!(ErrorCode::SetBreakpointsHalt.as_i64(), 2008);
        assert_eq!(ErrorCode::Evaluate.as_i64(), 2009);
        assert_eq!(ErrorCode::PauseSetVariable.as_i64(), 2010);
        assert_eq!(ErrorCode::LaunchAttach.as_i64(), 3000);
    }

    #[test]
    fn adapter_error_displays_code_and_message() {
        let e = AdapterError::new(ErrorCode::Evaluate, "no such variable");
        assert_eq!(e.to_string(), "[2009] no such variable");
    }
}
