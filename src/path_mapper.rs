//! Bidirectional translator between local workspace paths and the
//! remote debugger's path space (spec §4.3).
//!
//! Pure and state-light by design: no I/O, so the round-trip and
//! fallback-rule invariants (Testable Property 3, scenario S3) can be
//! exercised exhaustively with plain unit tests.

/// Which path separator a side of the mapping uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    Slash,
    Backslash,
}

impl Separator {
    fn as_char(self) -> char {
        match self {
            Self::Slash => '/',
            Self::Backslash => '\\',
        }
    }
}

/// Configuration for one session's path translation.
#[derive(Debug, Clone)]
pub struct PathMapper {
    /// Root of the local workspace (program root), with no trailing separator.
    pub local_root: String,
    /// Root on the remote/debugger side, with no trailing separator. Empty
    /// string means "no remote root configured" (identity mapping).
    pub remote_root: String,
    pub local_sep: Separator,
    pub remote_sep: Separator,
    /// `$GOROOT` on the machine running the backend, if known.
    pub goroot: Option<String>,
    /// `$GOPATH` elements on the local machine, in order, if known.
    pub gopath: Vec<String>,
}

fn trim_trailing_sep(path: &str, sep: char) -> String {
    path.trim_end_matches(sep).to_string()
}

fn rewrite_separators(path: &str, from: char, to: char) -> String {
    if from == to {
        path.to_string()
    } else {
        path.replace(from, &to.to_string())
    }
}

/// Normalizes a Windows-style path: tolerate forward slashes in the
/// input but canonicalize on whichever separator is actually present,
/// and normalize drive-letter casing to uppercase.
pub fn normalize_windows_path(path: &str) -> String {
    let sep = if path.contains('\\') { '\\' } else { '/' };
    let rewritten = if sep == '\\' {
        path.replace('/', "\\")
    } else {
        path.to_string()
    };

    // Canonicalize a leading drive letter's case: "c:\foo" -> "C:\foo".
    let mut chars = rewritten.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => {
            let rest = &rewritten[2..];
            format!("{}:{}", drive.to_ascii_uppercase(), rest)
        }
        _ => rewritten,
    }
}

impl PathMapper {
    /// Translates a local workspace path into the remote debugger's path
    /// space. Identity when no remote root is configured.
    pub fn to_remote(&self, local_path: &str) -> String {
        if self.remote_root.is_empty() {
            return local_path.to_string();
        }

        let rewritten = rewrite_separators(
            local_path,
            self.local_sep.as_char(),
            self.remote_sep.as_char(),
        );

        let local_root = trim_trailing_sep(&self.local_root, self.local_sep.as_char());
        let local_root_remote_sep =
            rewrite_separators(&local_root, self.local_sep.as_char(), self.remote_sep.as_char());

        if let Some(suffix) = rewritten.strip_prefix(&local_root_remote_sep) {
            format!(
                "{}{}",
                trim_trailing_sep(&self.remote_root, self.remote_sep.as_char()),
                suffix
            )
        } else {
            rewritten
        }
    }

    /// Translates a remote debugger path back into a local workspace
    /// path, applying the GOROOT/GOPATH fallback rules when the path
    /// does not fall under the configured remote root (spec §4.3).
    pub fn to_local(&self, remote_path: &str) -> String {
        let remote_root = trim_trailing_sep(&self.remote_root, self.remote_sep.as_char());
        let rsep = self.remote_sep.as_char();
        let lsep = self.local_sep.as_char();

        if !remote_root.is_empty() && remote_path.starts_with(&remote_root) {
            let suffix = &remote_path[remote_root.len()..];
            let suffix_local_sep = rewrite_separators(suffix, rsep, lsep);
            let local_root = trim_trailing_sep(&self.local_root, lsep);
            return format!("{local_root}{suffix_local_sep}");
        }

        // Fallback rule 1: stdlib root.
        let src_marker = format!("{rsep}src{rsep}");
        if let (Some(idx), Some(goroot)) = (remote_path.find(&src_marker), self.goroot.as_ref()) {
            let suffix = &remote_path[idx + src_marker.len() - 1..]; // keep leading sep
            let suffix_local_sep = rewrite_separators(suffix, rsep, lsep);
            let goroot = trim_trailing_sep(goroot, lsep);
            return format!("{goroot}{suffix_local_sep}");
        }

        // Fallback rule 2: module cache root.
        let mod_marker = format!("{rsep}pkg{rsep}mod{rsep}");
        if let (Some(idx), Some(first_gopath)) =
            (remote_path.find(&mod_marker), self.gopath.first())
        {
            let suffix = &remote_path[idx..];
            let suffix_local_sep = rewrite_separators(suffix, rsep, lsep);
            let root = trim_trailing_sep(first_gopath, lsep);
            return format!("{root}{suffix_local_sep}");
        }

        // Fallback rule 3: pass through unchanged.
        remote_path.to_string()
    }
}
