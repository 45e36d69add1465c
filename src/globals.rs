//! Package-scoped global variable lookup for the optional "Globals"
//! scope (spec §4.7 "Globals").
//!
//! The package name for a source directory is discovered once via an
//! external `go list -f '{{.Name}} {{.ImportPath}}'` invocation and
//! cached for the rest of the session (spec §5: "the package-info
//! cache is append-only for the lifetime of the session"). A failed
//! lookup — most commonly because the package directory has since been
//! deleted — is cached as `None` and never surfaced as an error; the
//! Globals scope is simply omitted (spec §9 Open Question 3).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;

/// Per-directory cache of `go list`'s reported package name.
#[derive(Debug, Default)]
pub struct PackageNameCache {
    by_dir: HashMap<PathBuf, Option<String>>,
}

impl PackageNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A previously cached result for `dir`, if any lookup has happened
    /// yet. `Some(None)` means "looked up, no package found".
    pub fn get_cached(&self, dir: &Path) -> Option<Option<String>> {
        self.by_dir.get(dir).cloned()
    }

    pub fn store(&mut self, dir: PathBuf, name: Option<String>) {
        self.by_dir.insert(dir, name);
    }
}

/// Runs `go list` in `dir` and parses its package name out of the
/// `{{.Name}} {{.ImportPath}}` format string. Blocking; callers run this
/// via `tokio::task::spawn_blocking` to keep it off the event loop
/// (spec §5 lists "`go list` invocations for package naming" as a
/// suspension point).
pub fn run_go_list(dir: &Path) -> Option<String> {
    let output = Command::new("go")
        .arg("list")
        .arg("-f")
        .arg("{{.Name}} {{.ImportPath}}")
        .current_dir(dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    text.split_whitespace().next().map(str::to_string)
}

/// The `ListPackageVars` filter for `pkg` (spec §4.7: `^<pkg>\.`).
pub fn package_filter(pkg: &str) -> String {
    format!("^{pkg}\\.")
}

/// Strips the `<pkg>.` prefix from each global's name and drops the
/// compiler-generated `initdone·` entry if present (spec §4.7
/// "Globals").
pub fn strip_package_prefix(pkg: &str, vars: &[Value]) -> Vec<Value> {
    let prefix = format!("{pkg}.");
    vars.iter()
        .cloned()
        .map(|mut v| {
            if let Some(stripped) = v.get("name").and_then(Value::as_str).and_then(|n| n.strip_prefix(&prefix).map(str::to_string)) {
                v["name"] = Value::String(stripped);
            }
            v
        })
        .filter(|v| v.get("name").and_then(Value::as_str) != Some("initdone\u{b7}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cache_starts_empty() {
        let cache = PackageNameCache::new();
        assert_eq!(cache.get_cached(Path::new("/w")), None);
    }

    #[test]
    fn cache_remembers_stored_result() {
        let mut cache = PackageNameCache::new();
        cache.store(PathBuf::from("/w"), Some("main".to_string()));
        assert_eq!(cache.get_cached(Path::new("/w")), Some(Some("main".to_string())));
    }

    #[test]
    fn package_filter_anchors_and_escapes_dot() {
        assert_eq!(package_filter("main"), "^main\\.");
    }

    #[test]
    fn strip_prefix_and_drop_initdone() {
        let vars = vec![
            json!({"name": "main.Counter", "value": "0"}),
            json!({"name": "main.initdone\u{b7}", "value": "2"}),
            json!({"name": "main.Other", "value": "x"}),
        ];
        let stripped = strip_package_prefix("main", &vars);
        assert_eq!(stripped.len(), 2);
        assert_eq!(stripped[0]["name"], json!("Counter"));
        assert_eq!(stripped[1]["name"], json!("Other"));
    }
}
