//! Locates the backend binary, constructs argv for the chosen mode,
//! spawns it, captures stdout/stderr, and waits for the readiness
//! signal (spec §4.2).
//!
//! Grounded on the teacher's `start_replay_raw` (argv construction via
//! `Command::new`/`.args`, spawn, then wait on a signal before the
//! caller may proceed) generalized from "first byte on the child's
//! piped socket" to "first byte on the child's piped stdout".

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;

/// The tagged union driving argv construction and teardown (Design
/// Note §9 "Mode-dispatch → tagged union").
#[derive(Debug, Clone)]
pub enum LaunchMode {
    Debug,
    Test,
    Exec,
    AttachLocal { pid: u32 },
    AttachRemote,
    NoDebugRun,
}

/// Inputs to the launcher (spec §4.2).
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub mode: LaunchMode,
    /// Path to `program` as given by the client — a `.go` file or a
    /// package directory, required for all modes but attach-remote.
    pub program: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub build_flags: Vec<String>,
    pub program_args: Vec<String>,
    pub backend_path: PathBuf,
    pub log: bool,
    pub log_output: Option<String>,
    pub init: Option<String>,
    pub backend_name: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub api_version: u8,
    /// When set, overrides the `.` package argument for a directory
    /// `program` with this already-inferred GOPATH-relative import path
    /// (spec §4.2: "rewrite the program argument to the package path
    /// relative to the GOPATH workspace").
    pub gopath_package: Option<String>,
    /// The launch-arg `output` path for the built binary (spec §4.2
    /// `--output`), relative to the backend's working directory.
    /// Defaults to `__debug_bin` (dlv's own default) when unset.
    pub output: Option<String>,
}

/// The build-output path `dlv` will use for a `debug`/`test` launch:
/// the `output` launch arg if given, else dlv's own `__debug_bin`
/// default (spec §4.2 `--output`, spec §3 "Artifacts").
pub fn artifact_basename(output: &Option<String>) -> &str {
    output.as_deref().unwrap_or("__debug_bin")
}

/// Configuration errors rejected before anything is spawned (spec §7
/// item 1).
#[derive(Debug)]
pub enum LaunchError {
    MissingProgram,
    MissingProcessId,
    NotARegularFile(PathBuf),
    NotAGoFile(PathBuf),
    BackendNotFound(PathBuf),
    EnvFile(String),
    Io(std::io::Error),
    Timeout,
}

impl Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingProgram => write!(f, "the 'program' attribute is missing in the debug configuration"),
            Self::MissingProcessId => write!(f, "the 'processId' attribute is missing for a local attach"),
            Self::NotARegularFile(p) => write!(f, "{} is not a regular file", p.display()),
            Self::NotAGoFile(p) => write!(f, "{} is not a Go source file", p.display()),
            Self::BackendNotFound(p) => write!(f, "cannot find backend binary at {}", p.display()),
            Self::EnvFile(msg) => write!(f, "cannot parse env file: {msg}"),
            Self::Io(e) => write!(f, "{e}"),
            Self::Timeout => write!(f, "timed out waiting for the backend to become ready"),
        }
    }
}

impl std::error::Error for LaunchError {}

impl From<std::io::Error> for LaunchError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// A port chosen uniformly at random in `[2000, 50000)`, the default
/// when the launch request does not pin one (spec §4.2).
pub fn random_port() -> u16 {
    rand::thread_rng().gen_range(2000..50000)
}

/// Parses a `KEY=VALUE` env file. Blank lines and `#`-comments are
/// ignored, mirroring the simple format the teacher's own config file
/// parser uses.
pub fn parse_env_file(contents: &str) -> Result<HashMap<String, String>, LaunchError> {
    let mut map = HashMap::new();
    for (lineno, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match trimmed.split_once('=') {
            Some((k, v)) => {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
            None => {
                return Err(LaunchError::EnvFile(format!(
                    "line {}: expected KEY=VALUE, got {trimmed:?}",
                    lineno + 1
                )));
            }
        }
    }
    Ok(map)
}

/// Merges environment sources in priority order: process env, then
/// each env-file's contents in order, then per-launch overrides — last
/// wins (spec §4.2).
pub fn merge_env(
    process_env: &HashMap<String, String>,
    env_files: &[HashMap<String, String>],
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = process_env.clone();
    for file in env_files {
        merged.extend(file.clone());
    }
    merged.extend(overrides.clone());
    merged
}

/// Validates the launch request and builds the backend's argv,
/// without spawning anything (spec §4.2 validation rules).
pub fn build_argv(req: &LaunchRequest) -> Result<(Vec<String>, PathBuf), LaunchError> {
    let host = req.host.clone();
    let port = req.port.unwrap_or_else(random_port);
    let listen = format!("{host}:{port}");

    let mut argv = Vec::new();
    let cwd;

    match &req.mode {
        LaunchMode::Debug | LaunchMode::Test => {
            let program = req.program.as_ref().ok_or(LaunchError::MissingProgram)?;
            let subcommand = if matches!(req.mode, LaunchMode::Debug) {
                "debug"
            } else {
                "test"
            };

            if program.is_dir() {
                cwd = program.clone();
                argv.push(subcommand.to_string());
                match &req.gopath_package {
                    Some(pkg) => argv.push(pkg.clone()),
                    None => argv.push(".".to_string()),
                }
            } else {
                if program.extension().and_then(|e| e.to_str()) != Some("go") {
                    return Err(LaunchError::NotAGoFile(program.clone()));
                }
                cwd = program
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                argv.push(subcommand.to_string());
                argv.push(program.display().to_string());
            }

            argv.push("--headless=true".to_string());
            argv.push(format!("--listen={listen}"));
            argv.push(format!("--api-version={}", req.api_version));

            argv.push(format!("--output={}", artifact_basename(&req.output)));

            if !req.build_flags.is_empty() {
                argv.push(format!("--build-flags={}", req.build_flags.join(" ")));
            }
            if !req.program_args.is_empty() {
                argv.push("--".to_string());
                argv.extend(req.program_args.iter().cloned());
            }
        }
        LaunchMode::Exec => {
            let program = req.program.as_ref().ok_or(LaunchError::MissingProgram)?;
            if !program.is_file() {
                return Err(LaunchError::NotARegularFile(program.clone()));
            }
            cwd = req.cwd.clone().unwrap_or_else(|| PathBuf::from("."));
            argv.push("exec".to_string());
            argv.push(program.display().to_string());
            argv.push("--headless=true".to_string());
            argv.push(format!("--listen={listen}"));
            argv.push(format!("--api-version={}", req.api_version));
            if !req.program_args.is_empty() {
                argv.push("--".to_string());
                argv.extend(req.program_args.iter().cloned());
            }
        }
        LaunchMode::AttachLocal { pid } => {
            cwd = req.cwd.clone().unwrap_or_else(|| PathBuf::from("."));
            argv.push("attach".to_string());
            argv.push(pid.to_string());
            argv.push("--headless=true".to_string());
            argv.push(format!("--listen={listen}"));
            argv.push(format!("--api-version={}", req.api_version));
        }
        LaunchMode::AttachRemote => {
            // No process is spawned for a remote attach; argv is unused.
            cwd = req.cwd.clone().unwrap_or_else(|| PathBuf::from("."));
        }
        LaunchMode::NoDebugRun => {
            let program = req.program.as_ref().ok_or(LaunchError::MissingProgram)?;
            cwd = program
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            argv.push("run".to_string());
            argv.push(program.display().to_string());
            if !req.program_args.is_empty() {
                argv.extend(req.program_args.iter().cloned());
            }
        }
    }

    // `go run` (no-debug-run) has no backend of its own to configure —
    // these flags only make sense for a spawned `dlv`.
    if !matches!(req.mode, LaunchMode::NoDebugRun) {
        for flag in [&req.init] {
            if let Some(v) = flag {
                argv.push(format!("--init={v}"));
            }
        }
        if let Some(backend) = &req.backend_name {
            argv.push(format!("--backend={backend}"));
        }
        if req.log {
            argv.push("--log".to_string());
        }
        if let Some(out) = &req.log_output {
            argv.push(format!("--log-output={out}"));
        }
    }

    Ok((argv, cwd))
}

/// Rewrites the program argument to a package path relative to an
/// inferred GOPATH workspace, per spec §4.2's validation rule for
/// `launch` under an inferred GOPATH with no explicit module mapping.
pub fn infer_gopath_package(program_dir: &Path, gopath: &Path) -> Option<String> {
    let src_root = gopath.join("src");
    program_dir
        .strip_prefix(&src_root)
        .ok()
        .map(|rel| rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"))
}

/// A spawned backend process plus the handle needed to tear it down.
pub struct SpawnedBackend {
    pub child: Child,
    pub listen_addr: String,
}

/// Spawns the backend per `req`, streams its stdout/stderr as raw
/// lines through `output_tx` (consumed by the Event Projector to build
/// OutputEvents), and resolves once the readiness signal is observed:
/// the first byte seen on stdout for spawned backends (spec §4.2).
pub async fn spawn(
    req: &LaunchRequest,
    argv: Vec<String>,
    cwd: PathBuf,
    env: &HashMap<String, String>,
    output_tx: UnboundedSender<(bool, String)>,
    readiness_timeout: Duration,
) -> Result<SpawnedBackend, LaunchError> {
    if !req.backend_path.exists() {
        return Err(LaunchError::BackendNotFound(req.backend_path.clone()));
    }

    let host = req.host.clone();
    let port = req.port.unwrap_or_else(random_port);
    let listen_addr = format!("{host}:{port}");

    let mut command = Command::new(&req.backend_path);
    command
        .args(&argv)
        .current_dir(&cwd)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(stream_stdout(stdout, output_tx.clone(), ready_tx));
    tokio::spawn(stream_stderr(stderr, output_tx));

    tokio::time::timeout(readiness_timeout, ready_rx)
        .await
        .map_err(|_| LaunchError::Timeout)?
        .map_err(|_| LaunchError::Timeout)?;

    Ok(SpawnedBackend {
        child,
        listen_addr,
    })
}

async fn stream_stdout(
    stdout: tokio::process::ChildStdout,
    output_tx: UnboundedSender<(bool, String)>,
    ready_tx: tokio::sync::oneshot::Sender<()>,
) {
    let mut reader = BufReader::new(stdout);
    let mut first_byte = [0u8; 1];
    let mut ready_tx = Some(ready_tx);

    match reader.read_exact(&mut first_byte).await {
        Ok(_) => {
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(());
            }
        }
        Err(_) => return,
    }

    let mut line = String::from_utf8_lossy(&first_byte).into_owned();
    let mut buf = String::new();
    while reader.read_line(&mut buf).await.unwrap_or(0) > 0 {
        line.push_str(&buf);
        let _ = output_tx.send((false, std::mem::take(&mut line)));
        buf.clear();
    }
    if !line.is_empty() {
        let _ = output_tx.send((false, line));
    }
}

async fn stream_stderr(stderr: tokio::process::ChildStderr, output_tx: UnboundedSender<(bool, String)>) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    while reader.read_line(&mut line).await.unwrap_or(0) > 0 {
        let _ = output_tx.send((true, std::mem::take(&mut line)));
    }
}

/// Connects directly to an already-running backend for `attach-remote`,
/// after the fixed 200ms grace delay that avoids a known race where the
/// backend rejects connections issued too quickly (spec §4.2).
pub async fn connect_remote_grace_delay() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

/// The no-debug-run bypass (spec §4.2 "no-debug + mode=debug"): spawns
/// `go run` directly with no backend involved at all, so no RPC
/// connection is ever established (Testable Property 7). stdout/stderr
/// stream through `output_tx` exactly as a real backend's would; there
/// is no readiness signal to wait for since nothing is listening.
pub async fn spawn_go_run(
    argv: Vec<String>,
    cwd: PathBuf,
    env: &HashMap<String, String>,
    output_tx: UnboundedSender<(bool, String)>,
) -> Result<Child, LaunchError> {
    let mut command = Command::new("go");
    command
        .args(&argv)
        .current_dir(&cwd)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let (ready_tx, _ready_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(stream_stdout(stdout, output_tx.clone(), ready_tx));
    tokio::spawn(stream_stderr(stderr, output_tx));

    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_req(mode: LaunchMode) -> LaunchRequest {
        LaunchRequest {
            mode,
            program: Some(PathBuf::from("/work/main.go")),
            cwd: None,
            env: HashMap::new(),
            build_flags: vec![],
            program_args: vec![],
            backend_path: PathBuf::from("/usr/bin/dlv"),
            log: false,
            log_output: None,
            init: None,
            backend_name: None,
            host: "127.0.0.1".to_string(),
            port: Some(38000),
            api_version: 2,
            gopath_package: None,
            output: None,
        }
    }

    #[test]
    fn debug_mode_file_program_builds_expected_argv() {
        let req = base_req(LaunchMode::Debug);
        let (argv, cwd) = build_argv(&req).unwrap();
        assert_eq!(cwd, PathBuf::from("/work"));
        assert!(argv.contains(&"debug".to_string()));
        assert!(argv.contains(&"/work/main.go".to_string()));
        assert!(argv.contains(&"--headless=true".to_string()));
        assert!(argv.contains(&"--listen=127.0.0.1:38000".to_string()));
        assert!(argv.contains(&"--api-version=2".to_string()));
        assert!(argv.contains(&"--output=__debug_bin".to_string()));
    }

    #[test]
    fn debug_mode_honors_explicit_output_arg() {
        let mut req = base_req(LaunchMode::Debug);
        req.output = Some("/tmp/custom_bin".to_string());
        let (argv, _cwd) = build_argv(&req).unwrap();
        assert!(argv.contains(&"--output=/tmp/custom_bin".to_string()));
    }

    #[test]
    fn debug_mode_directory_program_uses_dot_package() {
        let mut req = base_req(LaunchMode::Debug);
        req.program = Some(std::env::temp_dir());
        let (argv, cwd) = build_argv(&req).unwrap();
        assert_eq!(cwd, std::env::temp_dir());
        assert!(argv.contains(&".".to_string()));
    }

    #[test]
    fn debug_mode_directory_uses_inferred_gopath_package_when_set() {
        let mut req = base_req(LaunchMode::Debug);
        req.program = Some(std::env::temp_dir());
        req.gopath_package = Some("example.com/foo".to_string());
        let (argv, _) = build_argv(&req).unwrap();
        assert!(argv.contains(&"example.com/foo".to_string()));
        assert!(!argv.contains(&".".to_string()));
    }

    #[test]
    fn debug_mode_rejects_non_go_file() {
        let mut req = base_req(LaunchMode::Debug);
        req.program = Some(PathBuf::from("/work/main.txt"));
        assert!(matches!(build_argv(&req), Err(LaunchError::NotAGoFile(_))));
    }

    #[test]
    fn exec_mode_requires_existing_regular_file() {
        let mut req = base_req(LaunchMode::Exec);
        req.program = Some(PathBuf::from("/definitely/not/here"));
        assert!(matches!(
            build_argv(&req),
            Err(LaunchError::NotARegularFile(_))
        ));
    }

    #[test]
    fn exec_mode_rejects_directory() {
        let mut req = base_req(LaunchMode::Exec);
        req.program = Some(std::env::temp_dir());
        assert!(matches!(
            build_argv(&req),
            Err(LaunchError::NotARegularFile(_))
        ));
    }

    #[test]
    fn attach_local_argv_includes_pid() {
        let req = base_req(LaunchMode::AttachLocal { pid: 4242 });
        let (argv, _) = build_argv(&req).unwrap();
        assert!(argv.contains(&"attach".to_string()));
        assert!(argv.contains(&"4242".to_string()));
    }

    #[test]
    fn no_debug_run_argv_has_no_backend_flags() {
        let mut req = base_req(LaunchMode::NoDebugRun);
        req.program_args = vec!["--flag".to_string()];
        let (argv, cwd) = build_argv(&req).unwrap();
        assert_eq!(cwd, PathBuf::from("/work"));
        assert_eq!(argv, vec!["run", "/work/main.go", "--flag"]);
        assert!(!argv.iter().any(|a| a.starts_with("--headless") || a.starts_with("--listen") || a.starts_with("--api-version")));
    }

    #[test]
    fn missing_program_is_rejected() {
        let mut req = base_req(LaunchMode::Debug);
        req.program = None;
        assert!(matches!(build_argv(&req), Err(LaunchError::MissingProgram)));
    }

    #[test]
    fn env_merge_last_wins() {
        let mut process_env = HashMap::new();
        process_env.insert("GOPATH".to_string(), "/from/process".to_string());

        let mut file_env = HashMap::new();
        file_env.insert("GOPATH".to_string(), "/from/file".to_string());
        file_env.insert("EXTRA".to_string(), "x".to_string());

        let mut overrides = HashMap::new();
        overrides.insert("GOPATH".to_string(), "/from/launch".to_string());

        let merged = merge_env(&process_env, std::slice::from_ref(&file_env), &overrides);
        assert_eq!(merged.get("GOPATH").unwrap(), "/from/launch");
        assert_eq!(merged.get("EXTRA").unwrap(), "x");
    }

    #[test]
    fn env_file_parses_key_value_lines() {
        let parsed = parse_env_file("# comment\nFOO=bar\n\nBAZ=qux\n").unwrap();
        assert_eq!(parsed.get("FOO").unwrap(), "bar");
        assert_eq!(parsed.get("BAZ").unwrap(), "qux");
    }

    #[test]
    fn env_file_rejects_malformed_line() {
        assert!(parse_env_file("NOTKEYVALUE").is_err());
    }

    #[test]
    fn random_port_stays_in_range() {
        for _ in 0..100 {
            let p = random_port();
            assert!((2000..50000).contains(&p));
        }
    }

    #[test]
    fn gopath_inference_relative_package() {
        let gopath = PathBuf::from("/home/u/go");
        let program_dir = PathBuf::from("/home/u/go/src/example.com/foo");
        assert_eq!(
            infer_gopath_package(&program_dir, &gopath).as_deref(),
            Some("example.com/foo")
        );
    }

    #[test]
    fn gopath_inference_none_outside_workspace() {
        let gopath = PathBuf::from("/home/u/go");
        let program_dir = PathBuf::from("/tmp/somewhere");
        assert_eq!(infer_gopath_package(&program_dir, &gopath), None);
    }
}
