use std::path::PathBuf;

use clap::Parser;
use godlv_bridge::config::AdapterConfig;
use godlv_bridge::run_adapter;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(version, about = "Debug Adapter Protocol bridge for a Go debugger backend")]
struct Cli {
    /// Listen on this TCP port for a single DAP client instead of stdio.
    #[arg(long)]
    port: Option<u16>,
    /// Override the adapter's own log file path (`GODLV_BRIDGE_LOG` does the same).
    #[arg(long)]
    log_dest: Option<PathBuf>,
}

/// Mirrors the teacher's `init_daemon_logging`: try file logging at the
/// configured directory/basename, fall back to stderr if that fails.
fn init_logging(cfg: &AdapterConfig, explicit_dest: Option<PathBuf>) {
    let log_path = explicit_dest.or_else(|| cfg.log_path.clone());

    if let Some(path) = log_path {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new(".")).to_path_buf();
        let basename = path
            .file_stem()
            .unwrap_or_else(|| std::ffi::OsStr::new("godlv-bridge"))
            .to_string_lossy()
            .to_string();

        match flexi_logger::Logger::try_with_str(&cfg.log_level) {
            Ok(logger) => {
                match logger
                    .log_to_file(flexi_logger::FileSpec::default().directory(dir).basename(basename))
                    .start()
                {
                    Ok(handle) => {
                        // Kept alive for the whole process lifetime.
                        std::mem::forget(handle);
                        return;
                    }
                    Err(e) => eprintln!("Warning: could not start file logging: {e}"),
                }
            }
            Err(e) => eprintln!("Warning: could not configure logger: {e}"),
        }
    }

    if let Ok(logger) = flexi_logger::Logger::try_with_str(&cfg.log_level) {
        let _ = logger.start();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let cfg = AdapterConfig::load();
    init_logging(&cfg, cli.log_dest.clone());

    log::info!("godlv-bridge starting");

    match cli.port {
        Some(port) => {
            let listener = TcpListener::bind(("127.0.0.1", port)).await?;
            log::info!("listening for a DAP client on 127.0.0.1:{port}");
            let (stream, peer) = listener.accept().await?;
            log::info!("DAP client connected from {peer}");
            let (read_half, write_half) = stream.into_split();
            run_adapter(read_half, write_half, cfg).await
        }
        None => {
            let stdin = tokio::io::stdin();
            let stdout = tokio::io::stdout();
            run_adapter(stdin, stdout, cfg).await
        }
    }
}
