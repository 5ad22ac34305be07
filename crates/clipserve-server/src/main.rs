//! clipserve - CLIP image embedding service
//!
//! Loads the CLIP ViT-B/32 vision tower at startup and serves 512-dimensional
//! image embeddings over HTTP.

use clipserve_core::Config;
use clipserve_server::ServerRunner;
use std::env;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    eprintln!(
        r#"clipserve v{VERSION} - CLIP image embedding service

USAGE:
    clipserve [OPTIONS]

OPTIONS:
    -h, --help          Print this help message
    -v, --version       Print version
    --config <PATH>     Read configuration from PATH
    --host <HOST>       Bind host (default: 0.0.0.0)
    --port <PORT>       Bind port (default: 8001)

ENVIRONMENT:
    CLIPSERVE_HOST      Bind host
    CLIPSERVE_PORT      Bind port
    HF_HOME             Model cache root (default: <cache dir>/huggingface)
    RUST_LOG            Log filter (default: server.log_level)

ENDPOINTS:
    GET  /health                   Readiness and model info
    GET  /status                   Uptime and request counters
    POST /extract-features         Multipart field `file`
    POST /extract-features-batch   Repeated multipart field `files`
"#
    );
}

fn print_version() {
    println!("clipserve {}", VERSION);
}

/// Take the value following a flag or exit with a usage error
fn flag_value(args: &[String], i: usize, flag: &str) -> String {
    match args.get(i) {
        Some(value) => value.clone(),
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut host: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                print_version();
                return Ok(());
            }
            "--config" => {
                i += 1;
                config_path = Some(PathBuf::from(flag_value(&args, i, "--config")));
            }
            "--host" => {
                i += 1;
                host = Some(flag_value(&args, i, "--host"));
            }
            "--port" => {
                i += 1;
                let raw = flag_value(&args, i, "--port");
                port = Some(
                    raw.parse()
                        .map_err(|_| anyhow::anyhow!("Invalid port: {}", raw))?,
                );
            }
            arg => {
                eprintln!("Unknown option: {}", arg);
                eprintln!("Run 'clipserve --help' for usage");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let mut config = match config_path {
        Some(path) => {
            let mut config = Config::load_from_path(&path)
                .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
            config.apply_overrides(|key| env::var(key).ok())?;
            config
        }
        None => Config::load()?,
    };
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting clipserve v{}", VERSION);

    let runner = ServerRunner::new(config)
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    // Blocks until shutdown; returns early if the model cannot be loaded
    runner.run().await
}
