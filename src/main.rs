//! ttts-server — service entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Parse CLI flags (`-f` config path, `-v` verbosity)
//!   3. Load config, resolve effective log level, init logger once
//!   4. Open one search engine per configured index (replays interrupted work)
//!   5. Spawn Ctrl-C → shutdown signal watcher
//!   6. Run the HTTP component until shutdown
//!   7. Cancel token, flush and close every engine

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use ttts::config;
use ttts::engine::SearchEngine;
use ttts::error::EngineError;
use ttts::http::{HttpChannel, ServiceState};
use ttts::logger;
use ttts::runtime::{self, Component};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), EngineError> {
    // Load .env if present — ignore errors (file is optional).
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();

    let config = config::load(args.config_path.as_deref())?;

    // Without a CLI override the configured level is load-bearing; catch
    // typos before the subscriber quietly accepts them as target filters.
    if args.log_level.is_none() {
        logger::validate_level(&config.log_level)?;
    }
    logger::init(&config.log_level, args.log_level)?;

    info!(
        server = %config.server_name,
        work_dir = %config.work_dir.display(),
        indexes = config.indexes.len(),
        configured_log_level = %config.log_level,
        cli_log_level = ?args.log_level,
        "config loaded"
    );

    std::fs::create_dir_all(&config.work_dir)?;

    // Shared shutdown token — Ctrl-C cancels it, all tasks watch it.
    let shutdown = CancellationToken::new();

    let mut engines: BTreeMap<String, Arc<SearchEngine>> = BTreeMap::new();
    for index_cfg in config.indexes.clone() {
        let name = index_cfg.name.clone();
        let engine = SearchEngine::open(index_cfg, &shutdown)?;
        engines.insert(name, Arc::new(engine));
    }

    // Ctrl-C handler — cancels the token so all tasks shut down.
    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    print_startup_summary(&config);

    let mut components: Vec<Box<dyn Component>> = Vec::new();
    if config.http.enabled {
        let state = Arc::new(ServiceState {
            server_name: config.server_name.clone(),
            engines: engines.clone(),
        });
        components.push(Box::new(HttpChannel::new(
            "http",
            config.http.bind.clone(),
            state,
        )));
    }

    let result = if components.is_empty() {
        info!("no transports enabled; running engines until ctrl-c");
        shutdown.cancelled().await;
        Ok(())
    } else {
        runtime::spawn_components(components, shutdown.clone()).join().await
    };

    // Components are down; flush and close every engine.
    shutdown.cancel();
    for engine in engines.values() {
        engine.close().await;
    }

    result
}

fn print_startup_summary(config: &config::Config) {
    println!("{} starting", config.server_name);
    println!("  work dir: {}", config.work_dir.display());
    if config.http.enabled {
        println!("  http: {}", config.http.bind);
    } else {
        println!("  http: disabled");
    }
    for index in &config.indexes {
        println!(
            "  index {}: bucket={}s initial_id={} positions={} contents={}",
            index.name,
            index.bucket_duration_seconds,
            index.initial_document_id,
            index.record_positions,
            index.record_contents,
        );
    }
}

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut config_path = None;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: ttts-server [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Path to configuration file (default: config/default.toml)");
                println!("  -v, -vv, -vvv, -vvvv       Increase logging verbosity");
                std::process::exit(0);
            }
            "-f" | "--config" => {
                if let Some(path) = iter.next() {
                    config_path = Some(path);
                } else {
                    eprintln!("error: -f/--config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            _ => {}
        }
    }

    CliArgs {
        log_level: logger::verbosity_level(verbosity),
        config_path,
    }
}
