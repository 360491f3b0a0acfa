//! photoindex daemon.
//!
//! Tracks photo roots, keeps the catalog and vector index in step with them
//! and reports progress.
//!
//! ## Usage
//!
//! ```bash
//! photoindex --add ~/Pictures            # Register a root, then run
//! photoindex --once                      # Scan every root, drain, print status
//! photoindex --stream                    # Run, printing status JSON lines
//! photoindex --roots                     # Print tracked roots as JSON
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use photoindex::{logging, Collaborators, Config, Error, Indexer};

/// Upper bound on how long `--once` waits for the pipeline to drain.
const ONCE_DRAIN_LIMIT: Duration = Duration::from_secs(7 * 24 * 3600);
const FATAL_POLL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Args {
    config_path: Option<PathBuf>,
    add: Vec<PathBuf>,
    list_roots: bool,
    once: bool,
    stream: bool,
    stderr: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("photoindex {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" | "--add" | "-a" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: {} requires a path argument", args[i]);
                    std::process::exit(1);
                }
                let path = PathBuf::from(&args[i + 1]);
                if matches!(args[i].as_str(), "--add" | "-a") {
                    parsed.add.push(path);
                } else {
                    parsed.config_path = Some(path);
                }
                i += 1;
            }
            "--roots" | "-r" => parsed.list_roots = true,
            "--once" | "-1" => parsed.once = true,
            "--stream" | "-s" => parsed.stream = true,
            "--stderr" => parsed.stderr = true,
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"photoindex - Continuous photo indexing daemon

USAGE:
    photoindex [OPTIONS]

OPTIONS:
    -a, --add <PATH>       Track a photo directory (repeatable)
    -r, --roots            Print tracked roots as JSON and exit
    -1, --once             Scan every root, wait for ingest to drain, print status and exit
    -s, --stream           Print coalesced status snapshots as JSON lines while running
    -c, --config <PATH>    Use a custom config file
        --stderr           Log to stderr instead of journald/log file
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    PHOTOINDEX_CONFIG      Config file path
    PHOTOINDEX_LOG         Log filter (e.g. debug, photoindex=trace)
"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    if args.stderr || args.once || args.list_roots {
        logging::init_stderr()?;
    } else {
        logging::init(None)?;
    }

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let indexer = Indexer::start(config.clone(), Collaborators::standard(&config))
        .await
        .context("Failed to start indexer")?;

    for path in &args.add {
        match indexer.add_root(path).await {
            Ok(root) => info!(root_id = root.id, path = %root.path.display(), status = root.status.as_str(), "Tracking root"),
            Err(Error::DuplicateRoot(existing)) => {
                warn!(path = %existing.display(), "Root already tracked")
            }
            Err(e) => {
                let _ = indexer.shutdown().await;
                return Err(e).with_context(|| format!("Cannot add root {}", path.display()));
            }
        }
    }

    if args.list_roots {
        let roots = indexer.list_roots()?;
        println!("{}", serde_json::to_string_pretty(&roots)?);
        indexer.shutdown().await?;
        return Ok(());
    }

    if args.once {
        let drained = indexer.wait_idle(ONCE_DRAIN_LIMIT).await;
        println!("{}", indexer.status().to_json()?);
        indexer.shutdown().await?;
        if !drained {
            anyhow::bail!("Pipeline did not drain");
        }
        return Ok(());
    }

    run_until_stopped(&indexer, args.stream).await;
    indexer.shutdown().await.context("Indexer halted")?;
    Ok(())
}

/// Serve until Ctrl-C or a fatal pipeline error.
async fn run_until_stopped(indexer: &Indexer, stream: bool) {
    let mut status = indexer.subscribe();
    let mut fatal_check = tokio::time::interval(FATAL_POLL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
            json = status.next_json(), if stream => match json {
                Some(json) => println!("{}", json),
                None => break,
            },
            _ = fatal_check.tick() => {
                if indexer.fatal_error().is_some() {
                    break;
                }
            }
        }
    }
}
