use std::panic;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use human_panic::setup_panic;
use log::info;
use parking_lot::Mutex as SyncMutex;

use katamari::config::Config;
use katamari::dispatcher::{DispatchClient, DispatchServer};
use katamari::storage::record_engine::RecordEngine;
use katamari_cli::trace;

#[derive(Debug, Parser)]
#[command(version, author, about)]
pub struct Args {
    /// Configuration file path (YAML).
    #[clap(short = 'c', long = "config", default_value = "config/katamari.yaml")]
    config: String,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a dispatch server, accepting worker connections.
    Serve,
    /// Run a dispatch worker, connecting to a server.
    Worker {
        #[clap(long)]
        connect: String,
        #[clap(long)]
        id: String,
    },
}

#[tokio::main]
pub async fn main() -> Result<()> {
    setup_panic_hooks();

    eprintln!();
    eprintln!("██  ██  █        █");
    eprintln!("██ ██   ██      ██");
    eprintln!("███      ██    ██");
    eprintln!("██ ██     ██  ██");
    eprintln!("██  ██     ████  Katamari");
    eprintln!();

    let args = Args::parse();

    let log_dir =
        format!("{}/.katamari", std::env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = trace::init_logging(&log_dir, &args.log_level).await?;
    info!("katamari-cli starting with args: {:?}", &args);

    let cfg = Config::load(&PathBuf::from(&args.config)).unwrap_or_else(|err| {
        log::warn!("failed to load config at {}: {err}, using defaults", &args.config);
        Config::default()
    });

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("received Ctrl+C!");
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    let engine = Arc::new(SyncMutex::new(RecordEngine::new(cfg.data_dir.clone())?));

    match args.cmd {
        Command::Serve => {
            let server = DispatchServer::new(engine);
            server.serve(&cfg.bind_address).await?;
        }
        Command::Worker { connect, id } => {
            let client = Arc::new(DispatchClient::new(id, engine));
            client.run(&connect).await?;
        }
    }

    Ok(())
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();

    if std::env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);
            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta)
                .expect("human-panic: printing error message to console failed");
        }));
    }
}
