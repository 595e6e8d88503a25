//! The riptorrent command line front end: load the configuration, start
//! the engine, add the requested torrents, and run until interrupted.

use std::{path::PathBuf, process};

use clap::{Parser, Subcommand};

use riptorrent::{conf::Conf, engine};

/// Exit code for configuration problems (missing or unparsable file).
const EXIT_CONFIG: i32 = 1;
/// Exit code for IO failures at startup (directories, sockets).
const EXIT_IO: i32 = 2;

#[derive(Parser)]
#[command(name = "riptorrent", version, about = "A BitTorrent client")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the engine until interrupted.
    Run {
        /// Path to the JSON configuration file.
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// .torrent files or magnet links to download.
        #[arg(value_name = "TORRENT")]
        torrents: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        CliCommand::Run { config, torrents } => run(config, torrents).await,
    }
}

async fn run(config: Option<PathBuf>, torrents: Vec<String>) {
    let conf = match config {
        Some(path) => match Conf::load(&path) {
            Ok(conf) => conf,
            Err(e) => {
                eprintln!("riptorrent: {}", e);
                process::exit(EXIT_CONFIG);
            }
        },
        None => Conf::default(),
    };

    let (join_handle, handle) = match engine::start(conf).await {
        Ok(started) => started,
        Err(e) => {
            eprintln!("riptorrent: cannot start engine: {}", e);
            process::exit(EXIT_IO);
        }
    };

    for torrent in torrents {
        let result = if torrent.starts_with("magnet:") {
            handle.add_magnet(torrent)
        } else {
            handle.add_torrent_file(torrent)
        };
        if let Err(e) = result {
            log::error!("Cannot add torrent: {}", e);
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Cannot listen for interrupt signal: {}", e);
    }
    log::info!("Interrupted, shutting down");

    if handle.shutdown().is_ok() {
        match join_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                eprintln!("riptorrent: engine error: {}", e);
                process::exit(EXIT_IO);
            }
            Err(e) => {
                eprintln!("riptorrent: engine task panicked: {}", e);
                process::exit(EXIT_IO);
            }
        }
    }
}
