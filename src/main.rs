//! Snapdock - album sync host for a paired mobile client
//!
//! Runs the sync server and drives the three sync operations from stdin:
//! `albums`, `metadata-down`, `metadata-up`.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use snapdock::events::{ConsoleSink, EventBus, FileSink};
use snapdock::library::AlbumLibrary;
use snapdock::server::TransportServer;
use snapdock::session::SyncSession;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Snapdock - album sync host for a paired mobile client")]
struct Args {
    /// Bind address (host:port)
    #[arg(long, default_value = "0.0.0.0:6969")]
    bind: String,

    /// Links file pairing each album folder with its metadata file
    #[arg(long, default_value = "links.json")]
    links: PathBuf,

    /// Write timestamped log lines to file
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Set up Ctrl-C handler
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .expect("Error setting Ctrl-C handler");

    let args = Args::parse();

    let library = AlbumLibrary::load(&args.links)?;

    let events = Arc::new(EventBus::new());
    events.register(Arc::new(ConsoleSink));
    if let Some(ref path) = args.log_file {
        events.register(Arc::new(FileSink::new(path)?));
    }

    for link in library.links() {
        if !link.is_valid() {
            events.log(&format!(
                "Warning: link is not valid on disk: {} / {}",
                link.album_path.display(),
                link.metadata_path.display()
            ));
        }
    }

    let session = Arc::new(SyncSession::new(library, Arc::clone(&events)));
    let server = TransportServer::new(Arc::clone(&session), Arc::clone(&events));

    // Sync operations are driven from stdin while the server runs
    spawn_command_reader(session);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(server.serve(&args.bind))
}

fn spawn_command_reader(session: Arc<SyncSession>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match line.trim() {
                "" => {}
                "albums" => session.download_albums(),
                "metadata-down" => session.download_metadata(),
                "metadata-up" => session.upload_metadata(),
                "quit" | "exit" => std::process::exit(0),
                other => eprintln!(
                    "unknown command {other:?} (albums | metadata-down | metadata-up | quit)"
                ),
            }
        }
    });
}
