mod logging;
mod paths;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use landrop_network::{
    DiscoveryEngine, DiscoveryEvent, DropConfig, IncomingTransfer, LocalIdentity, PeerEndpoint,
    PeerRecord, TransferEngine, TransferEvent, TransferRecord, TransferStatus,
};

#[derive(Parser, Debug)]
#[command(name = "landrop")]
#[command(about = "Share files with devices on the local network", long_about = None)]
struct Args {
    /// Config file (defaults to ~/.landrop/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Device name announced to peers
    #[arg(short, long, global = true)]
    name: Option<String>,

    /// Preferred UDP discovery port
    #[arg(long, global = true)]
    discovery_port: Option<u16>,

    /// Preferred TCP transfer port
    #[arg(long, global = true)]
    transfer_port: Option<u16>,

    /// Print debug logs to the console
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Announce this device and receive files until interrupted
    Listen {
        /// Directory received files are saved to
        #[arg(short, long)]
        download_dir: Option<PathBuf>,

        /// Accept every incoming file without asking
        #[arg(long)]
        auto_accept: bool,
    },

    /// Listen for a while and print the devices found
    Peers {
        /// Seconds to wait for announcements
        #[arg(short, long, default_value_t = 5)]
        wait: u64,
    },

    /// Send one file to a device
    Send {
        /// File to send
        file: PathBuf,

        /// Transfer address of the receiving device
        #[arg(long)]
        to: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _guard = logging::init_logging(&paths::logs_dir()?, args.verbose)?;

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => paths::config_path()?,
    };
    let mut config = DropConfig::load_or_default(&config_path);
    if let Some(port) = args.discovery_port {
        config.discovery.port = port;
    }
    if let Some(port) = args.transfer_port {
        config.transfer.port = port;
    }

    let name = args.name.clone().unwrap_or_else(paths::default_device_name);
    let identity = LocalIdentity::load_or_generate(&paths::identity_path()?, name.clone());
    info!("LanDrop starting as '{}' ({})", identity.name, identity.id);

    match args.command {
        Commands::Listen {
            download_dir,
            auto_accept,
        } => {
            if let Some(dir) = download_dir {
                config.transfer.download_dir = dir;
            }
            listen(identity, config, &name, auto_accept).await
        }
        Commands::Peers { wait } => peers(identity, config, &name, wait).await,
        Commands::Send { file, to } => send(identity, config, file, to).await,
    }
}

// ---------------------------------------------------------------------------
// listen
// ---------------------------------------------------------------------------

async fn listen(
    identity: LocalIdentity,
    config: DropConfig,
    name: &str,
    auto_accept: bool,
) -> Result<()> {
    let download_dir = config.transfer.download_dir.clone();
    let transfers = TransferEngine::new(identity.clone(), config.transfer);
    let tcp_port = transfers
        .start()
        .await
        .context("Failed to start transfer listener")?;

    let discovery = DiscoveryEngine::new(identity, config.discovery);
    let mut peer_events = discovery.subscribe();
    let mut transfer_events = transfers.subscribe();
    discovery
        .start(name, tcp_port)
        .await
        .context("Failed to start discovery")?;

    println!(
        "'{name}' listening on TCP {tcp_port} (UDP {}), saving to {}",
        discovery.bound_port().unwrap_or_default(),
        download_dir.display()
    );
    if !auto_accept {
        println!("Answer incoming requests with y or n.");
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut waiting: VecDeque<IncomingTransfer> = VecDeque::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            event = peer_events.recv() => match event {
                Ok(event) => print_peer_event(&event),
                Err(RecvError::Lagged(n)) => warn!("Missed {n} discovery events"),
                Err(RecvError::Closed) => break,
            },

            event = transfer_events.recv() => match event {
                Ok(TransferEvent::IncomingRequest(request)) => {
                    if auto_accept {
                        println!("Accepting '{}' from {}", request.file_name, request.peer.name);
                        if let Err(e) = transfers.accept_incoming(&request.transfer_id, None) {
                            warn!("Accept failed: {e}");
                        }
                    } else {
                        println!(
                            "Accept '{}' ({}) from {}? [y/N]",
                            request.file_name,
                            human_bytes(request.file_size),
                            request.peer.name
                        );
                        waiting.push_back(request);
                    }
                }
                Ok(event) => print_transfer_event(&event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },

            line = stdin.next_line(), if !waiting.is_empty() => {
                let Some(request) = waiting.pop_front() else { continue };
                let answer = line.ok().flatten().unwrap_or_default();
                let result = if answer.trim().eq_ignore_ascii_case("y") {
                    transfers.accept_incoming(&request.transfer_id, None)
                } else {
                    transfers.reject_incoming(&request.transfer_id, "User declined")
                };
                if let Err(e) = result {
                    println!("'{}' is no longer waiting: {e}", request.file_name);
                }
                if let Some(next) = waiting.front() {
                    println!(
                        "Accept '{}' ({}) from {}? [y/N]",
                        next.file_name,
                        human_bytes(next.file_size),
                        next.peer.name
                    );
                }
            }
        }
    }

    println!("Shutting down");
    discovery.stop();
    transfers.stop();
    Ok(())
}

// ---------------------------------------------------------------------------
// peers
// ---------------------------------------------------------------------------

async fn peers(identity: LocalIdentity, config: DropConfig, name: &str, wait: u64) -> Result<()> {
    let discovery = DiscoveryEngine::new(identity, config.discovery);
    discovery
        .start(name, config.transfer.port)
        .await
        .context("Failed to start discovery")?;

    tokio::time::sleep(Duration::from_secs(wait)).await;

    let mut found = discovery.peers();
    discovery.stop();

    if found.is_empty() {
        println!("No devices found");
        return Ok(());
    }

    found.sort_by(|a, b| a.name.cmp(&b.name));
    println!("{:<24} {:<22} {}", "NAME", "ADDRESS", "ID");
    for peer in &found {
        println!(
            "{:<24} {:<22} {}",
            peer.name,
            peer.transfer_addr(),
            peer.id.short()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// send
// ---------------------------------------------------------------------------

async fn send(
    identity: LocalIdentity,
    config: DropConfig,
    file: PathBuf,
    to: SocketAddr,
) -> Result<()> {
    let transfers = TransferEngine::new(identity, config.transfer);
    let mut events = transfers.subscribe();

    let reporter = tokio::spawn(async move {
        let mut last_decile = None;
        loop {
            match events.recv().await {
                Ok(TransferEvent::ProgressUpdated(record)) => {
                    let decile = (record.progress_percent() / 10.0) as u32;
                    if last_decile != Some(decile) {
                        last_decile = Some(decile);
                        println!(
                            "{:>3.0}%  {} / {}",
                            record.progress_percent(),
                            human_bytes(record.bytes_transferred),
                            human_bytes(record.file_size)
                        );
                    }
                }
                Ok(
                    TransferEvent::Completed(_)
                    | TransferEvent::Failed(_)
                    | TransferEvent::Cancelled(_),
                ) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("Sending {} to {to}", file.display());
    let record = transfers
        .send_file(&file, PeerEndpoint::from_addr(to))
        .await
        .with_context(|| format!("Cannot send {}", file.display()))?;
    let _ = reporter.await;

    print_outcome(&record);
    if record.status != TransferStatus::Completed {
        bail!(
            "Transfer did not complete: {}",
            record.error_message.as_deref().unwrap_or("cancelled")
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_peer_event(event: &DiscoveryEvent) {
    match event {
        DiscoveryEvent::PeerDiscovered(peer) => println!("+ {}", describe_peer(peer)),
        DiscoveryEvent::PeerLost(peer) => println!("- {}", describe_peer(peer)),
        DiscoveryEvent::PeerUpdated(_) => {}
        DiscoveryEvent::Error(message) => println!("! discovery: {message}"),
    }
}

fn print_transfer_event(event: &TransferEvent) {
    match event {
        TransferEvent::Started(record) => println!(
            "Receiving '{}' ({}) from {}",
            record.file_name,
            human_bytes(record.file_size),
            record.peer.name
        ),
        TransferEvent::IncomingFileCompleted { path, .. } => {
            println!("Saved {}", path.display())
        }
        TransferEvent::Failed(record) | TransferEvent::Cancelled(record) => print_outcome(record),
        TransferEvent::Error(message) => println!("! transfer: {message}"),
        _ => {}
    }
}

fn print_outcome(record: &TransferRecord) {
    match record.status {
        TransferStatus::Completed => println!(
            "'{}' completed ({})",
            record.file_name,
            human_bytes(record.file_size)
        ),
        TransferStatus::Cancelled => println!("'{}' cancelled", record.file_name),
        _ => println!(
            "'{}' failed: {}",
            record.file_name,
            record.error_message.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn describe_peer(peer: &PeerRecord) -> String {
    format!("{} at {} ({})", peer.name, peer.transfer_addr(), peer.id.short())
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
