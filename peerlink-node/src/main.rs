// peerlink: peer node with interactive search and download.

use std::path::PathBuf;

use clap::Parser;
use peerlink_core::{Notice, PeerAddress};
use peerlink_node::command::{format_results, Command, USAGE};
use peerlink_node::{config, Node};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "peerlink", version, about = "Peer-to-peer file search and transfer node")]
struct Args {
    /// Port to listen on.
    port: u16,
    /// Peer to join at startup.
    #[arg(requires = "connect_port")]
    connect_host: Option<String>,
    connect_port: Option<u16>,
    /// Config file instead of the default locations.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    advertise_host: Option<String>,
    #[arg(long)]
    shared_dir: Option<PathBuf>,
    #[arg(long)]
    download_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut cfg = config::load(args.config.as_deref())?;
    cfg.listen_port = args.port;
    if let Some(host) = args.advertise_host {
        cfg.advertise_host = host;
    }
    if let Some(dir) = args.shared_dir {
        cfg.shared_dir = dir;
    }
    if let Some(dir) = args.download_dir {
        cfg.download_dir = dir;
    }

    let (node, notices) = Node::start(cfg).await?;
    tracing::debug!(bound = %node.local_addr(), "listener bound");
    println!("peer {} listening on {}", node.peer_id(), node.address());
    if let (Some(host), Some(port)) = (args.connect_host, args.connect_port) {
        node.connect(PeerAddress::new(host, port))?;
    }
    tokio::spawn(print_notices(notices));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{USAGE}");
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown_signal() => None,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(Command::Search(term)) => node.search(&term)?,
            Ok(Command::List) => print!("{}", format_results(&node.results().await?)),
            Ok(Command::Download { result, file }) => {
                if let Err(e) = node.download(result, file).await {
                    println!("cannot download: {e}");
                }
            }
            Ok(Command::Exit) => break,
            Err(e) => println!("{e}\n{USAGE}"),
        }
    }
    node.shutdown().await;
    Ok(())
}

async fn print_notices(mut notices: mpsc::UnboundedReceiver<Notice>) {
    while let Some(notice) = notices.recv().await {
        match notice {
            Notice::NoPeers => println!("no peers to search"),
            Notice::SearchResult { index, result } => {
                println!("result [{index}] from {}: {}", result.address, result.files.join(", "))
            }
            Notice::DownloadRefused { filename } => println!("{filename}: refused by peer"),
            Notice::DownloadAbandoned { filename } => println!("{filename}: download abandoned"),
            Notice::DownloadComplete { filename, bytes } => {
                println!("{filename}: downloaded {bytes} bytes")
            }
            Notice::AnchorChanged { address, .. } => println!("failover anchor is now {address}"),
            Notice::ConnectFailed { address } => println!("could not connect to {address}"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
