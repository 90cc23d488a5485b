use clap::{Parser, Subcommand};
use lansync::utils::setup_logging;
use lansync::{Config, Node, Result, SyncError};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lansync")]
#[command(about = "LAN file replication with automatic peer discovery")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a replication node
    Start {
        /// TCP port for transfer and sync traffic
        #[arg(short, long, default_value = "8001")]
        port: u16,
        /// Directory replicated across the cluster
        #[arg(short, long, default_value = "shared")]
        dir: PathBuf,
        /// Directory for the operation log and peer snapshot
        #[arg(short, long, default_value = "state")]
        state: PathBuf,
    },
    /// Send a file or directory to a peer
    Send {
        /// File or directory to send
        path: PathBuf,
        /// Peer address (host:port)
        target: SocketAddr,
    },
    /// List files in the shared directory
    List {
        /// Query a remote peer instead of the local tree
        #[arg(long)]
        peer: Option<SocketAddr>,
    },
    /// Delete a path from the shared directory
    Delete {
        /// Path relative to the shared directory
        path: String,
        /// Replicate the delete to all known peers
        #[arg(long)]
        propagate: bool,
    },
    /// Exchange operation logs with a peer
    Sync {
        /// Peer address (host:port)
        target: SocketAddr,
        /// Push the local log instead of pulling the remote one
        #[arg(long)]
        push: bool,
    },
    /// Show known peers
    Peers {
        /// Probe each peer over TCP and report reachability
        #[arg(long)]
        probe: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { port, dir, state } => {
            let config = Config {
                tcp_port: port,
                shared_dir: dir,
                state_dir: state,
                ..Config::default()
            }
            .apply_env();

            let mut node = Node::new(config).await?;
            node.start().await?;
        }
        Commands::Send { path, target } => {
            let node = Node::new(Config::default().apply_env()).await?;
            match node.send_file(&path, target).await {
                Ok(()) => println!("Sent {} to {}", path.display(), target),
                Err(SyncError::SendExhausted { attempts, .. }) => {
                    println!(
                        "Delivery to {} failed after {} attempts, queued for retry",
                        target, attempts
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Commands::List { peer } => {
            let node = Node::new(Config::default().apply_env()).await?;
            let files = match peer {
                Some(target) => node.request_view(target).await?,
                None => node.list_local_files().await?,
            };

            if files.is_empty() {
                println!("No files");
            } else {
                for file in files {
                    if file.is_dir {
                        println!("  {}/", file.path);
                    } else {
                        println!("  {} ({} bytes)", file.path, file.size);
                    }
                }
            }
        }
        Commands::Delete { path, propagate } => {
            let node = Node::new(Config::default().apply_env()).await?;
            node.delete_path(&path).await?;
            println!("Deleted {}", path);

            if propagate {
                let notified = node.broadcast_delete(&path).await?;
                println!("Propagated delete to {} peer(s)", notified);
            }
        }
        Commands::Sync { target, push } => {
            let node = Node::new(Config::default().apply_env()).await?;
            if push {
                node.push_log(target).await?;
                println!("Pushed operation log to {}", target);
            } else {
                let applied = node.request_sync(target).await?;
                println!("Applied {} operation(s) from {}", applied, target);
            }
        }
        Commands::Peers { probe } => {
            let node = Node::new(Config::default().apply_env()).await?;
            if probe {
                let peers = node.live_peers().await;
                if peers.is_empty() {
                    println!("No known peers");
                }
                for (peer, alive) in peers {
                    let status = if alive { "reachable" } else { "unreachable" };
                    println!("  node {} at {} ({})", peer.id, peer.addr, status);
                }
            } else {
                let peers = node.peers().await;
                if peers.is_empty() {
                    println!("No known peers");
                }
                for peer in peers {
                    println!("  node {} at {}", peer.id, peer.addr);
                }
            }
        }
    }

    Ok(())
}
