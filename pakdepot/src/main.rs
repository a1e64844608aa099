use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pakdepot_core::bandwidth::BandwidthArbiter;
use pakdepot_core::cache::PackageCache;
use pakdepot_core::catalog::{PackageCatalog, StaticCatalog};
use pakdepot_core::chunk_store::ChunkStore;
use pakdepot_core::config::DepotConfig;
use pakdepot_core::coordinator::DistributionCoordinator;
use pakdepot_core::mirror_registry::{MirrorRegistry, NewMirror};
use pakdepot_core::peer_network::PeerNetwork;
use pakdepot_core::storage::MirrorStore;
use pakdepot_core::types::PackageInfo;
use pakdepot_core::{DepotError, DepotResult};

#[derive(Parser)]
#[command(name = "pakdepot")]
#[command(about = "Hybrid P2P/mirror package distribution node", long_about = None)]
struct Cli {
    /// Data directory for persistent state
    #[arg(long, default_value = "./data", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the distribution node: peer server plus background duties
    Serve {
        /// TCP port for the peer server
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Peers to handshake with at startup (host:port, comma-separated)
        #[arg(long)]
        peers: Option<String>,
    },
    /// Download one package and print the local artifact path
    Download {
        #[arg(long)]
        name: String,

        /// Package manager the artifact belongs to (apt, dnf, brew, ...)
        #[arg(long)]
        manager: String,

        #[arg(long)]
        version: Option<String>,

        /// Declared size in bytes
        #[arg(long, default_value = "0")]
        size: u64,

        /// Declared sha256 hex digest
        #[arg(long)]
        checksum: Option<String>,

        /// Skip the P2P path and go straight to mirrors
        #[arg(long)]
        no_p2p: bool,
    },
    /// Mirror management
    Mirror {
        #[command(subcommand)]
        command: MirrorCommands,
    },
    /// Print the aggregate distribution statistics snapshot
    Stats,
    /// Remove cached artifacts older than the configured age
    CacheCleanup {
        #[arg(long, default_value = "7")]
        max_age_days: u64,
    },
}

#[derive(clap::Subcommand)]
enum MirrorCommands {
    /// Register a mirror
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        #[arg(long, default_value = "unknown")]
        location: String,
        /// Rated bandwidth in Mbps
        #[arg(long, default_value = "100")]
        bandwidth: u32,
        /// Supported package managers (comma-separated)
        #[arg(long)]
        managers: String,
        #[arg(long, default_value = "1")]
        priority: i32,
        #[arg(long, default_value = "10")]
        max_connections: u32,
    },
    /// Remove a mirror by id
    Remove {
        #[arg(long)]
        id: String,
    },
    /// List registered mirrors
    List,
}

struct Services {
    coordinator: DistributionCoordinator,
    mirrors: Arc<MirrorRegistry>,
    peers: Arc<PeerNetwork>,
    catalog: Arc<StaticCatalog>,
}

fn build_services(data_dir: &PathBuf, mut config: DepotConfig, port: Option<u16>) -> DepotResult<Services> {
    std::fs::create_dir_all(data_dir)?;
    if let Some(port) = port {
        config.peer.listen_port = port;
    }

    let store = MirrorStore::open(&data_dir.join("mirrors.redb"))?;
    let mirrors = Arc::new(MirrorRegistry::new(store, config.mirror)?);
    let chunks = Arc::new(ChunkStore::new(config.chunk.chunk_size));
    let peers = Arc::new(PeerNetwork::new(config.peer, chunks.clone()));
    let cache = Arc::new(PackageCache::new(&config.cache.dir)?);
    let catalog = Arc::new(StaticCatalog::new());
    let bandwidth = Arc::new(BandwidthArbiter::new(config.bandwidth.max_mbps));

    let coordinator = DistributionCoordinator::new(
        config.coordinator,
        bandwidth,
        mirrors.clone(),
        peers.clone(),
        cache,
        chunks,
        catalog.clone() as Arc<dyn PackageCatalog>,
    );

    Ok(Services {
        coordinator,
        mirrors,
        peers,
        catalog,
    })
}

#[tokio::main]
async fn main() -> DepotResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = DepotConfig::default();

    match cli.command {
        Commands::Serve { port, peers } => {
            let services = build_services(&cli.data_dir, config, Some(port))?;

            let (addr, listener) = services.peers.start_listener().await?;
            let prober = services.mirrors.spawn_health_prober();
            let cleanup = services.peers.spawn_cleanup();
            let discovery = services.peers.spawn_discovery();
            info!(addr = %addr, node_id = %services.peers.local_id(), "pakdepot node running");

            if let Some(peers) = peers {
                for entry in peers.split(',').filter(|s| !s.is_empty()) {
                    let Some((host, port)) = entry.rsplit_once(':') else {
                        return Err(DepotError::Internal {
                            message: format!("invalid peer address: {}", entry),
                        });
                    };
                    let port = port.parse().map_err(|_| DepotError::Internal {
                        message: format!("invalid peer port in: {}", entry),
                    })?;
                    services.peers.connect_to_peer(host, port).await;
                }
            }

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            listener.abort();
            prober.abort();
            cleanup.abort();
            discovery.abort();
        }
        Commands::Download {
            name,
            manager,
            version,
            size,
            checksum,
            no_p2p,
        } => {
            let services = build_services(&cli.data_dir, config, None)?;
            let version_ref = version.as_deref();

            services
                .catalog
                .insert(PackageInfo {
                    name: name.clone(),
                    manager: manager.clone(),
                    version: version.clone().unwrap_or_else(|| "latest".to_string()),
                    size,
                    checksum,
                    mirrors: vec![],
                    chunk_size: 1024 * 1024,
                    total_chunks: size.div_ceil(1024 * 1024) as u32,
                })
                .await;

            let path = services
                .coordinator
                .download_package(&name, &manager, version_ref, !no_p2p)
                .await?;
            println!("{}", path.display());
        }
        Commands::Mirror { command } => {
            let services = build_services(&cli.data_dir, config, None)?;
            match command {
                MirrorCommands::Add {
                    name,
                    url,
                    location,
                    bandwidth,
                    managers,
                    priority,
                    max_connections,
                } => {
                    let id = services
                        .mirrors
                        .add_mirror(NewMirror {
                            name,
                            url,
                            location,
                            bandwidth_mbps: bandwidth,
                            supported_managers: managers
                                .split(',')
                                .map(|s| s.trim().to_string())
                                .filter(|s| !s.is_empty())
                                .collect(),
                            priority,
                            max_connections,
                        })
                        .await?;
                    println!("{}", id);
                }
                MirrorCommands::Remove { id } => {
                    if services.mirrors.remove_mirror(&id).await? {
                        println!("removed {}", id);
                    } else {
                        return Err(DepotError::MirrorNotFound { mirror_id: id });
                    }
                }
                MirrorCommands::List => {
                    for mirror in services.mirrors.list_mirrors().await {
                        println!("{}", serde_json::to_string(&mirror)?);
                    }
                }
            }
        }
        Commands::Stats => {
            let services = build_services(&cli.data_dir, config, None)?;
            let stats = services.coordinator.distribution_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::CacheCleanup { max_age_days } => {
            let services = build_services(&cli.data_dir, config, None)?;
            let removed = services.coordinator.cleanup_cache(max_age_days)?;
            println!("removed {} stale artifacts", removed);
        }
    }

    Ok(())
}
