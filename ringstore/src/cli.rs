//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::signal::ctrl_c;
use tracing::{error, info};

use crate::config::{self, Config};
use crate::master::{MasterOption, MasterServer};
use crate::net::messages::{
    CreateClusterRequest, CreateClusterResponse, DeleteClusterRequest, DescRequest, DescResponse,
    OkResponse, ResizeClusterRequest,
};
use crate::net::Stream;
use crate::store::{StoreOption, StoreServer};

/// ringstore is a sharded, replicated key-value store with elastic
/// cluster resizing.
#[derive(Parser, Debug)]
#[command(name = "ringstore", version)]
pub struct Cli {
    /// Path to the configuration file. Default: "ringstore.toml"
    #[arg(short, long, default_value = "ringstore.toml")]
    pub config: PathBuf,
    /// Subcommand.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the master: membership, keyspaces, ring snapshots.
    Master {
        /// Listen address.
        #[arg(long)]
        address: Option<String>,

        /// Data center served by this master.
        #[arg(long)]
        data_center: Option<String>,
    },

    /// Run a store: hosts shards and serves the data plane.
    Store {
        /// Data directory.
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Data-plane listen address.
        #[arg(long)]
        address: Option<String>,

        /// Admin listen address, used by peers and the master.
        #[arg(long)]
        admin_address: Option<String>,

        /// Master to register with.
        #[arg(long)]
        master: Option<String>,

        /// Data center this store lives in.
        #[arg(long)]
        data_center: Option<String>,

        /// Binlog segment size in MB.
        #[arg(long)]
        log_file_size_mb: Option<u32>,

        /// Binlog segments kept before purging.
        #[arg(long)]
        log_file_count: Option<u32>,

        /// Advertised disk capacity in GB.
        #[arg(long)]
        disk_size_gb: Option<u32>,

        /// Tags matched against cluster requirements.
        #[arg(long)]
        tags: Vec<String>,
    },

    /// One-shot administration against the master.
    Admin {
        /// Master address.
        #[arg(long)]
        master: Option<String>,

        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum AdminCommands {
    /// Create a keyspace.
    CreateCluster {
        #[arg(long)]
        keyspace: String,
        #[arg(long)]
        cluster_size: u32,
        #[arg(long, default_value_t = 1)]
        replication_factor: u32,
        #[arg(long, default_value_t = 1)]
        total_disk_size_gb: u32,
        #[arg(long)]
        tags: Vec<String>,
    },

    /// Grow or shrink a keyspace.
    ResizeCluster {
        #[arg(long)]
        keyspace: String,
        #[arg(long)]
        target_cluster_size: u32,
    },

    /// Remove a keyspace everywhere.
    DeleteCluster {
        #[arg(long)]
        keyspace: String,
    },

    /// Describe a keyspace's ring.
    Desc {
        #[arg(long)]
        keyspace: String,
    },
}

/// Run the selected command. Returns the process exit code: 0 on clean
/// shutdown, 1 on fatal dial failure, 2 on unrecoverable local error.
pub async fn run(cli: Cli) -> i32 {
    let mut config = if cli.config.exists() {
        match Config::load(&cli.config) {
            Ok(config) => config,
            Err(err) => {
                error!("{}: {}", cli.config.display(), err);
                return 2;
            }
        }
    } else {
        Config::default()
    };

    match cli.command {
        Commands::Master {
            address,
            data_center,
        } => {
            if let Some(address) = address {
                config.master.address = address;
            }
            if let Some(data_center) = data_center {
                config.general.data_center = data_center;
            }
            config::set(config);

            let master = match MasterServer::start(MasterOption::default()).await {
                Ok(master) => master,
                Err(err) => {
                    error!("master: {}", err);
                    return 2;
                }
            };

            let _ = ctrl_c().await;
            master.shutdown();
            0
        }

        Commands::Store {
            dir,
            address,
            admin_address,
            master,
            data_center,
            log_file_size_mb,
            log_file_count,
            disk_size_gb,
            tags,
        } => {
            if let Some(dir) = dir {
                config.store.dir = dir;
            }
            if let Some(address) = address {
                config.store.address = address;
            }
            if let Some(admin_address) = admin_address {
                config.store.admin_address = admin_address;
            }
            if let Some(master) = master {
                config.store.master = master;
            }
            if let Some(data_center) = data_center {
                config.general.data_center = data_center;
            }
            if let Some(size) = log_file_size_mb {
                config.store.log_file_size_mb = size;
            }
            if let Some(count) = log_file_count {
                config.store.log_file_count = count;
            }
            if let Some(disk) = disk_size_gb {
                config.store.disk_size_gb = disk;
            }
            if !tags.is_empty() {
                config.store.tags = tags;
            }
            config::set(config);

            let store = match StoreServer::start(StoreOption::default()).await {
                Ok(store) => store,
                Err(err) => {
                    error!("store: {}", err);
                    return 2;
                }
            };

            let _ = ctrl_c().await;
            store.shutdown();
            0
        }

        Commands::Admin { master, command } => {
            let address = master.unwrap_or_else(|| config.store.master.clone());
            match admin(&address, command).await {
                Ok(()) => 0,
                Err(err) => {
                    error!("admin: {}", err);
                    1
                }
            }
        }
    }
}

async fn admin(master: &str, command: AdminCommands) -> Result<(), crate::net::Error> {
    let mut stream = Stream::connect(master).await?;

    match command {
        AdminCommands::CreateCluster {
            keyspace,
            cluster_size,
            replication_factor,
            total_disk_size_gb,
            tags,
        } => {
            stream
                .send_flush(&CreateClusterRequest {
                    keyspace,
                    cluster_size,
                    replication_factor,
                    total_disk_size_gb,
                    tags,
                })
                .await?;
            let response: CreateClusterResponse = stream.read_message().await?.parse()?;
            let cluster = response.into_result()?;
            info!("created {}", cluster);
        }

        AdminCommands::ResizeCluster {
            keyspace,
            target_cluster_size,
        } => {
            stream
                .send_flush(&ResizeClusterRequest {
                    keyspace: keyspace.clone(),
                    target_cluster_size,
                    cluster: None,
                })
                .await?;
            stream
                .read_message()
                .await?
                .parse::<OkResponse>()?
                .into_result()?;
            info!("resized {} to {}", keyspace, target_cluster_size);
        }

        AdminCommands::DeleteCluster { keyspace } => {
            stream
                .send_flush(&DeleteClusterRequest {
                    keyspace: keyspace.clone(),
                })
                .await?;
            stream
                .read_message()
                .await?
                .parse::<OkResponse>()?
                .into_result()?;
            info!("deleted {}", keyspace);
        }

        AdminCommands::Desc { keyspace } => {
            stream.send_flush(&DescRequest { keyspace }).await?;
            let response: DescResponse = stream.read_message().await?.parse()?;
            match response.cluster {
                Some(cluster) => {
                    println!("{}", cluster);
                    for node in cluster.nodes() {
                        println!(
                            "  {} @ {} (admin {})",
                            node.shard_info.identifier(),
                            node.store.address,
                            node.store.admin_address
                        );
                    }
                }
                None => println!("keyspace not found"),
            }
        }
    }

    Ok(())
}
