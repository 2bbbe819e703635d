use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use songvault::auth::{TokenIssuer, TokenScope, SYSTEM_SUBJECT};
use songvault::blob_store::BlobStore;
use songvault::{
    CatalogClient, CatalogServer, CatalogServerConfig, CatalogStore, NodeClient, SongId,
    StorageNode, StorageNodeConfig,
};

#[derive(Parser)]
#[command(name = "songvault")]
#[command(about = "A replicated song catalog with self-healing storage nodes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the catalog server with its health monitor and reconciler
    CatalogServer {
        /// Configuration file path
        #[arg(short, long, default_value = "config/catalog_server.yaml")]
        config: String,
    },
    /// Run a storage node
    StorageNode {
        /// Configuration file path
        #[arg(short, long, default_value = "config/storage_node.yaml")]
        config: String,
    },
    /// Print catalog statistics and the node registry
    CatalogStats {
        /// Configuration file path
        #[arg(short, long, default_value = "config/catalog_server.yaml")]
        config: String,
    },
    /// Print blob statistics for a storage node
    NodeStats {
        /// Configuration file path
        #[arg(short, long, default_value = "config/storage_node.yaml")]
        config: String,
    },
    /// Register a song and upload its bytes
    Upload {
        /// Catalog server address
        #[arg(short, long, default_value = "127.0.0.1:8500")]
        server: String,
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
        /// Create the account first
        #[arg(long)]
        signup: bool,
        /// Song name
        #[arg(short, long)]
        name: String,
        /// Song artist
        #[arg(short, long)]
        artist: String,
        /// File to upload
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Download a song
    Fetch {
        /// Catalog server address
        #[arg(short, long, default_value = "127.0.0.1:8500")]
        server: String,
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
        /// Song id
        #[arg(long)]
        song_id: i64,
        /// Where to write the bytes
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Probe every configured storage node once
    HealthCheck {
        /// Configuration file path
        #[arg(short, long, default_value = "config/catalog_server.yaml")]
        config: String,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CatalogServer { config } => {
            info!("Starting songvault catalog server with config: {}", config);
            let server_config = load_or_create(
                &config,
                |p| CatalogServerConfig::from_file(p),
                |c, p| c.save_to_file(p),
            )?;

            let server = CatalogServer::bind(&server_config).await?;
            let tasks = server.spawn_replication(&server_config.replication)?;

            info!("Catalog server running. Press Ctrl+C to stop.");
            server.run_until_ctrl_c().await?;
            tasks.stop().await;
            info!("Catalog server stopped");

            Ok(())
        }
        Commands::StorageNode { config } => {
            info!("Starting songvault storage node with config: {}", config);
            let node_config = load_or_create(
                &config,
                |p| StorageNodeConfig::from_file(p),
                |c, p| c.save_to_file(p),
            )?;

            let node = StorageNode::bind(&node_config).await?;
            let stats = node.stats()?;
            info!("Node ID: {}", node.node_id());
            info!(
                "Current stats: {} blobs, {}",
                stats.blob_count,
                format_bytes(stats.total_size)
            );

            info!("Storage node running. Press Ctrl+C to stop.");
            node.run_until_ctrl_c().await?;
            info!("Storage node stopped");

            Ok(())
        }
        Commands::CatalogStats { config } => {
            let server_config = CatalogServerConfig::from_file(&config)?;
            let store = CatalogStore::new(&server_config.database_path)?;
            let stats = store.get_stats()?;

            println!("Catalog Statistics:");
            println!("  Songs: {}", stats.song_count);
            println!("  Users: {}", stats.user_count);
            println!("  Playlist entries: {}", stats.playlist_entry_count);
            println!(
                "  Replicas: {} verified, {} pending",
                stats.replicas_verified, stats.replicas_pending
            );
            println!(
                "  Nodes: {} active, {} fallen, {} pending",
                stats.nodes_active, stats.nodes_fallen, stats.nodes_pending
            );

            let nodes = store.list_nodes()?;
            if !nodes.is_empty() {
                println!();
                println!("{:<30} {:<10}", "Node", "Health");
                println!("{}", "-".repeat(40));
                for node in nodes {
                    println!("{:<30} {:<10}", node.address.to_string(), node.health.as_str());
                }
            }

            Ok(())
        }
        Commands::NodeStats { config } => {
            let node_config = StorageNodeConfig::from_file(&config)?;
            let blobs = BlobStore::new(&node_config.storage_root, node_config.max_blob_size)?;
            let stats = blobs.stats()?;

            println!("Storage Node Statistics:");
            println!("  Node ID: {}", node_config.node_id);
            println!("  Storage root: {:?}", node_config.storage_root);
            println!("  Blobs: {}", stats.blob_count);
            println!("  Total size: {}", format_bytes(stats.total_size));
            println!("  Buckets in use: {}", stats.bucket_count);

            Ok(())
        }
        Commands::Upload {
            server,
            username,
            password,
            signup,
            name,
            artist,
            file,
        } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {:?}", file))?;

            let mut client = CatalogClient::connect(server.as_str()).await?;
            let session = if signup {
                client.signup(&username, &password).await?
            } else {
                client.login(&username, &password).await?
            };

            let (song_id, node) = client.add_song(&name, &artist).await?;
            info!("Uploading {} to {}", format_bytes(data.len() as u64), node);
            NodeClient::default()
                .put(&node, &session.token, song_id, data)
                .await?;
            client.exit().await?;

            println!("Song uploaded successfully!");
            println!("Song ID: {}", song_id);
            println!("Stored on: {}", node);

            Ok(())
        }
        Commands::Fetch {
            server,
            username,
            password,
            song_id,
            output,
        } => {
            let song_id = SongId(song_id);
            let mut client = CatalogClient::connect(server.as_str()).await?;
            let session = client.login(&username, &password).await?;

            let node = client.get_address(song_id).await?;
            let data = NodeClient::default()
                .get(&node, &session.token, song_id)
                .await?;
            client.exit().await?;

            tokio::fs::write(&output, &data)
                .await
                .with_context(|| format!("writing {:?}", output))?;

            println!("Song fetched successfully!");
            println!("Source: {}", node);
            println!("Output file: {:?} ({})", output, format_bytes(data.len() as u64));

            Ok(())
        }
        Commands::HealthCheck { config } => {
            let server_config = CatalogServerConfig::from_file(&config)?;
            let issuer = TokenIssuer::new(&server_config.signing_secret)?;
            let token = issuer.issue_unbounded(SYSTEM_SUBJECT, TokenScope::System)?;
            let client = NodeClient::new(server_config.replication.probe_timeout);

            let mut fallen = 0;
            for node in &server_config.nodes {
                match client.hello(node, &token).await {
                    Ok(node_id) => println!("{:<30} active ({})", node.to_string(), node_id),
                    Err(e) => {
                        fallen += 1;
                        println!("{:<30} fallen ({})", node.to_string(), e);
                    }
                }
            }

            if fallen > 0 {
                anyhow::bail!("{} of {} nodes unreachable", fallen, server_config.nodes.len());
            }
            println!("OK");
            Ok(())
        }
        Commands::Version => {
            println!("songvault v{}", env!("CARGO_PKG_VERSION"));
            println!("A replicated song catalog with self-healing storage nodes");
            Ok(())
        }
    }
}

/// Load a config file, writing the defaults there first if it is missing
fn load_or_create<T, L, S>(path: &str, load: L, save: S) -> anyhow::Result<T>
where
    T: Default,
    L: FnOnce(&str) -> songvault::config::ConfigResult<T>,
    S: FnOnce(&T, &str) -> songvault::config::ConfigResult<()>,
{
    if Path::new(path).exists() {
        return Ok(load(path)?);
    }

    warn!("Configuration file not found, creating default configuration");
    let config = T::default();
    save(&config, path)?;
    info!("Default configuration saved to: {}", path);
    Ok(config)
}

/// Format bytes in a human-readable format
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["songvault", "catalog-server", "--config", "c.yaml"]);
        assert!(matches!(
            cli.map(|c| c.command),
            Ok(Commands::CatalogServer { config }) if config == "c.yaml"
        ));

        let cli = Cli::try_parse_from([
            "songvault", "fetch", "-u", "alice", "-p", "pw1", "--song-id", "3", "-o", "out.mp3",
        ]);
        assert!(matches!(
            cli.map(|c| c.command),
            Ok(Commands::Fetch { song_id: 3, .. })
        ));

        assert!(Cli::try_parse_from(["songvault", "fetch", "-u", "alice"]).is_err());
    }

    #[test]
    fn test_version_command() {
        let cli = Cli::try_parse_from(["songvault", "version"]);
        assert!(matches!(cli.map(|c| c.command), Ok(Commands::Version)));
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config").join("node.yaml");
        let path = path.to_str().unwrap();

        let created = load_or_create(path, |p| StorageNodeConfig::from_file(p), |c, p| c.save_to_file(p)).unwrap();
        assert!(Path::new(path).exists());

        let loaded = load_or_create(path, |p| StorageNodeConfig::from_file(p), |c, p| c.save_to_file(p)).unwrap();
        assert_eq!(loaded.node_id, created.node_id);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.0 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.0 GB");
    }
}
