//! Library entrypoint for songvault.
//!
//! A catalog server brokers clients to storage nodes that hold song blobs. Each song
//! is tracked in up to two replica slots; a health monitor and a replication
//! reconciler drive every song toward two verified copies.

pub mod auth;
pub mod background;
pub mod blob_store;
pub mod catalog_client;
pub mod catalog_server;
pub mod catalog_store;
pub mod config;
pub mod health_monitor;
pub mod messages;
pub mod node_client;
pub mod reconciler;
pub mod storage_node;
pub mod wire_protocol;

pub use auth::{Clock, ManualClock, SystemClock, TokenIssuer, TokenScope};
pub use catalog_client::{CatalogClient, ClientError, SessionInfo};
pub use catalog_server::{CatalogServer, ReplicationTasks};
pub use catalog_store::{CatalogStore, NodeAddress, NodeHealth, ReplicaState, SlotIndex, Song, SongId};
pub use config::{CatalogServerConfig, ReplicationConfig, StorageNodeConfig};
pub use health_monitor::HealthMonitor;
pub use messages::FailureReason;
pub use node_client::NodeClient;
pub use reconciler::Reconciler;
pub use storage_node::StorageNode;
