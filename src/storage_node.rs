//! Storage Node Module
//!
//! A storage node serves blobs keyed by song id. It accepts one request per
//! connection, answers it (except for `bkg`, which is fire-and-forget) and closes.
//! The node never allocates ids; whatever id arrives is the key.
//!
//! Every operation checks its token first. A bad signature, an expired token and a
//! token minted for a different operation all get the same `unauthorized` reply,
//! `bkg` included. Only an accepted `bkg` goes unanswered.
//!
//! No field may declare more than `max_blob_size` bytes. A larger field is
//! rejected at its length prefix and the connection closed, so an oversized body
//! is never buffered, whatever its token.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthError, TokenIssuer, TokenScope};
use crate::blob_store::{BlobStore, BlobStoreError, BlobStoreStats};
use crate::catalog_store::{NodeAddress, SongId};
use crate::config::{ConfigError, StorageNodeConfig};
use crate::messages::{FailureReason, NodeRequest, Reply, VERIFY_FOUND};
use crate::node_client::NodeClient;
use crate::wire_protocol::{self, Field, Opcode, WireError};

/// Errors that can occur while running a storage node
#[derive(Error, Debug)]
pub enum StorageNodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Blob store error: {0}")]
    BlobStore(#[from] BlobStoreError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
}

/// Result type for storage node operations
pub type StorageNodeResult<T> = Result<T, StorageNodeError>;

/// Floor for the frame limit so tokens and ids always fit
const MIN_FRAME_FIELD_LEN: usize = 4 * 1024;

/// Largest field the node will read off the wire for a given blob ceiling
pub fn frame_field_limit(max_blob_size: u64) -> usize {
    usize::try_from(max_blob_size)
        .unwrap_or(usize::MAX)
        .clamp(MIN_FRAME_FIELD_LEN, wire_protocol::MAX_FIELD_LEN)
}

/// Scopes a token must carry for each operation
pub fn required_scopes(opcode: Opcode) -> &'static [TokenScope] {
    match opcode {
        Opcode::Get | Opcode::Post => &[TokenScope::Session, TokenScope::System],
        Opcode::Verify => &[TokenScope::Verify, TokenScope::System],
        Opcode::Relay => &[TokenScope::RelaySource],
        Opcode::Ingest => &[TokenScope::RelayIngest],
        Opcode::Hello => &[
            TokenScope::Session,
            TokenScope::System,
            TokenScope::Verify,
            TokenScope::RelaySource,
            TokenScope::RelayIngest,
        ],
        _ => &[],
    }
}

struct NodeState {
    node_id: Uuid,
    blobs: BlobStore,
    issuer: TokenIssuer,
    peers: NodeClient,
    max_field_len: usize,
}

/// A bound storage node, ready to serve
pub struct StorageNode {
    listener: TcpListener,
    state: Arc<NodeState>,
}

impl StorageNode {
    /// Validate `config`, open the blob store and bind the listener
    pub async fn bind(config: &StorageNodeConfig) -> StorageNodeResult<Self> {
        config.validate()?;
        let issuer = TokenIssuer::new(&config.signing_secret)?;
        Self::bind_with_issuer(config, issuer).await
    }

    /// Like [`bind`](Self::bind) but with a caller-supplied issuer (for an injected clock)
    pub async fn bind_with_issuer(
        config: &StorageNodeConfig,
        issuer: TokenIssuer,
    ) -> StorageNodeResult<Self> {
        let blobs = BlobStore::new(&config.storage_root, config.max_blob_size)?;
        let listener = TcpListener::bind(config.listen_address.as_str()).await?;

        info!(
            "Storage node {} listening on {} (root {:?})",
            config.node_id,
            listener.local_addr()?,
            config.storage_root
        );

        Ok(Self {
            listener,
            state: Arc::new(NodeState {
                node_id: config.node_id,
                blobs,
                issuer,
                peers: NodeClient::default(),
                max_field_len: frame_field_limit(config.max_blob_size),
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Address peers and the catalog use to reach this node
    pub fn address(&self) -> std::io::Result<NodeAddress> {
        self.local_addr().map(NodeAddress::from)
    }

    pub fn node_id(&self) -> Uuid {
        self.state.node_id
    }

    pub fn stats(&self) -> StorageNodeResult<BlobStoreStats> {
        Ok(self.state.blobs.stats()?)
    }

    pub async fn run_until<F>(self, shutdown: F) -> StorageNodeResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let StorageNode { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("Storage node {} shutting down", state.node_id);
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let state = Arc::clone(&state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, &state).await {
                                    warn!("Connection from {} failed: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> StorageNodeResult<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install ctrl-c handler: {}", e);
            }
        })
        .await
    }
}

async fn handle_connection(mut stream: TcpStream, state: &NodeState) -> StorageNodeResult<()> {
    let message = wire_protocol::decode_with_limit(&mut stream, state.max_field_len).await;
    if let Some(reason) = message.error_reason() {
        debug!("Dropping connection after framing error: {}", reason);
        return Ok(());
    }
    debug!("Received: {}", message);

    let opcode = message.opcode;
    let request = match NodeRequest::from_message(message) {
        Ok(request) => request,
        Err(e) => {
            warn!("Bad {} request: {}", opcode, e);
            return send_reply(&mut stream, Reply::failed(opcode, FailureReason::BadRequest)).await;
        }
    };

    if let Err(e) = state
        .issuer
        .authorize(request.token(), required_scopes(opcode))
    {
        debug!("Rejected {} request: {}", opcode, e);
        return send_reply(&mut stream, Reply::failed(opcode, FailureReason::Unauthorized)).await;
    }

    match request {
        NodeRequest::Relay {
            ingest_token,
            song_id,
            destination,
            ..
        } => {
            // Nothing goes back to the sender; close before the transfer starts.
            drop(stream);
            relay(state, song_id, &destination, &ingest_token).await;
            Ok(())
        }
        other => {
            let reply = serve(state, other).await;
            send_reply(&mut stream, reply).await
        }
    }
}

async fn serve(state: &NodeState, request: NodeRequest) -> Reply {
    let opcode = request.opcode();
    match request {
        NodeRequest::Hello { .. } => Reply::ok(opcode, vec![state.node_id.to_string().into()]),
        NodeRequest::Get { song_id, .. } => match state.blobs.get(song_id).await {
            Ok(data) => Reply::ok(opcode, vec![song_id.0.into(), Field::Binary(data)]),
            Err(e) => Reply::failed(opcode, blob_failure(song_id, &e)),
        },
        NodeRequest::Post { song_id, data, .. } | NodeRequest::Ingest { song_id, data, .. } => {
            match state.blobs.put(song_id, &data).await {
                Ok(()) => {
                    info!("Stored song {} via {} ({} bytes)", song_id, opcode, data.len());
                    Reply::ok(opcode, Vec::new())
                }
                Err(e) => Reply::failed(opcode, blob_failure(song_id, &e)),
            }
        }
        NodeRequest::Verify { song_id, .. } => match state.blobs.contains(song_id).await {
            Ok(true) => Reply::ok(opcode, vec![VERIFY_FOUND.into()]),
            Ok(false) => Reply::failed(opcode, FailureReason::Lost),
            Err(e) => Reply::failed(opcode, blob_failure(song_id, &e)),
        },
        NodeRequest::Relay { .. } => Reply::failed(opcode, FailureReason::BadRequest),
    }
}

fn blob_failure(song_id: SongId, error: &BlobStoreError) -> FailureReason {
    match error {
        BlobStoreError::NotFound { .. } => FailureReason::NotFound,
        BlobStoreError::BlobTooLarge { .. } | BlobStoreError::InvalidSongId { .. } => {
            FailureReason::BadRequest
        }
        other => {
            warn!("Blob operation on song {} failed: {}", song_id, other);
            FailureReason::IoError
        }
    }
}

/// Push a local blob to `destination`. Failures are logged, never returned.
async fn relay(state: &NodeState, song_id: SongId, destination: &NodeAddress, ingest_token: &str) {
    let data = match state.blobs.get(song_id).await {
        Ok(data) => data,
        Err(e) => {
            warn!("Cannot relay song {} to {}: {}", song_id, destination, e);
            return;
        }
    };

    let size = data.len();
    match state
        .peers
        .ingest(destination, ingest_token, song_id, data)
        .await
    {
        Ok(()) => info!("Relayed song {} to {} ({} bytes)", song_id, destination, size),
        Err(e) => warn!("Relay of song {} to {} failed: {}", song_id, destination, e),
    }
}

async fn send_reply(stream: &mut TcpStream, reply: Reply) -> StorageNodeResult<()> {
    let message = reply.into_message();
    debug!("Sending: {}", message);
    wire_protocol::write_message(stream, &message).await?;
    Ok(())
}
