//! Client for the storage node protocol.
//!
//! Every call opens a fresh connection, sends one request and (except for `relay`)
//! reads one reply. Probes (`hello`, `verify`) and the relay instruction are bounded
//! by the probe timeout; bulk transfers (`get`, `put`, `ingest`) are not.

use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::catalog_store::{NodeAddress, SongId};
use crate::messages::{FailureReason, FieldReader, NodeRequest, Reply, RequestError, VERIFY_FOUND};
use crate::wire_protocol::{self, Opcode, WireError};

/// Errors that can occur while talking to a storage node
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: NodeAddress,
        #[source]
        source: io::Error,
    },

    #[error("{operation} to {address} timed out after {after:?}")]
    Timeout {
        operation: Opcode,
        address: NodeAddress,
        after: Duration,
    },

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("{operation} rejected: {reason}")]
    Rejected {
        operation: Opcode,
        reason: FailureReason,
    },

    #[error("Unexpected reply to {operation}: {detail}")]
    UnexpectedReply { operation: Opcode, detail: String },
}

/// Probe bound used when none is configured
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Result type for node client operations
pub type TransferResult<T> = Result<T, TransferError>;

/// Stateless storage node client
#[derive(Debug, Clone, Copy)]
pub struct NodeClient {
    probe_timeout: Duration,
}

impl Default for NodeClient {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl NodeClient {
    pub fn new(probe_timeout: Duration) -> Self {
        Self { probe_timeout }
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Liveness probe. Returns the node's id.
    pub async fn hello(&self, address: &NodeAddress, token: &str) -> TransferResult<String> {
        let request = NodeRequest::Hello {
            token: token.to_string(),
        };
        let reply = self.bounded(address, Opcode::Hello, self.exchange(address, request)).await?;
        let mut payload = expect_ok(reply)?;
        payload.text().map_err(|e| TransferError::UnexpectedReply {
            operation: Opcode::Hello,
            detail: e.to_string(),
        })
    }

    /// Replica existence probe: `true` for found, `false` for lost
    pub async fn verify(
        &self,
        address: &NodeAddress,
        token: &str,
        song_id: SongId,
    ) -> TransferResult<bool> {
        let request = NodeRequest::Verify {
            token: token.to_string(),
            song_id,
        };
        let reply = self
            .bounded(address, Opcode::Verify, self.exchange(address, request))
            .await?;

        match reply.outcome {
            Ok(fields) if fields.first().and_then(|f| f.as_text()) == Some(VERIFY_FOUND) => Ok(true),
            Ok(fields) => Err(TransferError::UnexpectedReply {
                operation: Opcode::Verify,
                detail: format!("{} payload fields without {:?}", fields.len(), VERIFY_FOUND),
            }),
            Err(FailureReason::Lost) => Ok(false),
            Err(reason) => Err(TransferError::Rejected {
                operation: Opcode::Verify,
                reason,
            }),
        }
    }

    pub async fn get(
        &self,
        address: &NodeAddress,
        token: &str,
        song_id: SongId,
    ) -> TransferResult<Vec<u8>> {
        let request = NodeRequest::Get {
            token: token.to_string(),
            song_id,
        };
        let reply = self.exchange(address, request).await?;
        let mut payload = expect_ok(reply)?;

        let unexpected = |e: RequestError| TransferError::UnexpectedReply {
            operation: Opcode::Get,
            detail: e.to_string(),
        };
        let returned: SongId = payload.parse().map_err(unexpected)?;
        if returned != song_id {
            return Err(TransferError::UnexpectedReply {
                operation: Opcode::Get,
                detail: format!("asked for {}, got {}", song_id, returned),
            });
        }
        payload.binary().map_err(unexpected)
    }

    pub async fn put(
        &self,
        address: &NodeAddress,
        token: &str,
        song_id: SongId,
        data: Vec<u8>,
    ) -> TransferResult<()> {
        let request = NodeRequest::Post {
            token: token.to_string(),
            song_id,
            data,
        };
        expect_ok(self.exchange(address, request).await?)?;
        Ok(())
    }

    /// Peer-to-peer push used by a relaying node
    pub async fn ingest(
        &self,
        address: &NodeAddress,
        token: &str,
        song_id: SongId,
        data: Vec<u8>,
    ) -> TransferResult<()> {
        let request = NodeRequest::Ingest {
            token: token.to_string(),
            song_id,
            data,
        };
        expect_ok(self.exchange(address, request).await?)?;
        Ok(())
    }

    /// Tell `source` to copy `song_id` to `destination`. Does not wait for the copy.
    pub async fn relay(
        &self,
        source: &NodeAddress,
        token: &str,
        ingest_token: &str,
        song_id: SongId,
        destination: &NodeAddress,
    ) -> TransferResult<()> {
        let request = NodeRequest::Relay {
            token: token.to_string(),
            ingest_token: ingest_token.to_string(),
            song_id,
            destination: destination.clone(),
        };
        self.bounded(source, Opcode::Relay, async {
            let mut stream = connect(source).await?;
            send(&mut stream, request).await
        })
        .await
    }

    async fn bounded<T, F>(&self, address: &NodeAddress, operation: Opcode, fut: F) -> TransferResult<T>
    where
        F: Future<Output = TransferResult<T>>,
    {
        match tokio::time::timeout(self.probe_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout {
                operation,
                address: address.clone(),
                after: self.probe_timeout,
            }),
        }
    }

    async fn exchange(&self, address: &NodeAddress, request: NodeRequest) -> TransferResult<Reply> {
        let operation = request.opcode();
        let mut stream = connect(address).await?;
        send(&mut stream, request).await?;

        let message = wire_protocol::try_decode(&mut stream).await?;
        debug!("Received from {}: {}", address, message);

        let reply = Reply::from_message(message).map_err(|e| TransferError::UnexpectedReply {
            operation,
            detail: e.to_string(),
        })?;
        if reply.opcode != operation {
            return Err(TransferError::UnexpectedReply {
                operation,
                detail: format!("reply opcode {}", reply.opcode),
            });
        }
        Ok(reply)
    }
}

async fn connect(address: &NodeAddress) -> TransferResult<TcpStream> {
    TcpStream::connect((address.host.as_str(), address.port))
        .await
        .map_err(|source| TransferError::Connect {
            address: address.clone(),
            source,
        })
}

async fn send(stream: &mut TcpStream, request: NodeRequest) -> TransferResult<()> {
    let message = request.into_message();
    debug!("Sending: {}", message);
    wire_protocol::write_message(stream, &message).await?;
    Ok(())
}

fn expect_ok(reply: Reply) -> TransferResult<FieldReader> {
    let operation = reply.opcode;
    reply
        .into_reader()
        .map_err(|reason| TransferError::Rejected { operation, reason })
}
