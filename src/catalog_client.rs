//! Client for the catalog server protocol.
//!
//! Unlike storage nodes, the catalog server keeps the connection open, so a
//! [`CatalogClient`] owns one stream for its whole session. The session token is
//! remembered after signup or login and attached to every later request.

use std::collections::BTreeSet;
use std::io;
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::catalog_store::{CatalogEntry, NodeAddress, SongId};
use crate::messages::{CatalogRequest, FailureReason, FieldReader, Reply, RequestError};
use crate::wire_protocol::{self, Opcode, WireError};

/// Errors returned by [`CatalogClient`]
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect: {0}")]
    Connect(#[source] io::Error),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("{operation} rejected: {reason}")]
    Rejected {
        operation: Opcode,
        reason: FailureReason,
    },

    #[error("Unexpected reply to {operation}: {detail}")]
    UnexpectedReply { operation: Opcode, detail: String },

    #[error("Not logged in")]
    NotLoggedIn,
}

impl ClientError {
    /// The server's reason, if the request was refused
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            ClientError::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Result type for catalog client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// What the server hands back when a session opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub token: String,
    pub catalog: Vec<CatalogEntry>,
    /// Only filled on login
    pub liked_songs: BTreeSet<SongId>,
}

/// One connection to the catalog server
pub struct CatalogClient {
    stream: TcpStream,
    token: Option<String>,
}

impl CatalogClient {
    pub async fn connect<A: ToSocketAddrs>(address: A) -> ClientResult<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(ClientError::Connect)?;
        Ok(Self {
            stream,
            token: None,
        })
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Replace the remembered token, e.g. to resume an earlier session
    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    pub async fn signup(&mut self, username: &str, password: &str) -> ClientResult<SessionInfo> {
        let request = CatalogRequest::Signup {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.open_session(request, false).await
    }

    pub async fn login(&mut self, username: &str, password: &str) -> ClientResult<SessionInfo> {
        let request = CatalogRequest::Login {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.open_session(request, true).await
    }

    async fn open_session(&mut self, request: CatalogRequest, with_liked: bool) -> ClientResult<SessionInfo> {
        let operation = request.opcode();
        let mut payload = self.call_ok(request).await?;

        let token = payload.text().map_err(|e| unexpected(operation, e))?;
        let catalog = read_json(&mut payload, operation)?;
        let liked_songs = if with_liked {
            read_json(&mut payload, operation)?
        } else {
            BTreeSet::new()
        };

        self.token = Some(token.clone());
        Ok(SessionInfo {
            token,
            catalog,
            liked_songs,
        })
    }

    /// Node currently serving `song_id`
    pub async fn get_address(&mut self, song_id: SongId) -> ClientResult<NodeAddress> {
        let token = self.require_token()?;
        let mut payload = self
            .call_ok(CatalogRequest::GetAddress { token, song_id })
            .await?;
        read_address(&mut payload, Opcode::GetAddress)
    }

    /// Register a song. Returns its id and the node to upload the bytes to.
    pub async fn add_song(&mut self, name: &str, artist: &str) -> ClientResult<(SongId, NodeAddress)> {
        let token = self.require_token()?;
        let mut payload = self
            .call_ok(CatalogRequest::AddSong {
                token,
                name: name.to_string(),
                artist: artist.to_string(),
            })
            .await?;

        let song_id = payload
            .parse()
            .map_err(|e| unexpected(Opcode::AddSong, e))?;
        let node = read_address(&mut payload, Opcode::AddSong)?;
        Ok((song_id, node))
    }

    pub async fn refresh(&mut self) -> ClientResult<Vec<CatalogEntry>> {
        let token = self.require_token()?;
        let mut payload = self.call_ok(CatalogRequest::Refresh { token }).await?;
        read_json(&mut payload, Opcode::Refresh)
    }

    pub async fn add_to_playlist(
        &mut self,
        username: &str,
        playlist: &str,
        song_id: SongId,
    ) -> ClientResult<()> {
        let token = self.require_token()?;
        self.call_ok(CatalogRequest::AddToPlaylist {
            token,
            username: username.to_string(),
            playlist: playlist.to_string(),
            song_id,
        })
        .await?;
        Ok(())
    }

    pub async fn remove_from_playlist(
        &mut self,
        username: &str,
        playlist: &str,
        song_id: SongId,
    ) -> ClientResult<()> {
        let token = self.require_token()?;
        self.call_ok(CatalogRequest::RemoveFromPlaylist {
            token,
            username: username.to_string(),
            playlist: playlist.to_string(),
            song_id,
        })
        .await?;
        Ok(())
    }

    /// Give up the current session; the connection stays open for a new login
    pub async fn relogin(&mut self) -> ClientResult<()> {
        let token = self.require_token()?;
        self.call_ok(CatalogRequest::Relogin { token }).await?;
        self.token = None;
        Ok(())
    }

    /// Say goodbye and close the connection
    pub async fn exit(mut self) -> ClientResult<()> {
        let token = self.token.take();
        self.call_ok(CatalogRequest::Exit { token }).await?;
        Ok(())
    }

    /// Send any request and return the raw reply
    pub async fn request(&mut self, request: CatalogRequest) -> ClientResult<Reply> {
        let operation = request.opcode();
        let message = request.into_message();
        debug!("Sending: {}", message);
        wire_protocol::write_message(&mut self.stream, &message).await?;

        let message = wire_protocol::try_decode(&mut self.stream).await?;
        debug!("Received: {}", message);
        let reply = Reply::from_message(message).map_err(|e| unexpected(operation, e))?;
        if reply.opcode != operation {
            return Err(ClientError::UnexpectedReply {
                operation,
                detail: format!("reply opcode {}", reply.opcode),
            });
        }
        Ok(reply)
    }

    async fn call_ok(&mut self, request: CatalogRequest) -> ClientResult<FieldReader> {
        let operation = request.opcode();
        let reply = self.request(request).await?;
        reply.into_reader().map_err(|reason| {
            // The server has dropped us back to the login phase
            if reason.is_auth_failure() {
                self.token = None;
            }
            ClientError::Rejected { operation, reason }
        })
    }

    fn require_token(&self) -> ClientResult<String> {
        self.token.clone().ok_or(ClientError::NotLoggedIn)
    }
}

fn unexpected(operation: Opcode, error: RequestError) -> ClientError {
    ClientError::UnexpectedReply {
        operation,
        detail: error.to_string(),
    }
}

fn read_address(payload: &mut FieldReader, operation: Opcode) -> ClientResult<NodeAddress> {
    let host = payload.text().map_err(|e| unexpected(operation, e))?;
    let port = payload.parse().map_err(|e| unexpected(operation, e))?;
    Ok(NodeAddress::new(host, port))
}

fn read_json<T: serde::de::DeserializeOwned>(payload: &mut FieldReader, operation: Opcode) -> ClientResult<T> {
    let bytes = payload.binary().map_err(|e| unexpected(operation, e))?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::UnexpectedReply {
        operation,
        detail: e.to_string(),
    })
}
