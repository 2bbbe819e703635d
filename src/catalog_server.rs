//! Catalog Server Module
//!
//! The main server clients talk to. Each connection is a small state machine:
//!
//! - **Unauthenticated**: only `sig`, `log` and `ext` are accepted. A successful
//!   signup or login returns a session token plus a catalog snapshot and moves the
//!   connection to the authenticated phase.
//! - **Authenticated**: every request carries a token, checked on every request.
//!   A token that fails the check gets a failure reply and drops the connection
//!   back to the unauthenticated phase; the socket stays open so the client can
//!   log in again.
//!
//! The server keeps no session table. The token is the whole credential.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, TokenIssuer, TokenScope};
use crate::background::BackgroundHandle;
use crate::catalog_store::{CatalogError, CatalogStore, LIKED_SONGS_PLAYLIST};
use crate::config::{CatalogServerConfig, ConfigError, ReplicationConfig};
use crate::health_monitor::HealthMonitor;
use crate::messages::{CatalogRequest, FailureReason, Reply};
use crate::reconciler::Reconciler;
use crate::wire_protocol::{self, Field, Opcode, WireError};

/// Errors that can occur while running the catalog server
#[derive(Error, Debug)]
pub enum CatalogServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Request task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type for catalog server operations
pub type CatalogServerResult<T> = Result<T, CatalogServerError>;

/// Largest field a client request may carry. Requests are short text only.
pub const MAX_REQUEST_FIELD_LEN: usize = 64 * 1024;

struct ServerState {
    store: Arc<CatalogStore>,
    issuer: TokenIssuer,
    session_ttl: Duration,
}

/// Where a connection is in the login flow
#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Unauthenticated,
    Authenticated { username: String },
}

/// What the connection loop does after a reply
enum Next {
    Stay,
    Enter(Phase),
    Close,
}

/// The health monitor and reconciler loops started next to a server
pub struct ReplicationTasks {
    pub health_monitor: BackgroundHandle,
    pub reconciler: BackgroundHandle,
}

impl ReplicationTasks {
    pub async fn stop(self) {
        self.health_monitor.stop().await;
        self.reconciler.stop().await;
    }
}

/// A bound catalog server, ready to serve
pub struct CatalogServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl CatalogServer {
    /// Validate `config`, open the catalog, register the configured nodes and bind
    pub async fn bind(config: &CatalogServerConfig) -> CatalogServerResult<Self> {
        config.validate()?;

        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Arc::new(CatalogStore::new(&config.database_path)?);
        let added = store.bootstrap_nodes(&config.nodes)?;
        info!(
            "Catalog opened at {:?}: {} nodes configured, {} newly registered",
            config.database_path,
            config.nodes.len(),
            added
        );

        let issuer = TokenIssuer::new(&config.signing_secret)?;
        Self::bind_with(store, issuer, &config.listen_address, config.session_ttl).await
    }

    /// Bind around an existing store and issuer
    pub async fn bind_with(
        store: Arc<CatalogStore>,
        issuer: TokenIssuer,
        listen_address: &str,
        session_ttl: Duration,
    ) -> CatalogServerResult<Self> {
        let listener = TcpListener::bind(listen_address).await?;
        info!("Catalog server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                store,
                issuer,
                session_ttl,
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> Arc<CatalogStore> {
        Arc::clone(&self.state.store)
    }

    /// Start the health monitor and the reconciler against this server's catalog
    pub fn spawn_replication(&self, config: &ReplicationConfig) -> CatalogServerResult<ReplicationTasks> {
        let monitor = HealthMonitor::new(self.store(), &self.state.issuer, config.probe_timeout)?;
        let reconciler = Reconciler::new(self.store(), self.state.issuer.clone(), config);

        Ok(ReplicationTasks {
            health_monitor: Arc::new(monitor).spawn(config.health_interval),
            reconciler: Arc::new(reconciler).spawn(config.reconcile_interval),
        })
    }

    pub async fn run_until<F>(self, shutdown: F) -> CatalogServerResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let CatalogServer { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("Catalog server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("Accepted client {}", peer);
                            let state = Arc::clone(&state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, state).await {
                                    warn!("Client {} failed: {}", peer, e);
                                }
                                debug!("Client {} disconnected", peer);
                            });
                        }
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> CatalogServerResult<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install ctrl-c handler: {}", e);
            }
        })
        .await
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<ServerState>) -> CatalogServerResult<()> {
    let mut phase = Phase::Unauthenticated;

    loop {
        let message = wire_protocol::decode_with_limit(&mut stream, MAX_REQUEST_FIELD_LEN).await;
        if let Some(reason) = message.error_reason() {
            debug!("Closing connection: {}", reason);
            return Ok(());
        }
        debug!("Received: {}", message);

        let opcode = message.opcode;
        let request = match CatalogRequest::from_message(message) {
            Ok(request) => request,
            Err(e) => {
                warn!("Bad {} request: {}", opcode, e);
                send_reply(&mut stream, Reply::failed(opcode, FailureReason::BadRequest)).await?;
                continue;
            }
        };

        let (reply, next) = dispatch(Arc::clone(&state), phase.clone(), request).await?;
        send_reply(&mut stream, reply).await?;

        match next {
            Next::Stay => {}
            Next::Enter(new_phase) => phase = new_phase,
            Next::Close => return Ok(()),
        }
    }
}

/// Handle one request on the blocking pool; every handler talks to SQLite
async fn dispatch(
    state: Arc<ServerState>,
    phase: Phase,
    request: CatalogRequest,
) -> CatalogServerResult<(Reply, Next)> {
    let handled = tokio::task::spawn_blocking(move || match &phase {
        Phase::Unauthenticated => unauthenticated(&state, request),
        Phase::Authenticated { username } => authenticated(&state, username, request),
    })
    .await?;
    Ok(handled)
}

fn unauthenticated(state: &ServerState, request: CatalogRequest) -> (Reply, Next) {
    let opcode = request.opcode();
    match request {
        CatalogRequest::Signup { username, password } => {
            let outcome = state
                .store
                .add_user(&username, &password)
                .map_err(|e| catalog_failure(&e))
                .and_then(|()| open_session(state, &username, false));
            enter_on_success(opcode, outcome, username)
        }
        CatalogRequest::Login { username, password } => {
            let outcome = state
                .store
                .verify_user(&username, &password)
                .map_err(|e| catalog_failure(&e))
                .and_then(|()| open_session(state, &username, true));
            enter_on_success(opcode, outcome, username)
        }
        CatalogRequest::Exit { .. } => (Reply::ok(opcode, Vec::new()), Next::Close),
        _ => (
            Reply::failed(opcode, FailureReason::NotAuthenticated),
            Next::Stay,
        ),
    }
}

fn enter_on_success(
    opcode: Opcode,
    outcome: Result<Vec<Field>, FailureReason>,
    username: String,
) -> (Reply, Next) {
    match outcome {
        Ok(fields) => {
            info!("{} signed in via {}", username, opcode);
            (
                Reply::ok(opcode, fields),
                Next::Enter(Phase::Authenticated { username }),
            )
        }
        Err(reason) => {
            debug!("{} for {} refused: {}", opcode, username, reason);
            (Reply::failed(opcode, reason), Next::Stay)
        }
    }
}

/// Token and catalog snapshot, plus liked songs on login
fn open_session(
    state: &ServerState,
    username: &str,
    include_liked: bool,
) -> Result<Vec<Field>, FailureReason> {
    let token = state
        .issuer
        .issue(username, TokenScope::Session, state.session_ttl)
        .map_err(|e| {
            error!("Cannot issue session token for {}: {}", username, e);
            FailureReason::Internal
        })?;

    let mut fields = vec![Field::from(token), Field::Binary(catalog_json(state)?)];
    if include_liked {
        let liked = state
            .store
            .get_user_playlist(username, LIKED_SONGS_PLAYLIST)
            .map_err(|e| catalog_failure(&e))?;
        let liked: Vec<_> = liked.into_iter().collect();
        fields.push(Field::Binary(to_json(&liked)?));
    }
    Ok(fields)
}

fn authenticated(state: &ServerState, username: &str, request: CatalogRequest) -> (Reply, Next) {
    let opcode = request.opcode();

    let token = match &request {
        CatalogRequest::Exit { .. } => return (Reply::ok(opcode, Vec::new()), Next::Close),
        CatalogRequest::Signup { .. } | CatalogRequest::Login { .. } => {
            return (Reply::failed(opcode, FailureReason::BadRequest), Next::Stay)
        }
        other => other.token().unwrap_or_default(),
    };

    let claims = match state.issuer.authorize(token, &[TokenScope::Session]) {
        Ok(claims) => claims,
        Err(e) => {
            info!("Session of {} rejected ({}), back to login", username, e);
            return (
                Reply::failed(opcode, e.failure_reason()),
                Next::Enter(Phase::Unauthenticated),
            );
        }
    };

    let outcome = match request {
        CatalogRequest::GetAddress { song_id, .. } => state
            .store
            .get_address(song_id)
            .map(|node| vec![node.host.into(), node.port.into()])
            .map_err(|e| catalog_failure(&e)),
        CatalogRequest::AddSong { name, artist, .. } => state
            .store
            .add_song(&name, &artist)
            .map(|(song_id, node)| {
                info!("{} added song {} ({} by {}) on {}", claims.subject, song_id, name, artist, node);
                vec![song_id.0.into(), node.host.into(), node.port.into()]
            })
            .map_err(|e| catalog_failure(&e)),
        CatalogRequest::Refresh { .. } => catalog_json(state).map(|json| vec![Field::Binary(json)]),
        CatalogRequest::AddToPlaylist {
            username: target,
            playlist,
            song_id,
            ..
        } => check_owner(&claims.subject, &target).and_then(|()| {
            state
                .store
                .add_to_playlist(&target, &playlist, song_id)
                .map(|()| Vec::new())
                .map_err(|e| catalog_failure(&e))
        }),
        CatalogRequest::RemoveFromPlaylist {
            username: target,
            playlist,
            song_id,
            ..
        } => check_owner(&claims.subject, &target).and_then(|()| {
            state
                .store
                .remove_from_playlist(&target, &playlist, song_id)
                .map(|()| Vec::new())
                .map_err(|e| catalog_failure(&e))
        }),
        CatalogRequest::Relogin { .. } => {
            debug!("{} asked to log in again", claims.subject);
            return (Reply::ok(opcode, Vec::new()), Next::Enter(Phase::Unauthenticated));
        }
        CatalogRequest::Signup { .. } | CatalogRequest::Login { .. } | CatalogRequest::Exit { .. } => {
            Err(FailureReason::BadRequest)
        }
    };

    let reply = match outcome {
        Ok(fields) => Reply::ok(opcode, fields),
        Err(reason) => Reply::failed(opcode, reason),
    };
    (reply, Next::Stay)
}

/// Playlists may only be edited by their owner
fn check_owner(subject: &str, username: &str) -> Result<(), FailureReason> {
    if subject != username {
        warn!("{} tried to edit playlists of {}", subject, username);
        return Err(FailureReason::Forbidden);
    }
    Ok(())
}

fn catalog_json(state: &ServerState) -> Result<Vec<u8>, FailureReason> {
    let snapshot = state
        .store
        .catalog_snapshot()
        .map_err(|e| catalog_failure(&e))?;
    to_json(&snapshot)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, FailureReason> {
    serde_json::to_vec(value).map_err(|e| {
        error!("Cannot serialize reply payload: {}", e);
        FailureReason::Internal
    })
}

fn catalog_failure(error: &CatalogError) -> FailureReason {
    let reason = FailureReason::from(error);
    if reason == FailureReason::Internal {
        error!("Catalog operation failed: {}", error);
    }
    reason
}

async fn send_reply(stream: &mut TcpStream, reply: Reply) -> CatalogServerResult<()> {
    let message = reply.into_message();
    debug!("Sending: {}", message);
    wire_protocol::write_message(stream, &message).await?;
    Ok(())
}
