//! Catalog Store Module
//!
//! SQLite-backed catalog for songvault: songs and their two replica slots, users,
//! playlists and the storage node registry.
//!
//! Every method takes the connection lock for a single statement or read and
//! releases it before returning. `add_song` and `add_user` are therefore a
//! check followed by a separate insert; two concurrent callers can both pass the
//! check. Callers that need first-writer-wins must serialize themselves.
//!
//! All methods block on SQLite. Async callers go through [`CatalogStore::run_blocking`].

use rand::seq::SliceRandom;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

/// Current database schema version
const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Reserved playlist returned to users on login
pub const LIKED_SONGS_PLAYLIST: &str = "liked_song";

/// Song identifier. The catalog is the only authority that allocates these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SongId(pub i64);

impl fmt::Display for SongId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SongId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(SongId)
    }
}

/// Host and port of a storage node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| CatalogError::InvalidMetadata {
            reason: format!("node address {:?} is not host:port", s),
        })?;
        if host.is_empty() {
            return Err(CatalogError::InvalidMetadata {
                reason: format!("node address {:?} has an empty host", s),
            });
        }
        let port = port.parse().map_err(|_| CatalogError::InvalidMetadata {
            reason: format!("node address {:?} has an invalid port", s),
        })?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = CatalogError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeAddress> for String {
    fn from(value: NodeAddress) -> Self {
        value.to_string()
    }
}

impl From<std::net::SocketAddr> for NodeAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Lifecycle of a single replica slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    Empty,
    Pending,
    Verified,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaState::Empty => "empty",
            ReplicaState::Pending => "pending",
            ReplicaState::Verified => "verified",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "empty" => Some(ReplicaState::Empty),
            "pending" => Some(ReplicaState::Pending),
            "verified" => Some(ReplicaState::Verified),
            _ => None,
        }
    }
}

/// Health of a storage node as last observed by the health monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Pending,
    Active,
    Fallen,
}

impl NodeHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeHealth::Pending => "pending",
            NodeHealth::Active => "active",
            NodeHealth::Fallen => "fallen",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NodeHealth::Pending),
            "active" => Some(NodeHealth::Active),
            "fallen" => Some(NodeHealth::Fallen),
            _ => None,
        }
    }
}

/// Which of a song's two replica slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotIndex {
    First,
    Second,
}

impl SlotIndex {
    pub const ALL: [SlotIndex; 2] = [SlotIndex::First, SlotIndex::Second];

    pub fn other(&self) -> SlotIndex {
        match self {
            SlotIndex::First => SlotIndex::Second,
            SlotIndex::Second => SlotIndex::First,
        }
    }

    fn position(&self) -> usize {
        match self {
            SlotIndex::First => 0,
            SlotIndex::Second => 1,
        }
    }

    /// Column prefix in the songs table
    fn column(&self) -> &'static str {
        match self {
            SlotIndex::First => "slot1",
            SlotIndex::Second => "slot2",
        }
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// One tracked replica placement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSlot {
    pub node: Option<NodeAddress>,
    pub state: ReplicaState,
}

impl ReplicaSlot {
    pub fn empty() -> Self {
        Self {
            node: None,
            state: ReplicaState::Empty,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state == ReplicaState::Empty
    }
}

/// A song and its replica slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Song {
    pub id: SongId,
    pub name: String,
    pub artist: String,
    pub slots: [ReplicaSlot; 2],
    pub created_at: SystemTime,
}

impl Song {
    pub fn slot(&self, index: SlotIndex) -> &ReplicaSlot {
        &self.slots[index.position()]
    }

    /// Number of non-empty slots (0..=2)
    pub fn replica_count(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.is_empty()).count()
    }

    /// Slot index and node of the single verified replica, when the other slot is empty
    pub fn backup_candidate(&self) -> Option<(SlotIndex, &NodeAddress)> {
        SlotIndex::ALL.into_iter().find_map(|index| {
            let slot = self.slot(index);
            let other = self.slot(index.other());
            match (&slot.node, slot.state) {
                (Some(node), ReplicaState::Verified) if other.is_empty() => Some((index, node)),
                _ => None,
            }
        })
    }
}

/// Public view of a song sent to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: SongId,
    pub name: String,
    pub artist: String,
}

/// A registered storage node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub address: NodeAddress,
    pub health: NodeHealth,
    pub last_checked: Option<SystemTime>,
}

/// A stored account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: i64,
    pub username: String,
    pub password: String,
    pub created_at: SystemTime,
}

/// Errors that can occur during catalog operations
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Catalog lock poisoned")]
    LockPoisoned,

    #[error("Catalog task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Song not found: {song_id}")]
    SongNotFound { song_id: SongId },

    #[error("Song {song_id} has no verified replica on an active node")]
    SongUnavailable { song_id: SongId },

    #[error("Song {name:?} by {artist:?} already exists")]
    SongExists { name: String, artist: String },

    #[error("User {username:?} already exists")]
    UserExists { username: String },

    #[error("Unknown username: {username:?}")]
    UnknownUsername { username: String },

    #[error("Wrong password for {username:?}")]
    WrongPassword { username: String },

    #[error("Unknown user: {username:?}")]
    UnknownUser { username: String },

    #[error("Song {song_id} is already in playlist {playlist:?}")]
    AlreadyInPlaylist { playlist: String, song_id: SongId },

    #[error("Song {song_id} is not in playlist {playlist:?}")]
    NotInPlaylist { playlist: String, song_id: SongId },

    #[error("No active storage nodes")]
    NoActiveNodes,

    #[error("Node not registered: {address}")]
    NodeNotRegistered { address: NodeAddress },

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },

    #[error("Invalid metadata: {reason}")]
    InvalidMetadata { reason: String },
}

/// Result type for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Catalog statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub song_count: u64,
    pub user_count: u64,
    pub playlist_entry_count: u64,
    pub nodes_pending: u64,
    pub nodes_active: u64,
    pub nodes_fallen: u64,
    pub replicas_pending: u64,
    pub replicas_verified: u64,
}

fn system_time_to_timestamp(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn timestamp_to_system_time(timestamp: i64) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_secs(timestamp.max(0) as u64)
}

fn invalid_column(index: usize, name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(index, name.to_string(), rusqlite::types::Type::Text)
}

fn parse_slot(row: &Row, index: SlotIndex) -> SqliteResult<ReplicaSlot> {
    let prefix = index.column();
    let state_column = format!("{}_state", prefix);
    let state_text: String = row.get(state_column.as_str())?;
    let state = ReplicaState::parse(&state_text).ok_or_else(|| invalid_column(0, &state_column))?;

    let host: Option<String> = row.get(format!("{}_host", prefix).as_str())?;
    let port: Option<i64> = row.get(format!("{}_port", prefix).as_str())?;
    let node = match (host, port) {
        (Some(host), Some(port)) => Some(NodeAddress::new(
            host,
            u16::try_from(port).map_err(|_| invalid_column(0, &format!("{}_port", prefix)))?,
        )),
        _ => None,
    };

    Ok(ReplicaSlot { node, state })
}

fn parse_song(row: &Row) -> SqliteResult<Song> {
    Ok(Song {
        id: SongId(row.get("song_id")?),
        name: row.get("name")?,
        artist: row.get("artist")?,
        slots: [
            parse_slot(row, SlotIndex::First)?,
            parse_slot(row, SlotIndex::Second)?,
        ],
        created_at: timestamp_to_system_time(row.get("created_at")?),
    })
}

fn parse_node(row: &Row) -> SqliteResult<NodeRecord> {
    let health_text: String = row.get("health")?;
    let port: i64 = row.get("port")?;
    Ok(NodeRecord {
        address: NodeAddress::new(
            row.get::<_, String>("host")?,
            u16::try_from(port).map_err(|_| invalid_column(1, "port"))?,
        ),
        health: NodeHealth::parse(&health_text).ok_or_else(|| invalid_column(2, "health"))?,
        last_checked: row
            .get::<_, Option<i64>>("last_checked")?
            .map(timestamp_to_system_time),
    })
}

fn parse_user(row: &Row) -> SqliteResult<UserRecord> {
    Ok(UserRecord {
        user_id: row.get("user_id")?,
        username: row.get("username")?,
        password: row.get("password")?,
        created_at: timestamp_to_system_time(row.get("created_at")?),
    })
}

const SONG_COLUMNS: &str = "song_id, name, artist, slot1_host, slot1_port, slot1_state, \
                            slot2_host, slot2_port, slot2_state, created_at";

/// Catalog store backed by a single SQLite connection
pub struct CatalogStore {
    conn: Mutex<Connection>,
}

impl fmt::Debug for CatalogStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogStore").finish_non_exhaustive()
    }
}

impl CatalogStore {
    /// Create or open a catalog at the specified path
    pub fn new<P: AsRef<Path>>(db_path: P) -> CatalogResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// Open a throwaway in-memory catalog
    pub fn open_in_memory() -> CatalogResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> CatalogResult<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Run `op` on tokio's blocking pool. Each call is its own lock acquisition,
    /// exactly as if `op` had been called directly.
    pub async fn run_blocking<T, F>(self: &Arc<Self>, op: F) -> CatalogResult<T>
    where
        F: FnOnce(&CatalogStore) -> CatalogResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&store)).await?
    }

    fn conn(&self) -> CatalogResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CatalogError::LockPoisoned)
    }

    fn initialize_schema(&self) -> CatalogResult<()> {
        let conn = self.conn()?;

        // No UNIQUE on (name, artist) or username: duplicates are rejected by a
        // read before the insert, not by the database.
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS songs (
                song_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                artist TEXT NOT NULL,
                slot1_host TEXT,
                slot1_port INTEGER,
                slot1_state TEXT NOT NULL DEFAULT 'empty',
                slot2_host TEXT,
                slot2_port INTEGER,
                slot2_state TEXT NOT NULL DEFAULT 'empty',
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS playlists (
                username TEXT NOT NULL,
                playlist_name TEXT NOT NULL,
                song_id INTEGER NOT NULL,
                added_at INTEGER NOT NULL,
                PRIMARY KEY (username, playlist_name, song_id),
                FOREIGN KEY (song_id) REFERENCES songs(song_id)
            );

            CREATE TABLE IF NOT EXISTS nodes (
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                health TEXT NOT NULL DEFAULT 'pending',
                last_checked INTEGER,
                PRIMARY KEY (host, port)
            );

            CREATE TABLE IF NOT EXISTS schema_info (
                version INTEGER PRIMARY KEY
            );

            CREATE INDEX IF NOT EXISTS idx_songs_name_artist ON songs(name, artist);
            CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);
            "#,
        )?;

        let existing_version: Option<u32> = conn
            .query_row("SELECT version FROM schema_info LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match existing_version {
            Some(version) if version != CURRENT_SCHEMA_VERSION => {
                Err(CatalogError::SchemaVersionMismatch {
                    expected: CURRENT_SCHEMA_VERSION,
                    found: version,
                })
            }
            Some(_) => Ok(()),
            None => {
                conn.execute(
                    "INSERT INTO schema_info (version) VALUES (?1)",
                    [CURRENT_SCHEMA_VERSION],
                )?;
                Ok(())
            }
        }
    }

    // ---- node registry ----

    /// Register the configured nodes. Existing rows keep their health.
    pub fn bootstrap_nodes(&self, nodes: &[NodeAddress]) -> CatalogResult<usize> {
        let conn = self.conn()?;
        let mut inserted = 0;
        for node in nodes {
            inserted += conn.execute(
                "INSERT OR IGNORE INTO nodes (host, port, health) VALUES (?1, ?2, 'pending')",
                (&node.host, node.port),
            )?;
        }
        debug!("Bootstrapped {} of {} nodes", inserted, nodes.len());
        Ok(inserted)
    }

    pub fn list_nodes(&self) -> CatalogResult<Vec<NodeRecord>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT host, port, health, last_checked FROM nodes ORDER BY host, port")?;
        let nodes = stmt
            .query_map([], parse_node)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(nodes)
    }

    pub fn node_health(&self, address: &NodeAddress) -> CatalogResult<NodeHealth> {
        let conn = self.conn()?;
        let health: Option<String> = conn
            .query_row(
                "SELECT health FROM nodes WHERE host = ?1 AND port = ?2",
                (&address.host, address.port),
                |row| row.get(0),
            )
            .optional()?;

        let health = health.ok_or_else(|| CatalogError::NodeNotRegistered {
            address: address.clone(),
        })?;
        NodeHealth::parse(&health).ok_or_else(|| CatalogError::InvalidMetadata {
            reason: format!("node {} has unknown health {:?}", address, health),
        })
    }

    /// Record an observed health. Always writes, even when unchanged.
    pub fn set_node_health(&self, address: &NodeAddress, health: NodeHealth) -> CatalogResult<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE nodes SET health = ?1, last_checked = ?2 WHERE host = ?3 AND port = ?4",
            (
                health.as_str(),
                system_time_to_timestamp(SystemTime::now()),
                &address.host,
                address.port,
            ),
        )?;
        if updated == 0 {
            return Err(CatalogError::NodeNotRegistered {
                address: address.clone(),
            });
        }
        Ok(())
    }

    pub fn active_nodes(&self) -> CatalogResult<Vec<NodeAddress>> {
        Ok(self
            .list_nodes()?
            .into_iter()
            .filter(|node| node.health == NodeHealth::Active)
            .map(|node| node.address)
            .collect())
    }

    // ---- songs ----

    /// Create a song on a random active node.
    ///
    /// Returns the new id and the node the client should upload to. The new song
    /// has slot1 pending on that node and slot2 empty.
    pub fn add_song(&self, name: &str, artist: &str) -> CatalogResult<(SongId, NodeAddress)> {
        if self.find_song(name, artist)?.is_some() {
            return Err(CatalogError::SongExists {
                name: name.to_string(),
                artist: artist.to_string(),
            });
        }

        let active = self.active_nodes()?;
        let node = active
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(CatalogError::NoActiveNodes)?;

        let song_id = self.insert_song(name, artist, &node)?;
        Ok((song_id, node))
    }

    /// Look up a song by exact (name, artist)
    pub fn find_song(&self, name: &str, artist: &str) -> CatalogResult<Option<SongId>> {
        let conn = self.conn()?;
        let song_id = conn
            .query_row(
                "SELECT song_id FROM songs WHERE name = ?1 AND artist = ?2 ORDER BY song_id LIMIT 1",
                (name, artist),
                |row| row.get(0),
            )
            .optional()?;
        Ok(song_id.map(SongId))
    }

    /// Insert a song with slot1 pending on `node`. Performs no duplicate check.
    pub fn insert_song(&self, name: &str, artist: &str, node: &NodeAddress) -> CatalogResult<SongId> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO songs (name, artist, slot1_host, slot1_port, slot1_state, slot2_state, created_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', 'empty', ?5)
            "#,
            (
                name,
                artist,
                &node.host,
                node.port,
                system_time_to_timestamp(SystemTime::now()),
            ),
        )?;
        Ok(SongId(conn.last_insert_rowid()))
    }

    pub fn get_song(&self, song_id: SongId) -> CatalogResult<Song> {
        let conn = self.conn()?;
        let song = conn
            .query_row(
                &format!("SELECT {} FROM songs WHERE song_id = ?1", SONG_COLUMNS),
                [song_id.0],
                parse_song,
            )
            .optional()?;
        song.ok_or(CatalogError::SongNotFound { song_id })
    }

    fn song_exists(&self, song_id: SongId) -> CatalogResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT song_id FROM songs WHERE song_id = ?1",
                [song_id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list_songs(&self) -> CatalogResult<Vec<Song>> {
        self.query_songs("1 = 1")
    }

    fn query_songs(&self, predicate: &str) -> CatalogResult<Vec<Song>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM songs WHERE {} ORDER BY song_id",
            SONG_COLUMNS, predicate
        ))?;
        let songs = stmt
            .query_map([], parse_song)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(songs)
    }

    /// Address of the first verified replica whose node is currently active
    pub fn get_address(&self, song_id: SongId) -> CatalogResult<NodeAddress> {
        let song = self.get_song(song_id)?;

        for index in SlotIndex::ALL {
            let slot = song.slot(index);
            let node = match (&slot.node, slot.state) {
                (Some(node), ReplicaState::Verified) => node,
                _ => continue,
            };
            match self.node_health(node) {
                Ok(NodeHealth::Active) => return Ok(node.clone()),
                Ok(_) | Err(CatalogError::NodeNotRegistered { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(CatalogError::SongUnavailable { song_id })
    }

    /// Songs with at least one verified replica
    pub fn catalog_snapshot(&self) -> CatalogResult<Vec<CatalogEntry>> {
        Ok(self
            .query_songs("slot1_state = 'verified' OR slot2_state = 'verified'")?
            .into_iter()
            .map(|song| CatalogEntry {
                id: song.id,
                name: song.name,
                artist: song.artist,
            })
            .collect())
    }

    pub fn songs_with_pending_slots(&self) -> CatalogResult<Vec<Song>> {
        self.query_songs("slot1_state = 'pending' OR slot2_state = 'pending'")
    }

    /// Songs with exactly one verified slot and the other slot empty
    pub fn songs_needing_backup(&self) -> CatalogResult<Vec<Song>> {
        self.query_songs(
            "(slot1_state = 'verified' AND slot2_state = 'empty') \
             OR (slot1_state = 'empty' AND slot2_state = 'verified')",
        )
    }

    /// Promote a pending slot on `node` to verified. Returns false if the slot moved on.
    pub fn mark_slot_verified(
        &self,
        song_id: SongId,
        slot: SlotIndex,
        node: &NodeAddress,
    ) -> CatalogResult<bool> {
        let prefix = slot.column();
        let conn = self.conn()?;
        let updated = conn.execute(
            &format!(
                "UPDATE songs SET {p}_state = 'verified' \
                 WHERE song_id = ?1 AND {p}_state = 'pending' AND {p}_host = ?2 AND {p}_port = ?3",
                p = prefix
            ),
            (song_id.0, &node.host, node.port),
        )?;
        Ok(updated > 0)
    }

    /// Reset a pending slot on `node` to empty. Returns false if the slot moved on.
    pub fn clear_slot(&self, song_id: SongId, slot: SlotIndex, node: &NodeAddress) -> CatalogResult<bool> {
        let prefix = slot.column();
        let conn = self.conn()?;
        let updated = conn.execute(
            &format!(
                "UPDATE songs SET {p}_host = NULL, {p}_port = NULL, {p}_state = 'empty' \
                 WHERE song_id = ?1 AND {p}_state = 'pending' AND {p}_host = ?2 AND {p}_port = ?3",
                p = prefix
            ),
            (song_id.0, &node.host, node.port),
        )?;
        Ok(updated > 0)
    }

    /// Place an empty slot as pending on `node`. Returns false if the slot was not empty.
    pub fn assign_pending_slot(
        &self,
        song_id: SongId,
        slot: SlotIndex,
        node: &NodeAddress,
    ) -> CatalogResult<bool> {
        let prefix = slot.column();
        let conn = self.conn()?;
        let updated = conn.execute(
            &format!(
                "UPDATE songs SET {p}_host = ?2, {p}_port = ?3, {p}_state = 'pending' \
                 WHERE song_id = ?1 AND {p}_state = 'empty'",
                p = prefix
            ),
            (song_id.0, &node.host, node.port),
        )?;
        Ok(updated > 0)
    }

    // ---- users ----

    pub fn add_user(&self, username: &str, password: &str) -> CatalogResult<()> {
        if self.find_user(username)?.is_some() {
            return Err(CatalogError::UserExists {
                username: username.to_string(),
            });
        }
        self.insert_user(username, password)?;
        Ok(())
    }

    /// First account registered under `username`
    pub fn find_user(&self, username: &str) -> CatalogResult<Option<UserRecord>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT user_id, username, password, created_at FROM users \
                 WHERE username = ?1 ORDER BY user_id LIMIT 1",
                [username],
                parse_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Insert an account. Performs no duplicate check.
    pub fn insert_user(&self, username: &str, password: &str) -> CatalogResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (username, password, created_at) VALUES (?1, ?2, ?3)",
            (
                username,
                password,
                system_time_to_timestamp(SystemTime::now()),
            ),
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Exact-match credential check
    pub fn verify_user(&self, username: &str, password: &str) -> CatalogResult<()> {
        let user = self
            .find_user(username)?
            .ok_or_else(|| CatalogError::UnknownUsername {
                username: username.to_string(),
            })?;
        if user.password != password {
            return Err(CatalogError::WrongPassword {
                username: username.to_string(),
            });
        }
        Ok(())
    }

    pub fn user_exists(&self, username: &str) -> CatalogResult<bool> {
        Ok(self.find_user(username)?.is_some())
    }

    // ---- playlists ----

    fn check_playlist_target(&self, username: &str, song_id: SongId) -> CatalogResult<()> {
        if !self.user_exists(username)? {
            return Err(CatalogError::UnknownUser {
                username: username.to_string(),
            });
        }
        if !self.song_exists(song_id)? {
            return Err(CatalogError::SongNotFound { song_id });
        }
        Ok(())
    }

    pub fn add_to_playlist(&self, username: &str, playlist: &str, song_id: SongId) -> CatalogResult<()> {
        self.check_playlist_target(username, song_id)?;

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO playlists (username, playlist_name, song_id, added_at) \
             VALUES (?1, ?2, ?3, ?4)",
            (
                username,
                playlist,
                song_id.0,
                system_time_to_timestamp(SystemTime::now()),
            ),
        )?;
        if inserted == 0 {
            return Err(CatalogError::AlreadyInPlaylist {
                playlist: playlist.to_string(),
                song_id,
            });
        }
        Ok(())
    }

    pub fn remove_from_playlist(
        &self,
        username: &str,
        playlist: &str,
        song_id: SongId,
    ) -> CatalogResult<()> {
        self.check_playlist_target(username, song_id)?;

        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM playlists WHERE username = ?1 AND playlist_name = ?2 AND song_id = ?3",
            (username, playlist, song_id.0),
        )?;
        if removed == 0 {
            return Err(CatalogError::NotInPlaylist {
                playlist: playlist.to_string(),
                song_id,
            });
        }
        Ok(())
    }

    pub fn get_user_playlist(&self, username: &str, playlist: &str) -> CatalogResult<BTreeSet<SongId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT song_id FROM playlists WHERE username = ?1 AND playlist_name = ?2",
        )?;
        let songs = stmt
            .query_map((username, playlist), |row| row.get::<_, i64>(0).map(SongId))?
            .collect::<SqliteResult<BTreeSet<_>>>()?;
        Ok(songs)
    }

    // ---- stats ----

    pub fn get_stats(&self) -> CatalogResult<CatalogStats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> CatalogResult<u64> {
            Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as u64)
        };

        Ok(CatalogStats {
            song_count: count("SELECT COUNT(*) FROM songs")?,
            user_count: count("SELECT COUNT(*) FROM users")?,
            playlist_entry_count: count("SELECT COUNT(*) FROM playlists")?,
            nodes_pending: count("SELECT COUNT(*) FROM nodes WHERE health = 'pending'")?,
            nodes_active: count("SELECT COUNT(*) FROM nodes WHERE health = 'active'")?,
            nodes_fallen: count("SELECT COUNT(*) FROM nodes WHERE health = 'fallen'")?,
            replicas_pending: count(
                "SELECT (SELECT COUNT(*) FROM songs WHERE slot1_state = 'pending') \
                      + (SELECT COUNT(*) FROM songs WHERE slot2_state = 'pending')",
            )?,
            replicas_verified: count(
                "SELECT (SELECT COUNT(*) FROM songs WHERE slot1_state = 'verified') \
                      + (SELECT COUNT(*) FROM songs WHERE slot2_state = 'verified')",
            )?,
        })
    }
}
