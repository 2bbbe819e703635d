//! Blob Store Module
//!
//! Local media storage for a storage node. Blobs are keyed by song id and spread
//! across 256 bucket directories:
//!
//! ```text
//! <root>/<id % 256, 3 digits>/<id>.blob
//! ```
//!
//! Writes land in a uniquely named temp file in the bucket and are renamed into
//! place, so a reader never observes a half-written blob.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::catalog_store::SongId;

/// Number of bucket directories under the root
pub const BUCKET_COUNT: i64 = 256;

const BLOB_EXTENSION: &str = "blob";

/// Errors that can occur during blob operations
#[derive(Error, Debug)]
pub enum BlobStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blob not found: {song_id}")]
    NotFound { song_id: SongId },

    #[error("Blob too large: {size} bytes exceeds maximum {max} bytes")]
    BlobTooLarge { size: u64, max: u64 },

    #[error("Invalid song id for storage: {song_id}")]
    InvalidSongId { song_id: SongId },

    #[error("Invalid storage root path: {path:?}")]
    InvalidRootPath { path: PathBuf },
}

/// Result type for blob operations
pub type BlobStoreResult<T> = Result<T, BlobStoreError>;

/// Blob store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobStoreStats {
    /// Number of stored blobs
    pub blob_count: u64,
    /// Total size of all blobs in bytes
    pub total_size: u64,
    /// Number of bucket directories in use
    pub bucket_count: u64,
}

/// Directory-backed blob storage
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    max_blob_size: u64,
}

impl BlobStore {
    /// Open (creating if needed) a blob store rooted at `root`
    pub fn new<P: Into<PathBuf>>(root: P, max_blob_size: u64) -> BlobStoreResult<Self> {
        let root = root.into();
        if root.exists() && !root.is_dir() {
            return Err(BlobStoreError::InvalidRootPath { path: root });
        }
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            max_blob_size,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_blob_size(&self) -> u64 {
        self.max_blob_size
    }

    fn bucket_dir(&self, song_id: SongId) -> BlobStoreResult<PathBuf> {
        if song_id.0 < 0 {
            return Err(BlobStoreError::InvalidSongId { song_id });
        }
        Ok(self
            .root
            .join(format!("{:03}", song_id.0 % BUCKET_COUNT)))
    }

    /// Final on-disk path of a blob
    pub fn blob_path(&self, song_id: SongId) -> BlobStoreResult<PathBuf> {
        Ok(self
            .bucket_dir(song_id)?
            .join(format!("{}.{}", song_id, BLOB_EXTENSION)))
    }

    /// Store `data` under `song_id`, replacing any previous blob
    pub async fn put(&self, song_id: SongId, data: &[u8]) -> BlobStoreResult<()> {
        let size = data.len() as u64;
        if size > self.max_blob_size {
            return Err(BlobStoreError::BlobTooLarge {
                size,
                max: self.max_blob_size,
            });
        }

        let bucket = self.bucket_dir(song_id)?;
        tokio::fs::create_dir_all(&bucket).await?;

        let final_path = self.blob_path(song_id)?;
        let temp_path = bucket.join(format!("{}.{}.tmp", song_id, Uuid::new_v4()));

        if let Err(e) = tokio::fs::write(&temp_path, data).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        debug!("Stored blob {} ({} bytes)", song_id, size);
        Ok(())
    }

    pub async fn get(&self, song_id: SongId) -> BlobStoreResult<Vec<u8>> {
        let path = self.blob_path(song_id)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BlobStoreError::NotFound { song_id }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn contains(&self, song_id: SongId) -> BlobStoreResult<bool> {
        let path = self.blob_path(song_id)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Walk every bucket and total up the stored blobs
    pub fn stats(&self) -> BlobStoreResult<BlobStoreStats> {
        let mut stats = BlobStoreStats::default();

        for entry in fs::read_dir(&self.root)? {
            let bucket = entry?.path();
            if !bucket.is_dir() {
                continue;
            }

            let mut bucket_used = false;
            for blob in fs::read_dir(&bucket)? {
                let blob = blob?;
                let path = blob.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(BLOB_EXTENSION) {
                    continue;
                }
                let metadata = blob.metadata()?;
                if metadata.is_file() {
                    stats.blob_count += 1;
                    stats.total_size += metadata.len();
                    bucket_used = true;
                }
            }
            if bucket_used {
                stats.bucket_count += 1;
            }
        }

        Ok(stats)
    }
}
