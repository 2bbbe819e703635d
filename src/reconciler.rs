//! Replication Reconciler
//!
//! Drives every song toward two verified replicas. A pass has two phases:
//!
//! 1. **Verify**: each pending slot is probed with `vrf` on its node. `found`
//!    promotes the slot to verified; `lost`, or any probe failure, clears it.
//! 2. **Backup**: each song with one verified slot and one empty slot gets a
//!    `bkg` instruction sent to the hosting node, naming a different active node
//!    as destination. The empty slot becomes pending as soon as the instruction is
//!    sent. Only a later verify phase can mark it verified.
//!
//! Node failures and failed slot writes only affect the song being processed;
//! the pass moves on.

use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::auth::{TokenIssuer, TokenScope, SYSTEM_SUBJECT};
use crate::background::{spawn_periodic, BackgroundHandle};
use crate::catalog_store::{CatalogResult, CatalogStore, NodeAddress, ReplicaState, SlotIndex, Song};
use crate::config::ReplicationConfig;
use crate::node_client::NodeClient;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Pending slots promoted to verified
    pub verified: usize,
    /// Pending slots reset to empty
    pub cleared: usize,
    /// Relay instructions sent (each left a new pending slot)
    pub backups_issued: usize,
    /// Songs needing a backup that were left for a later pass
    pub skipped: usize,
    pub elapsed: Duration,
}

pub struct Reconciler {
    store: Arc<CatalogStore>,
    client: NodeClient,
    issuer: TokenIssuer,
    verify_token_ttl: Duration,
    relay_token_ttl: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<CatalogStore>, issuer: TokenIssuer, config: &ReplicationConfig) -> Self {
        Self {
            store,
            client: NodeClient::new(config.probe_timeout),
            issuer,
            verify_token_ttl: config.verify_token_ttl,
            relay_token_ttl: config.relay_token_ttl,
        }
    }

    /// Run the verify phase and then the backup phase
    pub async fn run_pass(&self) -> CatalogResult<ReconcileReport> {
        let started = Instant::now();
        let mut report = ReconcileReport::default();

        self.verify_phase(&mut report).await?;
        self.backup_phase(&mut report).await?;

        report.elapsed = started.elapsed();
        if report.verified + report.cleared + report.backups_issued > 0 {
            info!(
                "Reconcile pass: {} verified, {} cleared, {} backups issued, {} skipped",
                report.verified, report.cleared, report.backups_issued, report.skipped
            );
        }
        Ok(report)
    }

    async fn verify_phase(&self, report: &mut ReconcileReport) -> CatalogResult<()> {
        let songs = self
            .store
            .run_blocking(|store| store.songs_with_pending_slots())
            .await?;

        for song in songs {
            for index in SlotIndex::ALL {
                let slot = song.slot(index);
                let node = match (&slot.node, slot.state) {
                    (Some(node), ReplicaState::Pending) => node,
                    _ => continue,
                };

                let found = self.probe(&song, index, node).await;
                let (song_id, slot_node) = (song.id, node.clone());
                let written = self
                    .store
                    .run_blocking(move |store| {
                        if found {
                            store.mark_slot_verified(song_id, index, &slot_node)
                        } else {
                            store.clear_slot(song_id, index, &slot_node)
                        }
                    })
                    .await;

                match written {
                    Ok(true) if found => {
                        debug!("Song {} {} verified on {}", song.id, index, node);
                        report.verified += 1;
                    }
                    Ok(true) => {
                        info!("Song {} {} on {} cleared", song.id, index, node);
                        report.cleared += 1;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Cannot update song {} {}: {}", song.id, index, e),
                }
            }
        }
        Ok(())
    }

    /// `true` only for an explicit `found`
    async fn probe(&self, song: &Song, index: SlotIndex, node: &NodeAddress) -> bool {
        let token = match self
            .issuer
            .issue(SYSTEM_SUBJECT, TokenScope::Verify, self.verify_token_ttl)
        {
            Ok(token) => token,
            Err(e) => {
                warn!("Cannot issue verify token: {}", e);
                return false;
            }
        };

        match self.client.verify(node, &token, song.id).await {
            Ok(found) => {
                if !found {
                    debug!("Song {} {} reported lost by {}", song.id, index, node);
                }
                found
            }
            Err(e) => {
                warn!("Verify of song {} on {} failed: {}", song.id, node, e);
                false
            }
        }
    }

    async fn backup_phase(&self, report: &mut ReconcileReport) -> CatalogResult<()> {
        let candidates = self
            .store
            .run_blocking(|store| store.songs_needing_backup())
            .await?;
        if candidates.is_empty() {
            return Ok(());
        }
        let active = self.store.run_blocking(|store| store.active_nodes()).await?;

        for song in candidates {
            let (source_index, source) = match song.backup_candidate() {
                Some(candidate) => candidate,
                None => continue,
            };

            if !active.contains(source) {
                debug!("Song {}: source {} is not active, skipping", song.id, source);
                report.skipped += 1;
                continue;
            }

            let target = {
                let others: Vec<&NodeAddress> =
                    active.iter().filter(|node| *node != source).collect();
                others.choose(&mut rand::thread_rng()).map(|node| (*node).clone())
            };
            let target = match target {
                Some(target) => target,
                None => {
                    debug!("Song {}: no other active node, skipping", song.id);
                    report.skipped += 1;
                    continue;
                }
            };

            if !self.issue_relay(&song, source, &target).await {
                report.skipped += 1;
                continue;
            }

            let (song_id, slot, slot_node) = (song.id, source_index.other(), target.clone());
            match self
                .store
                .run_blocking(move |store| store.assign_pending_slot(song_id, slot, &slot_node))
                .await
            {
                Ok(true) => {
                    info!(
                        "Song {}: relay {} -> {} issued, {} pending",
                        song.id, source, target, slot
                    );
                    report.backups_issued += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("Cannot assign backup slot of song {}: {}", song.id, e),
            }
        }
        Ok(())
    }

    async fn issue_relay(&self, song: &Song, source: &NodeAddress, target: &NodeAddress) -> bool {
        let tokens = self
            .issuer
            .issue(SYSTEM_SUBJECT, TokenScope::RelaySource, self.relay_token_ttl)
            .and_then(|source_token| {
                self.issuer
                    .issue(SYSTEM_SUBJECT, TokenScope::RelayIngest, self.relay_token_ttl)
                    .map(|ingest_token| (source_token, ingest_token))
            });
        let (source_token, ingest_token) = match tokens {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("Cannot issue relay tokens: {}", e);
                return false;
            }
        };

        match self
            .client
            .relay(source, &source_token, &ingest_token, song.id, target)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Relay of song {} from {} failed: {}", song.id, source, e);
                false
            }
        }
    }

    /// Run passes every `interval`, starting now
    pub fn spawn(self: Arc<Self>, interval: Duration) -> BackgroundHandle {
        spawn_periodic("reconciler", interval, move || {
            let reconciler = Arc::clone(&self);
            async move {
                if let Err(e) = reconciler.run_pass().await {
                    warn!("Reconcile pass failed: {}", e);
                }
            }
        })
    }
}
