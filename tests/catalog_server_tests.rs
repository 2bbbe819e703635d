//! Integration tests for the catalog server session flow


use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use songvault::catalog_store::{
    NodeAddress, NodeHealth, ReplicaState, SlotIndex, SongId, LIKED_SONGS_PLAYLIST,
};
use songvault::health_monitor::HealthMonitor;
use songvault::messages::{CatalogRequest, FailureReason};
use songvault::reconciler::Reconciler;
use songvault::wire_protocol::{self, WireError};
use songvault::{CatalogClient, ClientError, ManualClock, NodeClient, TokenIssuer};

const SESSION_TTL: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn test_signup_login_and_catalog_ops() {
    init_tracing();
    let node = spawn_node(test_issuer()).await.unwrap();
    let catalog = spawn_catalog(test_issuer(), &[node.address.clone()], SESSION_TTL)
        .await
        .unwrap();
    set_active(&catalog.store, &[&node.address]);

    let mut client = CatalogClient::connect(catalog.addr).await.unwrap();
    let session = client.signup("alice", "pw1").await.unwrap();
    assert!(session.catalog.is_empty());
    assert_eq!(client.token(), Some(session.token.as_str()));

    let (song_id, assigned) = client.add_song("Imagine", "Lennon").await.unwrap();
    assert_eq!(song_id, SongId(1));
    assert_eq!(assigned, node.address);

    let duplicate = client.add_song("Imagine", "Lennon").await;
    assert_eq!(
        duplicate.unwrap_err().reason(),
        Some(FailureReason::SongExists)
    );

    // Pending songs are neither listed nor served
    assert!(client.refresh().await.unwrap().is_empty());
    assert_eq!(
        client.get_address(song_id).await.unwrap_err().reason(),
        Some(FailureReason::SongUnavailable)
    );
    assert_eq!(
        client.get_address(SongId(99)).await.unwrap_err().reason(),
        Some(FailureReason::SongNotFound)
    );

    client
        .add_to_playlist("alice", LIKED_SONGS_PLAYLIST, song_id)
        .await
        .unwrap();
    assert_eq!(
        client
            .add_to_playlist("alice", LIKED_SONGS_PLAYLIST, song_id)
            .await
            .unwrap_err()
            .reason(),
        Some(FailureReason::AlreadyInPlaylist)
    );
    assert_eq!(
        client
            .add_to_playlist("bob", LIKED_SONGS_PLAYLIST, song_id)
            .await
            .unwrap_err()
            .reason(),
        Some(FailureReason::Forbidden)
    );

    // A second connection logs in and sees the liked song
    let mut second = CatalogClient::connect(catalog.addr).await.unwrap();
    let session = second.login("alice", "pw1").await.unwrap();
    assert_eq!(session.liked_songs.into_iter().collect::<Vec<_>>(), vec![song_id]);
    second
        .remove_from_playlist("alice", LIKED_SONGS_PLAYLIST, song_id)
        .await
        .unwrap();
    assert_eq!(
        second
            .remove_from_playlist("alice", LIKED_SONGS_PLAYLIST, song_id)
            .await
            .unwrap_err()
            .reason(),
        Some(FailureReason::NotInPlaylist)
    );
    second.exit().await.unwrap();

    client.exit().await.unwrap();
    catalog.stop().await;
    node.stop().await;
}

#[tokio::test]
async fn test_login_failures_are_distinguishable() {
    init_tracing();
    let catalog = spawn_catalog(test_issuer(), &[], SESSION_TTL).await.unwrap();
    let mut client = CatalogClient::connect(catalog.addr).await.unwrap();

    client.signup("alice", "pw1").await.unwrap();
    client.relogin().await.unwrap();
    assert!(client.token().is_none());

    let err = client.login("alice", "wrong").await.unwrap_err();
    assert_eq!(err.reason(), Some(FailureReason::WrongPassword));
    let err = client.login("bob", "pw1").await.unwrap_err();
    assert_eq!(err.reason(), Some(FailureReason::UnknownUsername));
    let err = client.signup("alice", "pw2").await.unwrap_err();
    assert_eq!(err.reason(), Some(FailureReason::UserExists));

    // Still in the login phase on the same connection
    client.login("alice", "pw1").await.unwrap();
    client.exit().await.unwrap();
    catalog.stop().await;
}

#[tokio::test]
async fn test_requests_before_login_are_refused() {
    init_tracing();
    let catalog = spawn_catalog(test_issuer(), &[], SESSION_TTL).await.unwrap();
    let mut client = CatalogClient::connect(catalog.addr).await.unwrap();

    assert!(matches!(client.refresh().await, Err(ClientError::NotLoggedIn)));

    // Even with a valid token the unauthenticated phase only takes sig/log/ext
    let token = test_issuer()
        .issue("alice", songvault::TokenScope::Session, SESSION_TTL)
        .unwrap();
    let reply = client
        .request(CatalogRequest::Refresh { token })
        .await
        .unwrap();
    assert_eq!(reply.outcome, Err(FailureReason::NotAuthenticated));

    client.exit().await.unwrap();
    catalog.stop().await;
}

#[tokio::test]
async fn test_expired_token_demotes_on_same_connection() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let issuer = TokenIssuer::with_clock(TEST_SECRET, clock.clone()).unwrap();
    let catalog = spawn_catalog(issuer, &[], Duration::from_secs(60))
        .await
        .unwrap();

    let mut client = CatalogClient::connect(catalog.addr).await.unwrap();
    client.signup("alice", "pw1").await.unwrap();
    client.refresh().await.unwrap();

    clock.advance(Duration::from_secs(120));
    let err = client.refresh().await.unwrap_err();
    assert_eq!(err.reason(), Some(FailureReason::TokenExpired));
    assert!(client.token().is_none());

    // Back in the login phase, without reconnecting
    let session = client.login("alice", "pw1").await.unwrap();
    assert!(session.catalog.is_empty());
    client.refresh().await.unwrap();

    client.exit().await.unwrap();
    catalog.stop().await;
}

#[tokio::test]
async fn test_forged_token_demotes() {
    init_tracing();
    let catalog = spawn_catalog(test_issuer(), &[], SESSION_TTL).await.unwrap();
    let mut client = CatalogClient::connect(catalog.addr).await.unwrap();
    client.signup("alice", "pw1").await.unwrap();

    let forged = TokenIssuer::new("attacker")
        .unwrap()
        .issue("alice", songvault::TokenScope::Session, SESSION_TTL)
        .unwrap();
    client.set_token(Some(forged));
    let err = client.refresh().await.unwrap_err();
    assert_eq!(err.reason(), Some(FailureReason::InvalidToken));

    // The connection was demoted, so a genuine token is no longer enough
    let genuine = test_issuer()
        .issue("alice", songvault::TokenScope::Session, SESSION_TTL)
        .unwrap();
    let reply = client
        .request(CatalogRequest::Refresh { token: genuine })
        .await
        .unwrap();
    assert_eq!(reply.outcome, Err(FailureReason::NotAuthenticated));

    catalog.stop().await;
}

#[tokio::test]
async fn test_framing_error_closes_connection() {
    init_tracing();
    let catalog = spawn_catalog(test_issuer(), &[], SESSION_TTL).await.unwrap();

    let mut stream = TcpStream::connect(catalog.addr).await.unwrap();
    stream.write_all(b"xyz").await.unwrap();
    let result = wire_protocol::try_decode(&mut stream).await;
    assert!(matches!(
        result,
        Err(WireError::ConnectionClosed) | Err(WireError::Io(_))
    ));

    // The server keeps serving other clients
    let mut client = CatalogClient::connect(catalog.addr).await.unwrap();
    client.signup("alice", "pw1").await.unwrap();
    catalog.stop().await;
}

#[tokio::test]
async fn test_oversized_request_field_closes_before_login() {
    init_tracing();
    let catalog = spawn_catalog(test_issuer(), &[], SESSION_TTL).await.unwrap();

    // A 64 MiB password announced on a fresh connection; only a sliver follows
    let mut stream = TcpStream::connect(catalog.addr).await.unwrap();
    stream.write_all(b"sig2s5!aliceb67108864!").await.unwrap();
    stream.write_all(&[0u8; 1024]).await.unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        wire_protocol::try_decode(&mut stream),
    )
    .await
    .expect("server waited for the oversized field");
    assert!(matches!(
        result,
        Err(WireError::ConnectionClosed) | Err(WireError::Io(_))
    ));

    // Ordinary requests stay well under the ceiling
    let long_name = "x".repeat(1024);
    let mut client = CatalogClient::connect(catalog.addr).await.unwrap();
    client.signup(&long_name, "pw1").await.unwrap();
    client.exit().await.unwrap();
    catalog.stop().await;
}

/// alice uploads "Imagine" by Lennon; the reconcilers and health monitor take it
/// from one pending copy on node A to verified copies on A and B.
#[tokio::test]
async fn test_end_to_end_replication_scenario() {
    init_tracing();
    let node_a = spawn_node(test_issuer()).await.unwrap();
    let node_b = spawn_node(test_issuer()).await.unwrap();
    let (a, b) = (node_a.address.clone(), node_b.address.clone());

    let catalog = spawn_catalog(test_issuer(), &[a.clone(), b.clone()], SESSION_TTL)
        .await
        .unwrap();
    let store = Arc::clone(&catalog.store);

    // Only A is up at first
    store.set_node_health(&a, NodeHealth::Active).unwrap();
    store.set_node_health(&b, NodeHealth::Fallen).unwrap();

    let mut client = CatalogClient::connect(catalog.addr).await.unwrap();
    let session = client.signup("alice", "pw1").await.unwrap();
    assert!(session.catalog.is_empty());

    let (song_id, upload_to) = client.add_song("Imagine", "Lennon").await.unwrap();
    assert_eq!(song_id, SongId(1));
    assert_eq!(upload_to, a);
    let song = store.get_song(song_id).unwrap();
    assert_eq!(song.slot(SlotIndex::First).node.as_ref(), Some(&a));
    assert_eq!(song.slot(SlotIndex::First).state, ReplicaState::Pending);

    let data = b"imagine there's no heaven".to_vec();
    NodeClient::default()
        .put(&upload_to, &session.token, song_id, data.clone())
        .await
        .unwrap();

    let config = test_replication_config();
    let reconciler = Reconciler::new(Arc::clone(&store), test_issuer(), &config);
    let monitor = HealthMonitor::new(Arc::clone(&store), &test_issuer(), config.probe_timeout).unwrap();

    let report = reconciler.run_pass().await.unwrap();
    assert_eq!(report.verified, 1);
    assert_eq!(report.backups_issued, 0);
    assert_eq!(
        store.get_song(song_id).unwrap().slot(SlotIndex::First).state,
        ReplicaState::Verified
    );

    let catalog_view = client.refresh().await.unwrap();
    assert_eq!(catalog_view.len(), 1);
    assert_eq!(catalog_view[0].name, "Imagine");

    // B comes up
    monitor.run_pass().await.unwrap();
    assert_eq!(store.node_health(&b).unwrap(), NodeHealth::Active);

    let report = reconciler.run_pass().await.unwrap();
    assert_eq!(report.backups_issued, 1);
    let song = store.get_song(song_id).unwrap();
    assert_eq!(song.slot(SlotIndex::Second).node.as_ref(), Some(&b));
    assert_eq!(song.slot(SlotIndex::Second).state, ReplicaState::Pending);

    // Before B is verified, clients are sent to A
    assert_eq!(client.get_address(song_id).await.unwrap(), a);

    wait_for_blob(&b, song_id, Duration::from_secs(5)).await.unwrap();
    reconciler.run_pass().await.unwrap();
    assert_eq!(
        store.get_song(song_id).unwrap().slot(SlotIndex::Second).state,
        ReplicaState::Verified
    );

    // A goes away; the next health pass routes clients to B
    node_a.stop().await;
    monitor.run_pass().await.unwrap();
    assert_eq!(store.node_health(&a).unwrap(), NodeHealth::Fallen);

    let served_by: NodeAddress = client.get_address(song_id).await.unwrap();
    assert_eq!(served_by, b);
    let fetched = NodeClient::default()
        .get(&served_by, client.token().unwrap(), song_id)
        .await
        .unwrap();
    assert_eq!(fetched, data);

    client.exit().await.unwrap();
    catalog.stop().await;
    node_b.stop().await;
}
