//! Integration tests for the storage node protocol


use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use songvault::catalog_store::SongId;
use songvault::messages::{FailureReason, NodeRequest};
use songvault::node_client::TransferError;
use songvault::wire_protocol::{self, Field, Message, Opcode, WireError};
use songvault::{ManualClock, NodeClient, TokenIssuer, TokenScope};

fn session_token(issuer: &TokenIssuer) -> String {
    issuer
        .issue("alice", TokenScope::Session, Duration::from_secs(60))
        .unwrap()
}

#[tokio::test]
async fn test_hello_reports_node_id() {
    init_tracing();
    let issuer = test_issuer();
    let node = spawn_node(issuer.clone()).await.unwrap();
    let client = NodeClient::default();

    let system = issuer.issue_unbounded("system", TokenScope::System).unwrap();
    let node_id = client.hello(&node.address, &system).await.unwrap();
    assert_eq!(node_id, node.node_id.to_string());

    // Any valid scope is enough for a liveness probe
    let verify = issuer
        .issue("system", TokenScope::Verify, Duration::from_secs(60))
        .unwrap();
    assert!(client.hello(&node.address, &verify).await.is_ok());

    let result = client.hello(&node.address, "not-a-token").await;
    assert!(matches!(
        result,
        Err(TransferError::Rejected {
            reason: FailureReason::Unauthorized,
            ..
        })
    ));

    node.stop().await;
}

#[tokio::test]
async fn test_put_get_verify() {
    init_tracing();
    let issuer = test_issuer();
    let node = spawn_node(issuer.clone()).await.unwrap();
    let client = NodeClient::default();
    let token = session_token(&issuer);
    let song_id = SongId(7);
    let data = b"imagine all the people".to_vec();

    let missing = client.get(&node.address, &token, song_id).await;
    assert!(matches!(
        missing,
        Err(TransferError::Rejected {
            reason: FailureReason::NotFound,
            ..
        })
    ));

    let verify_token = issuer
        .issue("system", TokenScope::Verify, Duration::from_secs(60))
        .unwrap();
    assert!(!client.verify(&node.address, &verify_token, song_id).await.unwrap());

    client
        .put(&node.address, &token, song_id, data.clone())
        .await
        .unwrap();
    assert_eq!(client.get(&node.address, &token, song_id).await.unwrap(), data);
    assert!(client.verify(&node.address, &verify_token, song_id).await.unwrap());

    // Overwrite keeps the latest bytes
    client
        .put(&node.address, &token, song_id, b"v2".to_vec())
        .await
        .unwrap();
    assert_eq!(
        client.get(&node.address, &token, song_id).await.unwrap(),
        b"v2".to_vec()
    );

    node.stop().await;
}

#[tokio::test]
async fn test_scope_and_expiry_are_uniform_auth_failures() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(10_000));
    let issuer = TokenIssuer::with_clock(TEST_SECRET, clock.clone()).unwrap();
    let node = spawn_node(issuer.clone()).await.unwrap();
    let client = NodeClient::default();

    // A verify token cannot upload
    let verify_token = issuer
        .issue("system", TokenScope::Verify, Duration::from_secs(60))
        .unwrap();
    let result = client
        .put(&node.address, &verify_token, SongId(1), b"x".to_vec())
        .await;
    assert!(matches!(
        result,
        Err(TransferError::Rejected {
            reason: FailureReason::Unauthorized,
            ..
        })
    ));

    // An expired session token cannot download
    let token = session_token(&issuer);
    clock.advance(Duration::from_secs(61));
    let result = client.get(&node.address, &token, SongId(1)).await;
    assert!(matches!(
        result,
        Err(TransferError::Rejected {
            reason: FailureReason::Unauthorized,
            ..
        })
    ));

    // A token signed with another secret is rejected the same way
    let foreign = TokenIssuer::new("other-secret").unwrap();
    let result = client
        .get(&node.address, &session_token(&foreign), SongId(1))
        .await;
    assert!(matches!(
        result,
        Err(TransferError::Rejected {
            reason: FailureReason::Unauthorized,
            ..
        })
    ));

    node.stop().await;
}

#[tokio::test]
async fn test_relay_copies_blob_to_peer() {
    init_tracing();
    let issuer = test_issuer();
    let source = spawn_node(issuer.clone()).await.unwrap();
    let destination = spawn_node(issuer.clone()).await.unwrap();
    let client = NodeClient::default();
    let song_id = SongId(3);
    let data = vec![0xAB; 64 * 1024];

    client
        .put(&source.address, &session_token(&issuer), song_id, data.clone())
        .await
        .unwrap();

    let relay_source = issuer
        .issue("system", TokenScope::RelaySource, Duration::from_secs(60))
        .unwrap();
    let relay_ingest = issuer
        .issue("system", TokenScope::RelayIngest, Duration::from_secs(60))
        .unwrap();
    client
        .relay(
            &source.address,
            &relay_source,
            &relay_ingest,
            song_id,
            &destination.address,
        )
        .await
        .unwrap();

    wait_for_blob(&destination.address, song_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        client
            .get(&destination.address, &session_token(&issuer), song_id)
            .await
            .unwrap(),
        data
    );

    source.stop().await;
    destination.stop().await;
}

#[tokio::test]
async fn test_relay_with_wrong_scope_is_unauthorized() {
    init_tracing();
    let issuer = test_issuer();
    let source = spawn_node(issuer.clone()).await.unwrap();
    let destination = spawn_node(issuer.clone()).await.unwrap();
    let song_id = SongId(4);

    NodeClient::default()
        .put(&source.address, &session_token(&issuer), song_id, b"x".to_vec())
        .await
        .unwrap();

    // Session token in the source position
    let relay_ingest = issuer
        .issue("system", TokenScope::RelayIngest, Duration::from_secs(60))
        .unwrap();
    let request = NodeRequest::Relay {
        token: session_token(&issuer),
        ingest_token: relay_ingest,
        song_id,
        destination: destination.address.clone(),
    };
    let mut stream = TcpStream::connect((source.address.host.as_str(), source.address.port))
        .await
        .unwrap();
    wire_protocol::write_message(&mut stream, &request.into_message())
        .await
        .unwrap();
    let reply = wire_protocol::try_decode(&mut stream).await.unwrap();
    assert_eq!(reply.opcode, Opcode::Relay);
    assert_eq!(reply.fields, vec![Field::from("F"), Field::from("unauthorized")]);

    assert!(
        wait_for_blob(&destination.address, song_id, Duration::from_millis(300))
            .await
            .is_err()
    );

    source.stop().await;
    destination.stop().await;
}

#[tokio::test]
async fn test_ingest_requires_ingest_scope() {
    init_tracing();
    let issuer = test_issuer();
    let node = spawn_node(issuer.clone()).await.unwrap();
    let client = NodeClient::default();

    let result = client
        .ingest(&node.address, &session_token(&issuer), SongId(9), b"x".to_vec())
        .await;
    assert!(matches!(
        result,
        Err(TransferError::Rejected {
            reason: FailureReason::Unauthorized,
            ..
        })
    ));

    let ingest = issuer
        .issue("system", TokenScope::RelayIngest, Duration::from_secs(60))
        .unwrap();
    client
        .ingest(&node.address, &ingest, SongId(9), b"x".to_vec())
        .await
        .unwrap();

    node.stop().await;
}

#[tokio::test]
async fn test_bad_request_and_framing_error() {
    init_tracing();
    let issuer = test_issuer();
    let node = spawn_node(issuer.clone()).await.unwrap();
    let (host, port) = (node.address.host.clone(), node.address.port);

    // Well framed, wrong shape: the node answers bad_request
    let mut stream = TcpStream::connect((host.as_str(), port)).await.unwrap();
    let message = Message::new(Opcode::Get, vec![Field::from("token")]);
    wire_protocol::write_message(&mut stream, &message).await.unwrap();
    let reply = wire_protocol::try_decode(&mut stream).await.unwrap();
    assert_eq!(reply.opcode, Opcode::Get);
    assert_eq!(reply.fields, vec![Field::from("F"), Field::from("bad_request")]);

    // Unknown opcode: the node closes without a reply
    let mut stream = TcpStream::connect((host.as_str(), port)).await.unwrap();
    stream.write_all(b"zzz").await.unwrap();
    let result = wire_protocol::try_decode(&mut stream).await;
    assert!(matches!(
        result,
        Err(WireError::ConnectionClosed) | Err(WireError::Io(_))
    ));

    node.stop().await;
}

#[tokio::test]
async fn test_oversized_field_rejected_at_frame() {
    init_tracing();
    let issuer = test_issuer();
    let node = spawn_node_with_limit(issuer.clone(), 64 * 1024).await.unwrap();
    let client = NodeClient::default();
    let token = session_token(&issuer);

    // Announce a 32 MiB body behind a bogus token and send only a sliver of it.
    // The node must hang up without waiting for the rest.
    let mut stream = TcpStream::connect((node.address.host.as_str(), node.address.port))
        .await
        .unwrap();
    stream
        .write_all(b"pst3s11!bogus-tokens1!1b33554432!")
        .await
        .unwrap();
    stream.write_all(&[0u8; 1024]).await.unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        wire_protocol::try_decode(&mut stream),
    )
    .await
    .expect("node waited for the oversized body");
    assert!(matches!(
        result,
        Err(WireError::ConnectionClosed) | Err(WireError::Io(_))
    ));

    // Within the ceiling everything still works
    client
        .put(&node.address, &token, SongId(1), vec![7u8; 32 * 1024])
        .await
        .unwrap();
    assert_eq!(
        client.get(&node.address, &token, SongId(1)).await.unwrap().len(),
        32 * 1024
    );

    node.stop().await;
}

#[tokio::test]
async fn test_stopped_node_refuses_connections() {
    init_tracing();
    let issuer = test_issuer();
    let node = spawn_node(issuer.clone()).await.unwrap();
    let address = node.address.clone();
    node.stop().await;

    let system = issuer.issue_unbounded("system", TokenScope::System).unwrap();
    let result = NodeClient::new(Duration::from_millis(500))
        .hello(&address, &system)
        .await;
    assert!(matches!(
        result,
        Err(TransferError::Connect { .. }) | Err(TransferError::Timeout { .. })
    ));
}
