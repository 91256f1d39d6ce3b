use core::time::Duration;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::*;
use crate::buffer::InMemoryBlockBuffer;
use crate::messages::{InboundMessage, StatusCode};
use crate::metrics::NoopMetrics;
use crate::transport::{LoopbackTransport, NodeSession};

struct Harness {
    handle: ManagerHandle,
    task: JoinHandle<()>,
    buffer: Arc<InMemoryBlockBuffer>,
    transport: Arc<LoopbackTransport>,
    sessions: mpsc::UnboundedReceiver<NodeSession>,
}

fn node_a() -> PeerDescriptor {
    PeerDescriptor::new("node-a", 40840, 0)
}

fn node_b() -> PeerDescriptor {
    PeerDescriptor::new("node-b", 40840, 1)
}

fn config() -> BlockStreamConfig {
    BlockStreamConfig {
        initial_retry_delay: Duration::from_secs(1),
        retry_delay: Duration::from_secs(5),
        long_retry_delay: Duration::from_secs(30),
        max_backoff_delay: Duration::from_secs(60),
        ..BlockStreamConfig::default()
    }
}

fn start(peers: Vec<PeerDescriptor>, blocks: &[u64], refused: &[PeerDescriptor]) -> Harness {
    let buffer = Arc::new(InMemoryBlockBuffer::new());
    for &block in blocks {
        buffer.push_block(block, vec![format!("block-{block}").into_bytes()]);
    }

    let (transport, sessions) = LoopbackTransport::new();
    let transport = Arc::new(transport);
    for peer in refused {
        transport.refuse(peer);
    }

    let (manager, handle) = ConnectionManager::new(
        config(),
        peers,
        Arc::clone(&buffer) as Arc<dyn BlockBuffer>,
        Arc::clone(&transport) as Arc<dyn BlockNodeTransport>,
        Arc::new(NoopMetrics),
    );
    let task = tokio::spawn(manager.run());

    Harness {
        handle,
        task,
        buffer,
        transport,
        sessions,
    }
}

async fn next_block(session: &mut NodeSession) -> Option<u64> {
    let request = session.next_request().await?;
    Some(request.unwrap().block_number)
}

#[tokio::test(start_paused = true)]
async fn connects_to_the_preferred_peer() {
    let mut harness = start(vec![node_b(), node_a()], &[0, 1], &[]);

    let mut session = harness.sessions.recv().await.unwrap();
    assert_eq!(session.peer(), &node_a());
    assert_eq!(next_block(&mut session).await, Some(0));
    assert_eq!(next_block(&mut session).await, Some(1));

    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.active_peer, Some(node_a()));
    assert_eq!(status.connection_state, Some(ConnectionState::Active));
    assert_eq!(status.current_block, Some(2));
    assert_eq!(status.pending_retry, None);

    harness.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn handshake_failure_fails_over_after_a_delay() {
    let started = Instant::now();
    let mut harness = start(vec![node_a(), node_b()], &[0], &[node_a()]);

    let mut session = harness.sessions.recv().await.unwrap();
    assert_eq!(session.peer(), &node_b());
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(next_block(&mut session).await, Some(0));

    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.active_peer, Some(node_b()));
    assert_eq!(status.peers[0].failures, 1);
    assert_eq!(status.peers[1].failures, 0);

    harness.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn repeated_handshake_failures_back_off() {
    let started = Instant::now();
    let mut harness = start(vec![node_a()], &[0], &[node_a()]);

    // Attempts at 0s, 1s and 3s. The next one is due at 7s.
    time::sleep(Duration::from_millis(3500)).await;

    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.active_peer, None);
    assert_eq!(status.peers[0].failures, 3);
    assert_eq!(
        status.pending_retry,
        Some((node_a(), RetryPlan::Failover { block: None }))
    );

    harness.transport.accept(&node_a());

    let _session = harness.sessions.recv().await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(7), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(8), "{elapsed:?}");

    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.peers[0].failures, 0);

    harness.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stalled_handshake_keeps_the_handle_responsive() {
    let started = Instant::now();
    let mut harness = start(vec![node_a(), node_b()], &[0], &[]);
    harness.transport.stall(&node_a());

    let status = harness.handle.status().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(status.active_peer, Some(node_a()));
    assert_eq!(status.connection_state, Some(ConnectionState::Connecting));

    // 10s handshake timeout, then a 1s failover delay
    let mut session = harness.sessions.recv().await.unwrap();
    assert_eq!(session.peer(), &node_b());
    assert!(started.elapsed() >= Duration::from_secs(11));
    assert_eq!(next_block(&mut session).await, Some(0));

    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.peers[0].failures, 1);
    assert_eq!(status.connection_state, Some(ConnectionState::Active));

    harness.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_a_stalled_handshake() {
    let started = Instant::now();
    let harness = start(vec![node_a()], &[0], &[]);
    harness.transport.stall(&node_a());

    assert_eq!(
        harness.handle.status().await.unwrap().connection_state,
        Some(ConnectionState::Connecting)
    );

    harness.handle.shutdown().await.unwrap();
    harness.task.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn restart_during_a_handshake_reconnects() {
    let mut harness = start(vec![node_a()], &[0, 1, 2, 3], &[]);
    harness.transport.stall(&node_a());

    assert_eq!(
        harness.handle.status().await.unwrap().connection_state,
        Some(ConnectionState::Connecting)
    );

    harness.transport.accept(&node_a());
    harness.handle.restart_at(2).await.unwrap();

    let mut session = harness.sessions.recv().await.unwrap();
    assert_eq!(next_block(&mut session).await, Some(2));

    // the abandoned handshake times out without touching the new stream
    time::sleep(Duration::from_secs(15)).await;
    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.connection_state, Some(ConnectionState::Active));
    assert_eq!(status.peers[0].failures, 0);
    assert_eq!(status.pending_retry, None);

    harness.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn newer_decision_cancels_the_pending_retry() {
    let mut harness = start(vec![node_a()], &[5], &[]);

    let session = harness.sessions.recv().await.unwrap();
    assert!(
        session
            .respond(InboundMessage::EndOfStream {
                block_number: 4,
                status: StatusCode::Success,
            })
            .await
    );

    loop {
        let status = harness.handle.status().await.unwrap();
        if status.pending_retry.is_some() {
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }

    harness.handle.restart_at(5).await.unwrap();

    let mut restarted = harness.sessions.recv().await.unwrap();
    assert_eq!(restarted.peer(), &node_a());
    assert_eq!(next_block(&mut restarted).await, Some(5));

    // The 30s reconnect from the end of stream must not fire.
    assert!(
        time::timeout(Duration::from_secs(60), harness.sessions.recv())
            .await
            .is_err()
    );

    harness.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn behind_without_block_state_fails_over() {
    let mut harness = start(vec![node_a(), node_b()], &[0, 1], &[]);

    let session = harness.sessions.recv().await.unwrap();
    assert_eq!(session.peer(), &node_a());
    assert!(
        session
            .respond(InboundMessage::EndOfStream {
                block_number: 9,
                status: StatusCode::Behind,
            })
            .await
    );

    let mut failover = harness.sessions.recv().await.unwrap();
    assert_eq!(failover.peer(), &node_b());
    assert_eq!(next_block(&mut failover).await, Some(0));

    harness.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_resumes_after_the_last_verified_block() {
    let mut harness = start(vec![node_a()], &[0, 1, 2, 3, 4, 5], &[]);

    let mut session = harness.sessions.recv().await.unwrap();
    for expected in 0..=5 {
        assert_eq!(next_block(&mut session).await, Some(expected));
    }

    assert!(
        session
            .respond(InboundMessage::Acknowledgement {
                block_number: 2,
                already_exists: false,
            })
            .await
    );
    harness
        .handle
        .update_last_verified_block(&node_a(), 3)
        .await
        .unwrap();
    assert!(session.fail("connection reset").await);

    let mut resumed = harness.sessions.recv().await.unwrap();
    assert_eq!(next_block(&mut resumed).await, Some(4));
    assert!(harness.buffer.is_acknowledged(2));

    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.peers[0].last_verified, Some(3));

    harness.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_the_stream() {
    let mut harness = start(vec![node_a()], &[], &[]);

    let mut session = harness.sessions.recv().await.unwrap();
    assert_eq!(
        harness.handle.active_peer().await.unwrap(),
        Some(node_a())
    );

    harness.handle.shutdown().await.unwrap();

    assert_eq!(next_block(&mut session).await, None);
    assert!(session.is_completed());
    harness.task.await.unwrap();
    assert!(matches!(
        harness.handle.status().await,
        Err(BlockStreamError::ManagerStopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn runs_without_peers() {
    let harness = start(Vec::new(), &[], &[]);

    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.active_peer, None);
    assert!(status.peers.is_empty());

    harness.handle.restart_at(3).await.unwrap();
    assert_eq!(harness.handle.status().await.unwrap().pending_retry, None);

    drop(harness.handle);
    harness.task.await.unwrap();
}
