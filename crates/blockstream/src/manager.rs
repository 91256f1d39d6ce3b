//! Chooses the block node to stream to and owns every retry timer.
//!
//! The manager runs as a single task. Connections report retry decisions and
//! verified blocks over a channel; the manager keeps at most one retry
//! pending and replaces it whenever a newer decision arrives. Handshakes run
//! on their own tasks so handle calls are answered while a node is slow to
//! accept the stream.

use core::future::poll_fn;
use core::time::Duration;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, warn};

use crate::buffer::BlockBuffer;
use crate::config::BlockStreamConfig;
use crate::connection::{
    BlockNodeConnection, ConnectionEvent, ConnectionState, RetryPlan, StreamContext,
};
use crate::error::BlockStreamError;
use crate::limiter::EndOfStreamLimiter;
use crate::messages::PeerDescriptor;
use crate::metrics::BlockStreamMetrics;
use crate::transport::BlockNodeTransport;

#[cfg(test)]
#[path = "tests/manager.rs"]
mod tests;

const COMMAND_CAPACITY: usize = 32;

#[derive(Debug)]
struct PeerRecord {
    descriptor: PeerDescriptor,
    /// Consecutive failed handshakes, reset once a stream opens.
    failures: u32,
    limiter: Arc<Mutex<EndOfStreamLimiter>>,
    last_verified: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct ScheduledRetry {
    peer: PeerDescriptor,
    plan: RetryPlan,
}

#[derive(Debug)]
enum Command {
    UpdateLastVerified { peer: PeerDescriptor, block: u64 },
    RestartAt { block: u64 },
    Status(oneshot::Sender<ManagerStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Outcome of a handshake started by [`ConnectionManager::connect`].
#[derive(Debug)]
struct Handshake {
    connection_id: u64,
    index: usize,
    block: Option<u64>,
    result: Result<(), BlockStreamError>,
}

enum Step {
    Handshake(Handshake),
    Command(Option<Command>),
    Event(ConnectionEvent),
    Retry(ScheduledRetry),
}

/// Bookkeeping the manager holds for one candidate peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerStatus {
    pub peer: PeerDescriptor,
    pub failures: u32,
    pub last_verified: Option<u64>,
}

/// Snapshot of the manager.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ManagerStatus {
    pub active_peer: Option<PeerDescriptor>,
    pub connection_state: Option<ConnectionState>,
    pub current_block: Option<u64>,
    pub pending_retry: Option<(PeerDescriptor, RetryPlan)>,
    pub peers: Vec<PeerStatus>,
}

/// Keeps one stream open to the best available block node.
#[derive(Debug)]
pub struct ConnectionManager {
    context: StreamContext,
    peers: Vec<PeerRecord>,
    active: Option<Arc<BlockNodeConnection>>,
    next_connection_id: u64,
    retries: DelayQueue<ScheduledRetry>,
    pending_retry: Option<(delay_queue::Key, ScheduledRetry)>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    handshakes_tx: mpsc::UnboundedSender<Handshake>,
    handshakes: mpsc::UnboundedReceiver<Handshake>,
    commands: mpsc::Receiver<Command>,
}

/// Cloneable handle to a running [`ConnectionManager`].
#[derive(Clone, Debug)]
pub struct ManagerHandle {
    commands: mpsc::Sender<Command>,
}

impl ConnectionManager {
    pub fn new(
        config: BlockStreamConfig,
        peers: Vec<PeerDescriptor>,
        buffer: Arc<dyn BlockBuffer>,
        transport: Arc<dyn BlockNodeTransport>,
        metrics: Arc<dyn BlockStreamMetrics>,
    ) -> (Self, ManagerHandle) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (handshakes_tx, handshakes) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);

        let peers = peers
            .into_iter()
            .map(|descriptor| PeerRecord {
                descriptor,
                failures: 0,
                limiter: Arc::new(Mutex::new(EndOfStreamLimiter::from_config(&config))),
                last_verified: None,
            })
            .collect();

        let manager = Self {
            context: StreamContext {
                config,
                buffer,
                transport,
                metrics,
                events: events_tx,
            },
            peers,
            active: None,
            next_connection_id: 0,
            retries: DelayQueue::new(),
            pending_retry: None,
            events,
            handshakes_tx,
            handshakes,
            commands,
        };

        (
            manager,
            ManagerHandle {
                commands: commands_tx,
            },
        )
    }

    /// Runs until [`ManagerHandle::shutdown`] is called or every handle is dropped.
    pub async fn run(mut self) {
        info!(peers = self.peers.len(), "Starting block stream manager");

        match self.select_peer(None) {
            Some(index) => self.connect(index, None).await,
            None => warn!("No block nodes configured"),
        }

        loop {
            let step = tokio::select! {
                biased;
                Some(handshake) = self.handshakes.recv() => Step::Handshake(handshake),
                command = self.commands.recv() => Step::Command(command),
                Some(event) = self.events.recv() => Step::Event(event),
                Some(expired) = poll_fn(|cx| self.retries.poll_expired(cx)), if !self.retries.is_empty() => {
                    Step::Retry(expired.into_inner())
                }
            };

            match step {
                Step::Handshake(handshake) => self.handle_handshake(handshake),
                Step::Command(Some(Command::Shutdown(done))) => {
                    self.stop().await;
                    let _ignored = done.send(());
                    return;
                }
                Step::Command(Some(command)) => self.handle_command(command),
                Step::Command(None) => {
                    debug!("Every manager handle was dropped");
                    break;
                }
                Step::Event(event) => self.handle_event(event),
                Step::Retry(retry) => {
                    self.pending_retry = None;
                    self.run_retry(retry).await;
                }
            }
        }

        self.stop().await;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::UpdateLastVerified { peer, block } => self.record_verified(&peer, block),
            Command::RestartAt { block } => self.restart_at(block),
            Command::Status(reply) => {
                let _ignored = reply.send(self.status());
            }
            Command::Shutdown(_) => {}
        }
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Verified { peer, block, .. } => self.record_verified(&peer, block),
            ConnectionEvent::Retry {
                connection_id,
                peer,
                delay,
                plan,
            } => {
                let active_id = self.active.as_ref().map(|connection| connection.id());
                if active_id != Some(connection_id) {
                    debug!(%peer, connection_id, ?plan, "Ignoring retry from a replaced connection");
                    return;
                }
                self.schedule(peer, plan, delay);
            }
        }
    }

    fn record_verified(&mut self, peer: &PeerDescriptor, block: u64) {
        let Some(record) = self.peers.iter_mut().find(|record| &record.descriptor == peer) else {
            debug!(%peer, block, "Verified block from an unknown peer");
            return;
        };

        let verified = record.last_verified.map_or(block, |last| last.max(block));
        record.last_verified = Some(verified);
    }

    fn restart_at(&mut self, block: u64) {
        if let Some(active) = &self.active {
            if active.restart_at(block).is_ok() {
                info!(peer = %active.peer(), block, "Restarting active stream");
                return;
            }
        }

        let peer = self
            .active
            .as_ref()
            .map(|connection| connection.peer().clone())
            .or_else(|| {
                self.select_peer(None)
                    .map(|index| self.peers[index].descriptor.clone())
            });

        match peer {
            Some(peer) => self.schedule(peer, RetryPlan::Reconnect { block: Some(block) }, Duration::ZERO),
            None => warn!(block, "No block node to restart the stream on"),
        }
    }

    fn schedule(&mut self, peer: PeerDescriptor, plan: RetryPlan, delay: Duration) {
        if let Some((key, superseded)) = self.pending_retry.take() {
            if self.retries.try_remove(&key).is_some() {
                debug!(peer = %superseded.peer, plan = ?superseded.plan, "Superseding pending retry");
            }
        }

        self.context.metrics.record_retry_scheduled(plan.as_str());
        info!(%peer, ?plan, ?delay, "Retry scheduled");

        let retry = ScheduledRetry { peer, plan };
        let key = self.retries.insert(retry.clone(), delay);
        self.pending_retry = Some((key, retry));
    }

    async fn run_retry(&mut self, retry: ScheduledRetry) {
        let index = match retry.plan {
            RetryPlan::Reconnect { .. } => self
                .peer_index(&retry.peer)
                .or_else(|| self.select_peer(None)),
            RetryPlan::Failover { .. } => self.select_peer(Some(&retry.peer)),
        };

        let Some(index) = index else {
            warn!(peer = %retry.peer, plan = ?retry.plan, "No block node available for retry");
            return;
        };

        self.connect(index, retry.plan.block()).await;
    }

    /// Replaces the active connection and starts its handshake in the
    /// background. The outcome comes back as a [`Handshake`].
    async fn connect(&mut self, index: usize, block: Option<u64>) {
        if let Some(previous) = self.active.take() {
            previous.close().await;
        }

        let start = self.resume_block(index, block);
        self.next_connection_id += 1;

        let record = &self.peers[index];
        let connection = Arc::new(BlockNodeConnection::new(
            self.next_connection_id,
            record.descriptor.clone(),
            self.context.clone(),
            Arc::clone(&record.limiter),
        ));

        let opening = Arc::clone(&connection);
        let handshakes = self.handshakes_tx.clone();
        drop(tokio::spawn(async move {
            let result = opening.open(start).await;
            let _ignored = handshakes.send(Handshake {
                connection_id: opening.id(),
                index,
                block,
                result,
            });
        }));

        self.active = Some(connection);
    }

    fn handle_handshake(&mut self, handshake: Handshake) {
        let Handshake {
            connection_id,
            index,
            block,
            result,
        } = handshake;

        let active_id = self.active.as_ref().map(|connection| connection.id());
        if active_id != Some(connection_id) {
            debug!(connection_id, "Ignoring handshake of a replaced connection");
            return;
        }

        match result {
            Ok(()) => self.peers[index].failures = 0,
            Err(error) => {
                self.active = None;

                let record = &mut self.peers[index];
                let delay = self.context.config.backoff_delay(record.failures);
                record.failures = record.failures.saturating_add(1);

                warn!(
                    peer = %record.descriptor,
                    failures = record.failures,
                    ?delay,
                    %error,
                    "Could not open block stream, failing over"
                );

                let peer = record.descriptor.clone();
                self.schedule(peer, RetryPlan::Failover { block }, delay);
            }
        }
    }

    /// First block to stream to the peer at `index`.
    ///
    /// An explicit block wins. Otherwise the block after the last one the
    /// peer verified, if still buffered, then the oldest unacknowledged block,
    /// then the block after the newest one produced.
    fn resume_block(&self, index: usize, explicit: Option<u64>) -> u64 {
        if let Some(block) = explicit {
            return block;
        }

        let buffer = &self.context.buffer;

        let after_verified = self.peers[index]
            .last_verified
            .map(|block| block.wrapping_add(1))
            .filter(|&block| buffer.has_block_state(block));

        after_verified
            .or_else(|| buffer.earliest_unacknowledged())
            .or_else(|| buffer.last_produced_block().map(|block| block.wrapping_add(1)))
            .unwrap_or(0)
    }

    fn peer_index(&self, peer: &PeerDescriptor) -> Option<usize> {
        self.peers
            .iter()
            .position(|record| &record.descriptor == peer)
    }

    /// Lowest priority value first, then fewest failures. `exclude` is only
    /// honoured while another peer is available.
    fn select_peer(&self, exclude: Option<&PeerDescriptor>) -> Option<usize> {
        let rank = |(_, record): &(usize, &PeerRecord)| (record.descriptor.priority, record.failures);

        self.peers
            .iter()
            .enumerate()
            .filter(|(_, record)| Some(&record.descriptor) != exclude)
            .min_by_key(rank)
            .or_else(|| self.peers.iter().enumerate().min_by_key(rank))
            .map(|(index, _)| index)
    }

    fn status(&self) -> ManagerStatus {
        ManagerStatus {
            active_peer: self.active.as_ref().map(|connection| connection.peer().clone()),
            connection_state: self.active.as_ref().map(|connection| connection.state()),
            current_block: self.active.as_ref().map(|connection| connection.current_block()),
            pending_retry: self
                .pending_retry
                .as_ref()
                .map(|(_, retry)| (retry.peer.clone(), retry.plan)),
            peers: self
                .peers
                .iter()
                .map(|record| PeerStatus {
                    peer: record.descriptor.clone(),
                    failures: record.failures,
                    last_verified: record.last_verified,
                })
                .collect(),
        }
    }

    async fn stop(&mut self) {
        self.retries.clear();
        self.pending_retry = None;

        if let Some(active) = self.active.take() {
            active.close().await;
        }

        info!("Block stream manager stopped");
    }
}

impl ManagerHandle {
    /// Records that `peer` verified every block up to `block`.
    pub async fn update_last_verified_block(
        &self,
        peer: &PeerDescriptor,
        block: u64,
    ) -> Result<(), BlockStreamError> {
        self.send(Command::UpdateLastVerified {
            peer: peer.clone(),
            block,
        })
        .await
    }

    /// Moves the active stream to `block`, reconnecting if no stream is open.
    pub async fn restart_at(&self, block: u64) -> Result<(), BlockStreamError> {
        self.send(Command::RestartAt { block }).await
    }

    pub async fn status(&self) -> Result<ManagerStatus, BlockStreamError> {
        let (reply, status) = oneshot::channel();
        self.send(Command::Status(reply)).await?;
        status.await.map_err(|_| BlockStreamError::ManagerStopped)
    }

    pub async fn active_peer(&self) -> Result<Option<PeerDescriptor>, BlockStreamError> {
        Ok(self.status().await?.active_peer)
    }

    /// Closes the active stream and stops the manager.
    pub async fn shutdown(&self) -> Result<(), BlockStreamError> {
        let (done, stopped) = oneshot::channel();
        self.send(Command::Shutdown(done)).await?;
        stopped.await.map_err(|_| BlockStreamError::ManagerStopped)
    }

    async fn send(&self, command: Command) -> Result<(), BlockStreamError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BlockStreamError::ManagerStopped)
    }
}
