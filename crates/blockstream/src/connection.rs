//! Streaming state machine for a single block node.
//!
//! A connection moves `Uninitialized -> Connecting -> Active` when opened and
//! back to `Uninitialized` when closed. While active, a worker task publishes
//! buffered blocks in order and a pump task feeds node responses through the
//! handlers below. Jumps requested by responses are picked up by the worker
//! before it selects the next block, never in the middle of a send.
//!
//! Connections never retry on their own. Every recovery decision is sent to
//! the [`ConnectionManager`](crate::manager::ConnectionManager) as a
//! [`ConnectionEvent::Retry`].

use core::time::Duration;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::BlockBuffer;
use crate::config::BlockStreamConfig;
use crate::error::BlockStreamError;
use crate::limiter::EndOfStreamLimiter;
use crate::messages::{InboundMessage, PeerDescriptor, PublishRequest, StatusCode};
use crate::metrics::BlockStreamMetrics;
use crate::transport::{BlockNodeTransport, RequestStream, ResponseReceiver, StreamPair};

#[cfg(test)]
#[path = "tests/connection.rs"]
mod tests;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// No network resources are held.
    Uninitialized,
    /// Handshake in flight.
    Connecting,
    /// Streaming. Requests are only sent in this state.
    Active,
}

/// What the manager should do once a retry delay elapses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryPlan {
    /// Open a new stream to the same peer.
    Reconnect { block: Option<u64> },
    /// Open a new stream to a different peer.
    Failover { block: Option<u64> },
}

impl RetryPlan {
    #[must_use]
    pub const fn block(self) -> Option<u64> {
        match self {
            Self::Reconnect { block } | Self::Failover { block } => block,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reconnect { .. } => "reconnect",
            Self::Failover { .. } => "failover",
        }
    }
}

/// Notification sent from a connection to its manager.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    Retry {
        connection_id: u64,
        peer: PeerDescriptor,
        delay: Duration,
        plan: RetryPlan,
    },
    Verified {
        connection_id: u64,
        peer: PeerDescriptor,
        block: u64,
    },
}

/// Collaborators shared by every connection of a manager.
#[derive(Clone, Debug)]
pub struct StreamContext {
    pub config: BlockStreamConfig,
    pub buffer: Arc<dyn BlockBuffer>,
    pub transport: Arc<dyn BlockNodeTransport>,
    pub metrics: Arc<dyn BlockStreamMetrics>,
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
}

/// Block the stream cursor moves to after `acknowledged` was persisted.
///
/// The cursor advances past the acknowledged block when it trails it, or when
/// the node caught up with both the cursor and the producer. Stale and
/// duplicate acknowledgements leave it where it is.
#[must_use]
pub fn acknowledgement_action(
    streaming: u64,
    acknowledged: u64,
    producing: Option<u64>,
) -> Option<u64> {
    // `streaming < acknowledged <= producing` is a case of the first arm.
    let trailing = streaming < acknowledged;
    let caught_up = streaming == acknowledged && producing == Some(acknowledged);

    (trailing || caught_up).then(|| acknowledged.wrapping_add(1))
}

type SharedRequests = Arc<AsyncMutex<Box<dyn RequestStream>>>;

#[derive(Debug)]
struct Shared {
    state: ConnectionState,
    streaming_block: u64,
    jump_target: Option<u64>,
    worker: Option<JoinHandle<()>>,
    requests: Option<SharedRequests>,
    cancel: CancellationToken,
}

/// A stream of blocks to one block node.
#[derive(Debug)]
pub struct BlockNodeConnection {
    id: u64,
    peer: PeerDescriptor,
    context: StreamContext,
    limiter: Arc<Mutex<EndOfStreamLimiter>>,
    shared: Mutex<Shared>,
    wake: Notify,
}

impl BlockNodeConnection {
    /// `limiter` is shared by every connection to `peer` so the end-of-stream
    /// rate survives reconnections.
    #[must_use]
    pub fn new(
        id: u64,
        peer: PeerDescriptor,
        context: StreamContext,
        limiter: Arc<Mutex<EndOfStreamLimiter>>,
    ) -> Self {
        Self {
            id,
            peer,
            context,
            limiter,
            shared: Mutex::new(Shared {
                state: ConnectionState::Uninitialized,
                streaming_block: 0,
                jump_target: None,
                worker: None,
                requests: None,
                cancel: CancellationToken::new(),
            }),
            wake: Notify::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn peer(&self) -> &PeerDescriptor {
        &self.peer
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Block the worker publishes next, including a pending jump.
    #[must_use]
    pub fn current_block(&self) -> u64 {
        let shared = self.shared.lock();
        shared.jump_target.unwrap_or(shared.streaming_block)
    }

    /// Performs the handshake and starts streaming at `start_block`.
    pub async fn open(self: &Arc<Self>, start_block: u64) -> Result<(), BlockStreamError> {
        {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Uninitialized {
                return Err(BlockStreamError::illegal(format!(
                    "cannot open a connection in state {:?}",
                    shared.state
                )));
            }
            shared.state = ConnectionState::Connecting;
        }

        info!(peer = %self.peer, connection_id = self.id, start_block, "Opening block stream");

        let handshake = time::timeout(
            self.context.config.handshake_timeout,
            self.context.transport.connect(&self.peer),
        )
        .await;

        let StreamPair {
            requests,
            responses,
        } = match handshake {
            Ok(Ok(pair)) => pair,
            Ok(Err(error)) => return Err(self.handshake_failed(error)),
            Err(_elapsed) => {
                return Err(self.handshake_failed(BlockStreamError::transport(
                    "handshake timed out",
                )))
            }
        };

        let requests: SharedRequests = Arc::new(AsyncMutex::new(requests));
        let cancel = CancellationToken::new();

        let opened = {
            let mut shared = self.shared.lock();
            let connecting = shared.state == ConnectionState::Connecting;
            if connecting {
                shared.state = ConnectionState::Active;
                shared.streaming_block = start_block;
                shared.jump_target = None;
                shared.cancel = cancel.clone();
                shared.requests = Some(Arc::clone(&requests));
                shared.worker = Some(tokio::spawn(
                    Arc::clone(self).stream_blocks(cancel.clone()),
                ));
            }
            connecting
        };

        if !opened {
            self.complete_requests(&requests).await;
            return Err(BlockStreamError::illegal(
                "connection closed during the handshake",
            ));
        }

        drop(tokio::spawn(
            Arc::clone(self).pump_responses(responses, cancel),
        ));

        info!(peer = %self.peer, connection_id = self.id, start_block, "Block stream active");

        Ok(())
    }

    /// Moves the worker to `block` at its next safe point.
    pub fn restart_at(&self, block: u64) -> Result<(), BlockStreamError> {
        {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Active {
                return Err(BlockStreamError::illegal(format!(
                    "cannot restart a connection in state {:?}",
                    shared.state
                )));
            }
            shared.jump_target = Some(block);
        }

        debug!(peer = %self.peer, block, "Stream restart requested");
        self.wake.notify_one();

        Ok(())
    }

    /// Tears the stream down. Calling it on a closed connection is a no-op.
    pub async fn close(&self) {
        let _was_open = self.shutdown().await;
    }

    pub(crate) async fn handle_response(&self, message: InboundMessage) {
        match message {
            InboundMessage::Acknowledgement {
                block_number,
                already_exists,
            } => self.on_acknowledgement(block_number, already_exists),
            InboundMessage::EndOfStream {
                block_number,
                status,
            } => self.on_end_of_stream(block_number, status).await,
            InboundMessage::SkipBlock { block_number } => self.on_skip_block(block_number),
            InboundMessage::ResendBlock { block_number } => {
                self.on_resend_block(block_number).await;
            }
        }
    }

    fn on_acknowledgement(&self, block: u64, already_exists: bool) {
        self.context.metrics.record_acknowledgement();

        let producing = self.context.buffer.last_produced_block();

        let jumped = {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Active {
                debug!(peer = %self.peer, block, "Ignoring acknowledgement on an inactive stream");
                return;
            }

            let streaming = shared.jump_target.unwrap_or(shared.streaming_block);
            let next = acknowledgement_action(streaming, block, producing);
            if next.is_some() {
                shared.jump_target = next;
            }
            next
        };

        debug!(peer = %self.peer, block, already_exists, "Block acknowledged");

        if let Some(next) = jumped {
            debug!(peer = %self.peer, next, "Acknowledgement moved the stream cursor");
            self.wake.notify_one();
        }

        self.context.buffer.acknowledge(block);
        self.emit(ConnectionEvent::Verified {
            connection_id: self.id,
            peer: self.peer.clone(),
            block,
        });
    }

    async fn on_end_of_stream(&self, block: u64, status: StatusCode) {
        self.context.metrics.record_end_of_stream(status);
        info!(peer = %self.peer, block, %status, "Block node ended the stream");

        self.close().await;

        let config = &self.context.config;

        let exceeded = self.limiter.lock().record(Instant::now());
        if exceeded {
            warn!(
                peer = %self.peer,
                delay = ?config.end_of_stream_schedule_delay,
                "End-of-stream rate exceeded, delaying reconnection"
            );
            self.context.metrics.record_rate_limited();
            self.schedule(
                config.end_of_stream_schedule_delay,
                RetryPlan::Reconnect { block: None },
            );
            return;
        }

        let next = block.wrapping_add(1);

        match status {
            StatusCode::InternalError | StatusCode::PersistenceFailed => {
                self.schedule(config.retry_delay, RetryPlan::Reconnect { block: None });
            }
            StatusCode::Timeout | StatusCode::OutOfOrder | StatusCode::BadStateProof => {
                self.schedule(Duration::ZERO, RetryPlan::Reconnect { block: Some(next) });
            }
            StatusCode::Success => {
                self.schedule(config.long_retry_delay, RetryPlan::Reconnect { block: None });
            }
            StatusCode::Behind => {
                if self.context.buffer.has_block_state(next) {
                    self.schedule(Duration::ZERO, RetryPlan::Reconnect { block: Some(next) });
                } else {
                    warn!(peer = %self.peer, block = next, "Block state no longer held, failing over");
                    self.schedule(config.initial_retry_delay, RetryPlan::Failover { block: None });
                }
            }
            StatusCode::Unspecified | StatusCode::Unknown => {
                warn!(peer = %self.peer, block, %status, "Leaving the stream closed");
            }
        }
    }

    fn on_skip_block(&self, block: u64) {
        self.context.metrics.record_skip_block();

        let skipped = {
            let mut shared = self.shared.lock();
            let streaming = shared.jump_target.unwrap_or(shared.streaming_block);
            let skip = shared.state == ConnectionState::Active && streaming == block;
            if skip {
                shared.jump_target = Some(block.wrapping_add(1));
            }
            skip
        };

        if skipped {
            debug!(peer = %self.peer, block, "Skipping block");
            self.wake.notify_one();
        } else {
            debug!(peer = %self.peer, block, "Ignoring skip for a block not being streamed");
        }
    }

    async fn on_resend_block(&self, block: u64) {
        self.context.metrics.record_resend_block();
        info!(peer = %self.peer, block, "Block node requested a resend");

        self.close().await;
        self.schedule(Duration::ZERO, RetryPlan::Reconnect { block: Some(block) });
    }

    async fn on_transport_error(&self, error: BlockStreamError) {
        if !self.shutdown().await {
            debug!(peer = %self.peer, %error, "Transport error on a closed stream");
            return;
        }

        self.context.metrics.record_transport_error();
        warn!(peer = %self.peer, %error, "Block stream failed");

        self.schedule(
            self.context.config.initial_retry_delay,
            RetryPlan::Reconnect { block: None },
        );
    }

    fn handshake_failed(&self, error: BlockStreamError) -> BlockStreamError {
        {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Connecting {
                shared.state = ConnectionState::Uninitialized;
            }
        }

        self.context.metrics.record_handshake_failure();
        warn!(peer = %self.peer, %error, "Block stream handshake failed");

        error
    }

    /// Returns whether this call moved the connection out of an open state.
    async fn shutdown(&self) -> bool {
        let (previous, worker, requests) = {
            let mut shared = self.shared.lock();
            let previous = shared.state;
            shared.state = ConnectionState::Uninitialized;
            shared.jump_target = None;
            shared.cancel.cancel();
            (previous, shared.worker.take(), shared.requests.take())
        };

        self.wake.notify_one();

        if previous == ConnectionState::Uninitialized && worker.is_none() && requests.is_none() {
            return false;
        }

        info!(peer = %self.peer, connection_id = self.id, "Closing block stream");

        if let Some(mut worker) = worker {
            match time::timeout(self.context.config.worker_shutdown_timeout, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(peer = %self.peer, %error, "Block worker terminated abnormally");
                }
                Err(_elapsed) => {
                    warn!(peer = %self.peer, "Block worker did not stop in time, abandoning it");
                    worker.abort();
                }
            }
        }

        if let Some(requests) = requests {
            self.complete_requests(&requests).await;
        }

        true
    }

    async fn complete_requests(&self, requests: &SharedRequests) {
        if let Err(error) = requests.lock().await.complete().await {
            warn!(peer = %self.peer, %error, "Failed to complete the request stream");
        }
    }

    fn schedule(&self, delay: Duration, plan: RetryPlan) {
        debug!(peer = %self.peer, ?delay, ?plan, "Requesting retry");
        self.emit(ConnectionEvent::Retry {
            connection_id: self.id,
            peer: self.peer.clone(),
            delay,
            plan,
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.context.events.send(event).is_err() {
            debug!(peer = %self.peer, "Connection manager is gone, dropping event");
        }
    }

    async fn stream_blocks(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let block = {
                let mut shared = self.shared.lock();
                if cancel.is_cancelled() || shared.state != ConnectionState::Active {
                    break;
                }
                if let Some(target) = shared.jump_target.take() {
                    shared.streaming_block = target;
                }
                shared.streaming_block
            };

            let Some(items) = self.context.buffer.block(block) else {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = self.wake.notified() => {}
                    () = time::sleep(self.context.config.worker_poll_interval) => {}
                }
                continue;
            };

            let requests = self.shared.lock().requests.clone();
            let Some(requests) = requests else {
                break;
            };

            let sent = requests
                .lock()
                .await
                .send(PublishRequest {
                    block_number: block,
                    items,
                })
                .await;

            match sent {
                Ok(()) => {
                    self.context.metrics.record_block_sent();
                    debug!(peer = %self.peer, block, "Block published");

                    let mut shared = self.shared.lock();
                    if shared.jump_target.is_none() && shared.streaming_block == block {
                        shared.streaming_block = block.wrapping_add(1);
                    }
                }
                Err(error) => {
                    let connection = Arc::clone(&self);
                    drop(tokio::spawn(async move {
                        connection.on_transport_error(error).await;
                    }));
                    break;
                }
            }
        }

        debug!(peer = %self.peer, connection_id = self.id, "Block worker stopped");
    }

    async fn pump_responses(self: Arc<Self>, mut responses: ResponseReceiver, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = responses.recv() => next,
            };

            match next {
                Some(Ok(message)) => self.handle_response(message).await,
                Some(Err(error)) => {
                    self.on_transport_error(error).await;
                    break;
                }
                None => {
                    self.on_transport_error(BlockStreamError::transport("response stream ended"))
                        .await;
                    break;
                }
            }
        }

        debug!(peer = %self.peer, connection_id = self.id, "Response pump stopped");
    }
}
