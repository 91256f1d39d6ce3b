//! Stream transports towards block nodes.

use core::fmt::Debug;
use core::future;
use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::BlockStreamError;
use crate::messages::{InboundMessage, PeerDescriptor, PublishRequest};

/// Responses a block node sends on an open stream.
pub type ResponseReceiver = mpsc::Receiver<Result<InboundMessage, BlockStreamError>>;

/// Outbound half of an open stream.
#[async_trait]
pub trait RequestStream: Send + Debug {
    async fn send(&mut self, request: PublishRequest) -> Result<(), BlockStreamError>;

    /// Completes the outbound half gracefully.
    async fn complete(&mut self) -> Result<(), BlockStreamError>;
}

/// Both halves of a stream returned by a successful handshake.
#[derive(Debug)]
pub struct StreamPair {
    pub requests: Box<dyn RequestStream>,
    pub responses: ResponseReceiver,
}

/// Opens streams to block nodes.
#[async_trait]
pub trait BlockNodeTransport: Send + Sync + Debug {
    async fn connect(&self, peer: &PeerDescriptor) -> Result<StreamPair, BlockStreamError>;
}

const RESPONSE_CAPACITY: usize = 64;

/// In-process transport.
///
/// Every successful `connect` hands the node side of the stream to the
/// receiver returned by [`LoopbackTransport::new`]. Requests cross it as
/// borsh frames.
#[derive(Debug)]
pub struct LoopbackTransport {
    sessions: mpsc::UnboundedSender<NodeSession>,
    refused: Mutex<HashSet<PeerDescriptor>>,
    stalled: Mutex<HashSet<PeerDescriptor>>,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NodeSession>) {
        let (sessions, receiver) = mpsc::unbounded_channel();
        let transport = Self {
            sessions,
            refused: Mutex::default(),
            stalled: Mutex::default(),
        };
        (transport, receiver)
    }

    /// Makes handshakes with `peer` fail until [`Self::accept`] is called.
    pub fn refuse(&self, peer: &PeerDescriptor) {
        let _inserted = self.refused.lock().insert(peer.clone());
    }

    /// Makes handshakes with `peer` hang until the caller gives up on them.
    pub fn stall(&self, peer: &PeerDescriptor) {
        let _inserted = self.stalled.lock().insert(peer.clone());
    }

    /// Lets handshakes with `peer` through again.
    pub fn accept(&self, peer: &PeerDescriptor) {
        let _removed = self.refused.lock().remove(peer);
        let _removed = self.stalled.lock().remove(peer);
    }
}

#[async_trait]
impl BlockNodeTransport for LoopbackTransport {
    async fn connect(&self, peer: &PeerDescriptor) -> Result<StreamPair, BlockStreamError> {
        if self.refused.lock().contains(peer) {
            return Err(BlockStreamError::transport(format!(
                "connection refused by {peer}"
            )));
        }

        let stalled = self.stalled.lock().contains(peer);
        if stalled {
            debug!(%peer, "Loopback handshake stalled");
            future::pending::<()>().await;
        }

        let (frames, requests) = mpsc::unbounded_channel();
        let (responder, responses) = mpsc::channel(RESPONSE_CAPACITY);

        self.sessions
            .send(NodeSession {
                peer: peer.clone(),
                requests,
                responder,
            })
            .map_err(|_| BlockStreamError::transport(format!("{peer} is not listening")))?;

        debug!(%peer, "Loopback stream opened");

        Ok(StreamPair {
            requests: Box::new(LoopbackRequests {
                frames: Some(frames),
            }),
            responses,
        })
    }
}

#[derive(Debug)]
struct LoopbackRequests {
    frames: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[async_trait]
impl RequestStream for LoopbackRequests {
    async fn send(&mut self, request: PublishRequest) -> Result<(), BlockStreamError> {
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| BlockStreamError::illegal("request stream already completed"))?;

        frames
            .send(request.encode()?)
            .map_err(|_| BlockStreamError::transport("block node hung up"))
    }

    async fn complete(&mut self) -> Result<(), BlockStreamError> {
        self.frames
            .take()
            .map(drop)
            .ok_or_else(|| BlockStreamError::illegal("request stream already completed"))
    }
}

/// Block node side of a loopback stream.
#[derive(Debug)]
pub struct NodeSession {
    peer: PeerDescriptor,
    requests: mpsc::UnboundedReceiver<Vec<u8>>,
    responder: mpsc::Sender<Result<InboundMessage, BlockStreamError>>,
}

impl NodeSession {
    #[must_use]
    pub const fn peer(&self) -> &PeerDescriptor {
        &self.peer
    }

    /// Next request, or `None` once the publisher completed its half.
    pub async fn next_request(&mut self) -> Option<Result<PublishRequest, BlockStreamError>> {
        let frame = self.requests.recv().await?;
        Some(PublishRequest::decode(&frame))
    }

    /// Sends a response, returns `false` if the publisher stopped listening.
    pub async fn respond(&self, message: InboundMessage) -> bool {
        self.responder.send(Ok(message)).await.is_ok()
    }

    /// Fails the response stream with a transport error.
    pub async fn fail(&self, reason: &str) -> bool {
        self.responder
            .send(Err(BlockStreamError::transport(reason)))
            .await
            .is_ok()
    }

    /// Whether the publisher completed its half of the stream.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.requests.is_closed() && self.requests.is_empty()
    }
}
