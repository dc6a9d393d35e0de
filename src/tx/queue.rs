//! Serialized payout submission, one queue per destination chain
//!
//! Each destination chain gets one consumer task fed by an unbounded
//! channel. The consumer owns that chain's [`NonceCursor`] and calls the
//! backend for one job at a time, so two payouts from the same maker can
//! never race for a nonce. Jobs are processed in the order they were
//! enqueued; the next job starts as soon as the previous send call returns.

use super::nonce::NonceCursor;
use crate::error::{RelayerError, RelayerResult};
use crate::retry::{PollStatus, Poller};
use crate::state::TransactionIdentity;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, U256};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// One payout to make
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub identity: TransactionIdentity,
    pub chain_id: u64,
    pub maker: Address,
    pub recipient: Address,
    /// Zero address for the native token
    pub token: Address,
    pub amount: U256,
}

/// A payout that reached the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransfer {
    pub tx_hash: String,
    /// Amount actually sent; rollups may round it down
    pub amount: U256,
    pub nonce: u64,
}

/// A payout attempt that failed
#[derive(Debug)]
pub struct SendFailure {
    pub error: RelayerError,
    /// Set when the nonce may already be known to the network and must be
    /// reused by the next attempt
    pub reusable_nonce: Option<u64>,
}

impl SendFailure {
    /// Failed before anything was broadcast; the nonce is still free
    pub fn before_broadcast(error: RelayerError) -> Self {
        Self {
            error,
            reusable_nonce: None,
        }
    }

    pub fn at_broadcast(error: RelayerError, nonce: u64) -> Self {
        Self {
            error,
            reusable_nonce: Some(nonce),
        }
    }
}

pub type SendOutcome = Result<SentTransfer, SendFailure>;

/// Executes payouts for the queues
#[async_trait]
pub trait SendBackend: Send + Sync {
    /// One-time account setup, run before the nonce is resolved
    async fn prepare(&self, _request: &SendRequest) -> RelayerResult<()> {
        Ok(())
    }

    /// Next nonce according to the chain
    async fn live_nonce(&self, chain_id: u64, maker: Address) -> RelayerResult<u64>;

    async fn send(&self, request: &SendRequest, nonce: u64) -> SendOutcome;
}

struct SendJob {
    request: SendRequest,
    reuse_nonce: Option<u64>,
    reply: oneshot::Sender<SendOutcome>,
}

/// Handle to one chain's queue
#[derive(Clone)]
pub struct ChainSendQueue {
    chain_id: u64,
    jobs: mpsc::UnboundedSender<SendJob>,
}

impl ChainSendQueue {
    /// Start the consumer task for `chain_id`
    pub fn spawn(chain_id: u64, backend: Arc<dyn SendBackend>, poller: Poller) -> Self {
        let (jobs, receiver) = mpsc::unbounded_channel();
        let consumer = QueueConsumer {
            chain_id,
            backend,
            poller,
            cursor: NonceCursor::new(chain_id),
        };
        tokio::spawn(consumer.run(receiver));
        info!("Send queue started for chain {}", chain_id);

        Self { chain_id, jobs }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Append a payout; the receiver resolves once it has been sent or has
    /// failed. `reuse_nonce` skips nonce resolution.
    pub fn enqueue(
        &self,
        request: SendRequest,
        reuse_nonce: Option<u64>,
    ) -> RelayerResult<oneshot::Receiver<SendOutcome>> {
        let (reply, outcome) = oneshot::channel();
        self.jobs
            .send(SendJob {
                request,
                reuse_nonce,
                reply,
            })
            .map_err(|_| {
                RelayerError::Internal(format!("send queue for chain {} is closed", self.chain_id))
            })?;
        crate::metrics::record_queue_enqueued(self.chain_id);
        Ok(outcome)
    }

    /// Enqueue and wait for the send call to return
    pub async fn send(&self, request: SendRequest, reuse_nonce: Option<u64>) -> SendOutcome {
        let outcome = self
            .enqueue(request, reuse_nonce)
            .map_err(SendFailure::before_broadcast)?;
        outcome.await.unwrap_or_else(|_| {
            Err(SendFailure::before_broadcast(RelayerError::Internal(format!(
                "send queue for chain {} dropped a job",
                self.chain_id
            ))))
        })
    }
}

struct QueueConsumer {
    chain_id: u64,
    backend: Arc<dyn SendBackend>,
    poller: Poller,
    cursor: NonceCursor,
}

impl QueueConsumer {
    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<SendJob>) {
        while let Some(job) = jobs.recv().await {
            crate::metrics::record_queue_dequeued(self.chain_id);
            let outcome = self.process(&job.request, job.reuse_nonce).await;
            if job.reply.send(outcome).is_err() {
                debug!(
                    "Caller for {} on chain {} went away before the send returned",
                    job.request.identity, self.chain_id
                );
            }
        }
        debug!("Send queue for chain {} closed", self.chain_id);
    }

    async fn process(&mut self, request: &SendRequest, reuse_nonce: Option<u64>) -> SendOutcome {
        if let Err(error) = self.backend.prepare(request).await {
            return Err(SendFailure {
                error,
                reusable_nonce: reuse_nonce,
            });
        }

        if let Some(nonce) = reuse_nonce {
            info!(
                "Resending {} on chain {} with stored nonce {}",
                request.identity, self.chain_id, nonce
            );
            return self.backend.send(request, nonce).await.map_err(|mut failure| {
                failure.reusable_nonce = Some(nonce);
                failure
            });
        }

        let live_nonce = self.live_nonce(request.maker).await.map_err(SendFailure::before_broadcast)?;
        let assignment = self.cursor.resolve(request.maker, live_nonce);

        match self.backend.send(request, assignment.nonce).await {
            Ok(sent) => Ok(sent),
            Err(failure) => {
                if failure.reusable_nonce.is_none() {
                    self.cursor.rollback(request.maker, assignment);
                }
                warn!(
                    "Send of {} on chain {} with nonce {} failed: {}",
                    request.identity, self.chain_id, assignment.nonce, failure.error
                );
                Err(failure)
            }
        }
    }

    async fn live_nonce(&self, maker: Address) -> RelayerResult<u64> {
        let backend = &*self.backend;
        let chain_id = self.chain_id;
        let label = format!("nonce lookup for {:?} on chain {}", maker, chain_id);

        self.poller
            .poll_until(&label, || async move {
                backend.live_nonce(chain_id, maker).await.map(PollStatus::Ready)
            })
            .await
    }
}

/// Lazily started queues, one per destination chain
pub struct SendQueues {
    queues: DashMap<u64, ChainSendQueue>,
    backend: Arc<dyn SendBackend>,
    poller: Poller,
}

impl SendQueues {
    pub fn new(backend: Arc<dyn SendBackend>, poller: Poller) -> Self {
        Self {
            queues: DashMap::new(),
            backend,
            poller,
        }
    }

    pub fn queue(&self, chain_id: u64) -> ChainSendQueue {
        self.queues
            .entry(chain_id)
            .or_insert_with(|| {
                ChainSendQueue::spawn(chain_id, self.backend.clone(), self.poller.clone())
            })
            .clone()
    }
}
