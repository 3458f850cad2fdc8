use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::blockchain::{Block, ChainTip, Transaction};
use crate::mining::Miner;

use super::client::{NetworkError, PeerClient};
use super::peers::NodeList;

/// Errors that can occur while synchronizing with peers
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("No known peers to query")]
    NoPeers,

    #[error("Peers did not agree on {what} after {rounds} rounds")]
    NoQuorum { what: String, rounds: u32 },

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

/// How quorum reads sample and retry
#[derive(Debug, Clone)]
pub struct QuorumPolicy {
    /// Peers asked per round; all of them must agree
    pub sample_size: usize,

    /// Rounds attempted before giving up
    pub max_rounds: u32,

    /// Limit on each individual peer request
    pub request_timeout: Duration,

    /// Pause after failed round `n` is `n * backoff`
    pub backoff: Duration,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        QuorumPolicy {
            sample_size: 3,
            max_rounds: 5,
            request_timeout: Duration::from_secs(3),
            backoff: Duration::from_millis(100),
        }
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Highest height at which the local chain and the network agree
    pub fork_height: Option<u64>,

    pub fetched: usize,

    pub accepted: usize,
}

/// Keeps the local ledger in step with the network and spreads local work.
///
/// Reads that decide what the network believes go through a quorum: a random
/// sample of peers is asked the same question and the answer only counts when
/// every sampled peer gives it.
#[derive(Clone)]
pub struct Synchronizer {
    client: Arc<dyn PeerClient>,
    nodes: NodeList,
    miner: Miner,
    policy: QuorumPolicy,
}

impl Synchronizer {
    pub fn new(client: Arc<dyn PeerClient>, nodes: NodeList, miner: Miner, policy: QuorumPolicy) -> Self {
        Synchronizer {
            client,
            nodes,
            miner,
            policy,
        }
    }

    pub fn nodes(&self) -> &NodeList {
        &self.nodes
    }

    /// Learns the network from `seed` and announces this node to every new peer.
    ///
    /// An unreachable seed is not fatal; the node carries on with whatever it
    /// already knows.
    ///
    /// # Returns
    ///
    /// The number of peers added
    pub async fn bootstrap(&self, seed: &str) -> usize {
        let listed = match self.client.node_list(seed).await {
            Ok(listed) => listed,
            Err(e) => {
                warn!("Seed node {} unreachable, continuing with local node set: {}", seed, e);
                return 0;
            }
        };

        let added: Vec<String> = std::iter::once(seed.to_string())
            .chain(listed)
            .filter(|node| self.nodes.add(node))
            .collect();

        let own = self.nodes.own_address();
        let announcements = added.iter().map(|node| async move {
            if let Err(e) = self.client.join(node, own).await {
                debug!("Could not announce ourselves to {}: {}", node, e);
            }
        });
        join_all(announcements).await;

        info!("Bootstrapped from {}: {} new peers, {} known", seed, added.len(), self.nodes.len());
        added.len()
    }

    /// The canonical tip every sampled peer agrees on
    pub async fn network_tip(&self) -> Result<ChainTip, SyncError> {
        self.quorum("latest block", |client, node| async move {
            client.latest_block(&node).await
        })
        .await
    }

    /// Header hash of the network's canonical block at `height`
    pub async fn network_hash_at(&self, height: u64) -> Result<String, SyncError> {
        self.quorum(&format!("block {}", height), move |client, node| async move {
            let blocks = client.block_range(&node, height, height).await?;
            match blocks.as_slice() {
                [block] => Ok(block.hash()),
                _ => Err(NetworkError::BadResponse {
                    node,
                    reason: format!("expected exactly one block at height {}", height),
                }),
            }
        })
        .await
    }

    /// Issues `read` to a random sample of peers at once and accepts the answer
    /// only when all of them return it. Any error, timeout or disagreement
    /// fails the round; rounds are retried with a growing pause up to the
    /// policy's limit.
    async fn quorum<T, F, Fut>(&self, what: &str, read: F) -> Result<T, SyncError>
    where
        T: PartialEq,
        F: Fn(Arc<dyn PeerClient>, String) -> Fut,
        Fut: Future<Output = Result<T, NetworkError>>,
    {
        let timeout = self.policy.request_timeout;

        for round in 1..=self.policy.max_rounds {
            let sample = self.nodes.sample(self.policy.sample_size);
            if sample.is_empty() {
                return Err(SyncError::NoPeers);
            }
            if sample.len() < self.policy.sample_size {
                warn!(
                    "Only {} of {} quorum peers known; {} rests on {:?}",
                    sample.len(),
                    self.policy.sample_size,
                    what,
                    sample
                );
            }

            let requests = sample.iter().map(|node| {
                let request = read(self.client.clone(), node.clone());
                async move {
                    match tokio::time::timeout(timeout, request).await {
                        Ok(reply) => reply,
                        Err(_) => Err(NetworkError::Timeout(node.clone())),
                    }
                }
            });
            let replies = join_all(requests).await;

            match unanimous(replies) {
                Ok(answer) => return Ok(answer),
                Err(reason) => {
                    warn!("Quorum round {} on {} failed ({:?}): {}", round, what, sample, reason);
                    tokio::time::sleep(self.policy.backoff * round).await;
                }
            }
        }

        Err(SyncError::NoQuorum {
            what: what.to_string(),
            rounds: self.policy.max_rounds,
        })
    }

    /// Brings the local ledger up to the network's agreed tip.
    ///
    /// Walks back from the highest height both sides could share until a
    /// quorum-confirmed block matches the local canonical chain, then fetches
    /// everything above that fork point from a single peer and submits it in
    /// height order. Fetched blocks are validated locally like any other.
    pub async fn reconcile(&self) -> Result<SyncReport, SyncError> {
        let foreign = self.network_tip().await?;
        let (foreign_height, foreign_hash) = match (foreign.height, foreign.header_hash) {
            (Some(height), Some(hash)) => (height, hash),
            _ => return Ok(SyncReport::default()),
        };

        let local_height = {
            let ledger = self.miner.ledger().read().await;
            if ledger.block_exists(&foreign_hash) {
                return Ok(SyncReport::default());
            }
            ledger.latest_metadata().height
        };

        // Longest known chain wins; a network tip no taller than ours changes nothing.
        if matches!(local_height, Some(local) if local >= foreign_height) {
            return Ok(SyncReport::default());
        }

        let fork_height = match local_height {
            Some(local) => self.find_fork(local.min(foreign_height)).await?,
            None => None,
        };

        let from = fork_height.map_or(0, |height| height + 1);
        let source = self.nodes.sample(1).pop().ok_or(SyncError::NoPeers)?;
        let blocks = tokio::time::timeout(
            self.policy.request_timeout,
            self.client.block_range(&source, from, foreign_height),
        )
        .await
        .map_err(|_| NetworkError::Timeout(source.clone()))??;

        let mut report = SyncReport {
            fork_height,
            fetched: blocks.len(),
            accepted: 0,
        };

        for block in blocks {
            if self.miner.ledger().read().await.block_exists(&block.hash()) {
                continue;
            }
            let height = block.height;
            if !self.miner.submit_block(block).await {
                warn!("Block at height {} from {} was rejected, stopping sync batch", height, source);
                break;
            }
            report.accepted += 1;
        }

        info!(
            "Synced from {}: fork at {:?}, {} fetched, {} accepted",
            source, report.fork_height, report.fetched, report.accepted
        );
        Ok(report)
    }

    /// Highest height at or below `start` where the network's block matches ours
    async fn find_fork(&self, start: u64) -> Result<Option<u64>, SyncError> {
        let mut height = start;

        loop {
            let foreign = self.network_hash_at(height).await?;
            let matches = self
                .miner
                .ledger()
                .read()
                .await
                .canonical_hash_at(height)
                == Some(foreign.as_str());

            if matches {
                return Ok(Some(height));
            }
            if height == 0 {
                return Ok(None);
            }
            height -= 1;
        }
    }

    /// Posts `block` to every known peer; failures are ignored
    ///
    /// # Returns
    ///
    /// How many peers accepted it
    pub async fn broadcast_block(&self, block: &Block) -> usize {
        let sends = self.nodes.nodes().into_iter().map(|node| async move {
            match self.client.send_block(&node, block).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!("Broadcast of block to {} failed: {}", node, e);
                    false
                }
            }
        });

        join_all(sends).await.into_iter().filter(|accepted| *accepted).count()
    }

    /// Posts `tx` to every known peer; failures are ignored
    pub async fn broadcast_transaction(&self, tx: &Transaction) -> usize {
        let sends = self.nodes.nodes().into_iter().map(|node| async move {
            match self.client.send_transaction(&node, tx).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!("Broadcast of transaction to {} failed: {}", node, e);
                    false
                }
            }
        });

        join_all(sends).await.into_iter().filter(|accepted| *accepted).count()
    }

    /// Reconciles with the network every `interval`
    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;
            match self.reconcile().await {
                Ok(report) if report.fetched > 0 => {}
                Ok(_) => debug!("Already in step with the network"),
                Err(SyncError::NoPeers) => debug!("No peers to sync with"),
                Err(e) => warn!("Sync failed: {}", e),
            }
        }
    }

    /// Broadcasts every block the miner produces
    pub async fn relay_mined(self, mut mined: mpsc::UnboundedReceiver<Block>) {
        while let Some(block) = mined.recv().await {
            let accepted = self.broadcast_block(&block).await;
            debug!("Mined block {} accepted by {} peers", block.hash(), accepted);
        }
    }
}

/// The common answer when every reply succeeded and all are equal
fn unanimous<T: PartialEq>(replies: Vec<Result<T, NetworkError>>) -> Result<T, String> {
    let mut answers = Vec::with_capacity(replies.len());
    for reply in replies {
        answers.push(reply.map_err(|e| e.to_string())?);
    }

    let mut answers = answers.into_iter();
    let first = answers.next().ok_or_else(|| "no replies".to_string())?;
    if answers.any(|answer| answer != first) {
        return Err("peers disagree".to_string());
    }
    Ok(first)
}
