use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch, Notify, RwLock};

use crate::blockchain::ledger::ChainTip;
use crate::blockchain::{
    pow, Block, BlockHeader, Keypair, SharedLedger, Transaction, GENESIS_PREV_HASH,
};

use super::pool::Mempool;

/// Mining parameters
#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Value of the reward transaction in every mined block
    pub block_reward: u64,

    /// Leading zero bits every mined header must reach
    pub difficulty: u32,
}

/// Where the orchestrator is within one search cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerState {
    Idle,
    Assembling,
    Searching,
}

impl fmt::Display for MinerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MinerState::Idle => write!(f, "idle"),
            MinerState::Assembling => write!(f, "assembling"),
            MinerState::Searching => write!(f, "searching"),
        }
    }
}

/// A block awaiting its nonce, with the tip it was built on
struct Candidate {
    header: BlockHeader,
    txs: Vec<Transaction>,
    tip: ChainTip,
}

/// A proof-of-work search running on its own thread.
///
/// Dropping the handle raises the stop flag, so the thread winds down even
/// when the orchestrator future itself is dropped.
struct SearchHandle {
    stop: Arc<AtomicBool>,
    result: oneshot::Receiver<Option<BlockHeader>>,
}

impl SearchHandle {
    fn spawn(mut header: BlockHeader, difficulty: u32) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, result) = oneshot::channel();
        let flag = stop.clone();

        std::thread::Builder::new()
            .name("pow-search".to_string())
            .spawn(move || {
                let found = pow::search_until(&mut header, difficulty, &flag).map(|_| header);
                // The receiver is gone when the search was cancelled.
                let _ = tx.send(found);
            })?;

        Ok(SearchHandle { stop, result })
    }
}

impl Drop for SearchHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

struct MinerInner {
    ledger: SharedLedger,
    pool: RwLock<Mempool>,
    keypair: Keypair,
    config: MinerConfig,
    restart: Notify,
    state: watch::Sender<MinerState>,
    mined: mpsc::UnboundedSender<Block>,
}

/// The mining orchestrator.
///
/// Owns the pending pool, assembles candidate blocks, runs the proof of work
/// on a background thread and restarts the search whenever its inputs change.
/// Cloning yields another handle to the same orchestrator.
#[derive(Clone)]
pub struct Miner {
    inner: Arc<MinerInner>,
}

impl Miner {
    /// Creates a miner; blocks it mines are published on the returned receiver
    ///
    /// # Arguments
    ///
    /// * `ledger` - The ledger mined blocks are submitted to
    /// * `keypair` - Signs mined blocks and receives the block reward
    /// * `config` - Block reward and difficulty
    pub fn new(
        ledger: SharedLedger,
        keypair: Keypair,
        config: MinerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Block>) {
        let (mined, mined_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(MinerState::Idle);

        let miner = Miner {
            inner: Arc::new(MinerInner {
                ledger,
                pool: RwLock::new(Mempool::new()),
                keypair,
                config,
                restart: Notify::new(),
                state,
                mined,
            }),
        };

        (miner, mined_rx)
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.inner.ledger
    }

    pub fn state(&self) -> MinerState {
        *self.inner.state.borrow()
    }

    #[cfg(test)]
    pub fn subscribe_state(&self) -> watch::Receiver<MinerState> {
        self.inner.state.subscribe()
    }

    pub async fn pending_transactions(&self) -> Vec<Transaction> {
        self.inner.pool.read().await.transactions().to_vec()
    }

    /// Validates `tx` against the ledger's UTXO set and the pool; on success
    /// pools it and restarts the search.
    ///
    /// # Returns
    ///
    /// Whether the transaction was accepted. Rejections leave the pool as it was.
    pub async fn add_transaction(&self, tx: Transaction) -> bool {
        let ledger = self.inner.ledger.read().await;
        let mut pool = self.inner.pool.write().await;
        let nonce = tx.tx_nonce.clone();

        match pool.admit(tx, ledger.utxo_set()) {
            Ok(()) => {
                info!("Accepted transaction {} ({} pending)", nonce, pool.len());
                self.request_restart();
                true
            }
            Err(e) => {
                info!("Rejected transaction {}: {}", nonce, e);
                false
            }
        }
    }

    /// Validates and stores a block produced elsewhere, then prunes the pool
    /// and restarts the search.
    ///
    /// # Returns
    ///
    /// Whether the block was accepted
    pub async fn submit_block(&self, block: Block) -> bool {
        let mut ledger = self.inner.ledger.write().await;
        let mut pool = self.inner.pool.write().await;
        let hash = block.hash();

        if let Err(e) = ledger.submit_block(block.clone()) {
            debug!("Rejected block {}: {}", hash, e);
            return false;
        }

        let removed = pool.reconcile(&block, ledger.utxo_set());
        info!(
            "Accepted block {} at height {} ({} pending transactions retired)",
            hash, block.height, removed
        );

        drop(pool);
        drop(ledger);
        self.request_restart();
        true
    }

    /// Cancels the in-flight search; the next cycle picks up fresh inputs
    pub fn request_restart(&self) {
        self.inner.restart.notify_one();
    }

    /// Mines forever: assemble, search, submit, repeat
    pub async fn run(self) {
        info!(
            "Mining to {} at difficulty {} with reward {}",
            self.inner.keypair.address(),
            self.inner.config.difficulty,
            self.inner.config.block_reward
        );

        loop {
            self.set_state(MinerState::Assembling);
            let candidate = self.assemble().await;

            let mut search = match SearchHandle::spawn(candidate.header.clone(), self.inner.config.difficulty) {
                Ok(search) => search,
                Err(e) => {
                    error!("Failed to start proof of work thread: {}", e);
                    self.set_state(MinerState::Idle);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            self.set_state(MinerState::Searching);

            tokio::select! {
                found = &mut search.result => {
                    match found {
                        Ok(Some(header)) => self.complete(candidate, header).await,
                        _ => warn!("Proof of work thread ended without a result"),
                    }
                    self.set_state(MinerState::Idle);
                }
                _ = self.inner.restart.notified() => {
                    debug!("Search on top of {:?} cancelled", candidate.tip.header_hash);
                }
            }
        }
    }

    fn set_state(&self, state: MinerState) {
        debug!("Miner {}", state);
        self.inner.state.send_replace(state);
    }

    /// Reward transaction plus a snapshot of the pool, on top of the current tip
    async fn assemble(&self) -> Candidate {
        let ledger = self.inner.ledger.read().await;
        let pool = self.inner.pool.read().await;
        let tip = ledger.latest_metadata();

        let mut txs = vec![Transaction::reward(
            self.inner.keypair.address().clone(),
            self.inner.config.block_reward,
        )];
        txs.extend(pool.transactions().iter().cloned());

        let prev = tip
            .header_hash
            .clone()
            .unwrap_or_else(|| GENESIS_PREV_HASH.to_string());
        let header = BlockHeader::new(prev, Block::compute_hash_txs(&txs), self.inner.config.difficulty);

        Candidate { header, txs, tip }
    }

    /// Seals a solved candidate and submits it unless the tip moved meanwhile
    async fn complete(&self, candidate: Candidate, header: BlockHeader) {
        let height = candidate.tip.height.map_or(0, |height| height + 1);
        let block = Block::sealed(header, candidate.txs, height, &self.inner.keypair);
        let hash = block.hash();

        let mut ledger = self.inner.ledger.write().await;
        let mut pool = self.inner.pool.write().await;
        if ledger.latest_metadata() != candidate.tip {
            debug!("Discarding block {} mined on a stale tip", hash);
            return;
        }

        if let Err(e) = ledger.submit_block(block.clone()) {
            warn!("Mined block {} was rejected: {}", hash, e);
            return;
        }

        let retired = pool.reconcile(&block, ledger.utxo_set());
        info!(
            "Mined block {} at height {} ({} pending transactions retired)",
            hash, block.height, retired
        );

        // Nobody listening just means nothing gets broadcast.
        let _ = self.inner.mined.send(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::test_utils::{build_block, transfer};
    use crate::blockchain::Ledger;

    fn miner_with(difficulty: u32, keypair: &Keypair) -> (Miner, mpsc::UnboundedReceiver<Block>) {
        Miner::new(
            Ledger::new(0).into_shared(),
            keypair.clone(),
            MinerConfig {
                block_reward: 50,
                difficulty,
            },
        )
    }

    async fn next_block(rx: &mut mpsc::UnboundedReceiver<Block>) -> Block {
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for a mined block")
            .expect("miner dropped its channel")
    }

    #[tokio::test]
    async fn test_mines_genesis_on_empty_ledger() {
        let alice = Keypair::generate();
        let (miner, mut mined) = miner_with(4, &alice);
        let task = tokio::spawn(miner.clone().run());

        let genesis = next_block(&mut mined).await;
        task.abort();

        assert_eq!(genesis.height, 0);
        assert!(genesis.header.is_genesis());
        assert!(pow::meets_difficulty(&genesis.header, 4));

        let ledger = miner.ledger().read().await;
        assert!(ledger.block_exists(&genesis.hash()));
        assert_eq!(ledger.canonical_hash_at(0), Some(genesis.hash().as_str()));
        assert_eq!(ledger.supply() % 50, 0);
    }

    #[tokio::test]
    async fn test_transfer_end_to_end() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let (miner, mut mined) = miner_with(4, &alice);
        let task = tokio::spawn(miner.clone().run());

        let genesis = next_block(&mut mined).await;
        assert_eq!(genesis.height, 0);

        let tx = transfer(&alice, &genesis.txs[0], 0, &[(&bob, 20), (&alice, 30)]);
        assert!(miner.add_transaction(tx.clone()).await);

        loop {
            let block = next_block(&mut mined).await;
            if block.txs.contains(&tx) {
                break;
            }
        }
        task.abort();

        let ledger = miner.ledger().read().await;
        let height = ledger.latest_metadata().height.unwrap();

        assert_eq!(ledger.supply_for(bob.address()), 20);
        // Every block after genesis paid alice another reward.
        assert_eq!(ledger.supply_for(alice.address()), 30 + 50 * height);
        assert_eq!(ledger.supply(), 50 * (height + 1));
        assert!(miner.pending_transactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_transaction_leaves_pool_untouched() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let (miner, _mined) = miner_with(4, &alice);

        let genesis = build_block(None, &alice, Vec::new(), 50);
        assert!(miner.submit_block(genesis.clone()).await);

        let overspend = transfer(&alice, &genesis.txs[0], 0, &[(&bob, 70)]);
        assert!(!miner.add_transaction(overspend).await);

        let forged = transfer(&bob, &genesis.txs[0], 0, &[(&bob, 50)]);
        assert!(!miner.add_transaction(forged).await);

        assert!(miner.pending_transactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_candidate_includes_pool_and_tip() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let (miner, _mined) = miner_with(4, &alice);

        let empty = miner.assemble().await;
        assert!(empty.header.is_genesis());
        assert_eq!(empty.tip, ChainTip::default());
        assert_eq!(empty.txs.len(), 1);
        assert!(empty.txs[0].is_reward());

        let genesis = build_block(None, &alice, Vec::new(), 50);
        assert!(miner.submit_block(genesis.clone()).await);
        let tx = transfer(&alice, &genesis.txs[0], 0, &[(&bob, 50)]);
        assert!(miner.add_transaction(tx.clone()).await);

        let candidate = miner.assemble().await;
        assert_eq!(candidate.header.hash_prev_header, genesis.hash());
        assert_eq!(candidate.header.bits, 4);
        assert_eq!(candidate.tip.height, Some(0));
        assert_eq!(candidate.txs[1], tx);
        assert_eq!(candidate.header.hash_txs, Block::compute_hash_txs(&candidate.txs));
    }

    #[tokio::test]
    async fn test_stale_result_is_discarded() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let (miner, mut mined) = miner_with(0, &alice);

        let candidate = miner.assemble().await;

        // A peer block lands while the search is running.
        let peer_genesis = build_block(None, &bob, Vec::new(), 50);
        assert!(miner.submit_block(peer_genesis.clone()).await);

        let mut header = candidate.header.clone();
        pow::search(&mut header, 0);
        miner.complete(candidate, header).await;

        let ledger = miner.ledger().read().await;
        assert_eq!(ledger.block_count(), 1);
        assert_eq!(ledger.canonical_chain(), vec![peer_genesis]);
        assert!(mined.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_new_transaction_restarts_search() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        // Far too hard to finish during the test.
        let (miner, _mined) = miner_with(200, &alice);

        // Straight into the ledger, so no restart is queued before the run starts.
        let genesis = build_block(None, &alice, Vec::new(), 50);
        miner.ledger().write().await.submit_block(genesis.clone()).unwrap();

        let mut states = miner.subscribe_state();
        let task = tokio::spawn(miner.clone().run());

        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == MinerState::Searching))
            .await
            .expect("miner never started searching")
            .expect("state channel closed");

        let tx = transfer(&alice, &genesis.txs[0], 0, &[(&bob, 50)]);
        assert!(miner.add_transaction(tx).await);

        tokio::time::timeout(Duration::from_secs(5), states.changed())
            .await
            .expect("search was not restarted")
            .expect("state channel closed");
        task.abort();
    }

    #[tokio::test]
    async fn test_peer_block_restarts_search() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let (miner, _mined) = miner_with(200, &alice);

        let genesis = build_block(None, &alice, Vec::new(), 50);
        miner.ledger().write().await.submit_block(genesis.clone()).unwrap();

        let mut states = miner.subscribe_state();
        let task = tokio::spawn(miner.clone().run());

        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == MinerState::Searching))
            .await
            .expect("miner never started searching")
            .expect("state channel closed");

        let peer_block = build_block(Some(&genesis), &bob, Vec::new(), 50);
        assert!(miner.submit_block(peer_block.clone()).await);

        tokio::time::timeout(Duration::from_secs(5), states.changed())
            .await
            .expect("search was not restarted")
            .expect("state channel closed");
        task.abort();

        let candidate = miner.assemble().await;
        assert_eq!(candidate.header.hash_prev_header, peer_block.hash());
        assert_eq!(candidate.tip.height, Some(1));
    }
}
