//! Shared fixtures for the crate's tests: scripted `Mining` and
//! `BlockTemplate` collaborators, plus minimal block builders.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex as StdMutex},
};

use async_channel::Receiver;
use async_trait::async_trait;
use tokio::sync::Notify;
use stratum_common::bitcoin::{
    blockdata::block::BlockHeader,
    hash_types::TxMerkleNode,
    hashes::{sha256d, Hash},
    Block, BlockHash, OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};

use crate::mining::{BlockCreateOptions, BlockRef, BlockTemplate, BlockWaitOptions, Mining};

pub(crate) const WITNESS_RESERVE: [u8; 32] = [0x11; 32];

pub(crate) fn block_hash(byte: u8) -> BlockHash {
    BlockHash::from_inner([byte; 32])
}

pub(crate) fn coinbase_tx(with_witness: bool) -> Transaction {
    let witness = if with_witness {
        Witness::from_vec(vec![WITNESS_RESERVE.to_vec()])
    } else {
        Witness::from_vec(vec![])
    };
    let mut output = vec![TxOut {
        value: 625_000_000,
        script_pubkey: Script::new(),
    }];
    if with_witness {
        // Commitment output, zero valued.
        output.push(TxOut {
            value: 0,
            script_pubkey: Script::from(vec![0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed]),
        });
    }
    Transaction {
        version: 2,
        lock_time: PackedLockTime(0),
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Script::from(vec![0x03, 0x4c, 0xa3, 0x26]),
            sequence: Sequence(0xffff_ffff),
            witness,
        }],
        output,
    }
}

pub(crate) fn spend_tx(tag: u32) -> Transaction {
    Transaction {
        version: 2,
        lock_time: PackedLockTime(tag),
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_inner([0xee; 32]),
                vout: 0,
            },
            script_sig: Script::new(),
            sequence: Sequence(0xffff_fffe),
            witness: Witness::from_vec(vec![]),
        }],
        output: vec![TxOut {
            value: 50_000,
            script_pubkey: Script::new(),
        }],
    }
}

pub(crate) fn block_with_txs(prev_hash: BlockHash, txdata: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            version: 0x2000_0000,
            prev_blockhash: prev_hash,
            merkle_root: TxMerkleNode::from_inner([0; 32]),
            time: 1_700_000_000,
            bits: 0x1d00_ffff,
            nonce: 0,
        },
        txdata,
    }
}

pub(crate) struct MockBlockTemplate {
    block: Block,
    next: Receiver<Arc<dyn BlockTemplate>>,
    pub(crate) submitted: StdMutex<Vec<(u32, u32, u32)>>,
}

/// A template whose `wait_next` never yields a better template.
pub(crate) fn mock_template(block: Block) -> Arc<MockBlockTemplate> {
    let (_sender, receiver) = async_channel::unbounded();
    mock_template_with_next(block, receiver)
}

/// A template that yields whatever the test scripts onto `next`.
pub(crate) fn mock_template_with_next(
    block: Block,
    next: Receiver<Arc<dyn BlockTemplate>>,
) -> Arc<MockBlockTemplate> {
    Arc::new(MockBlockTemplate {
        block,
        next,
        submitted: StdMutex::new(Vec::new()),
    })
}

pub(crate) fn mock_template_with_prev_hash(prev_hash: BlockHash) -> Arc<dyn BlockTemplate> {
    mock_template(block_with_txs(prev_hash, vec![coinbase_tx(false)]))
}

#[async_trait]
impl BlockTemplate for MockBlockTemplate {
    fn block_header(&self) -> BlockHeader {
        self.block.header
    }

    fn block(&self) -> Block {
        self.block.clone()
    }

    fn coinbase_tx(&self) -> Transaction {
        self.block.txdata[0].clone()
    }

    fn coinbase_merkle_path(&self) -> Vec<sha256d::Hash> {
        match self.block.txdata.len() {
            0 | 1 => Vec::new(),
            2 => vec![self.block.txdata[1].txid().as_hash()],
            _ => panic!("mock supports at most one non-coinbase transaction"),
        }
    }

    fn witness_commitment_index(&self) -> Option<usize> {
        if self.block.txdata[0].output.len() > 1 {
            Some(1)
        } else {
            None
        }
    }

    async fn wait_next(&self, options: BlockWaitOptions) -> Option<Arc<dyn BlockTemplate>> {
        match options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.next.recv()).await {
                Ok(Ok(template)) => Some(template),
                _ => None,
            },
            None => self.next.recv().await.ok(),
        }
    }

    async fn submit_solution(
        &self,
        version: u32,
        header_timestamp: u32,
        header_nonce: u32,
        _coinbase_tx: Transaction,
    ) -> bool {
        self.submitted
            .lock()
            .unwrap()
            .push((version, header_timestamp, header_nonce));
        true
    }
}

/// Fee state shared between a chain of [`FeeMockTemplate`]s: the current
/// best assembly candidate and a wakeup for waiters.
pub(crate) struct MockMempool {
    best: StdMutex<Option<Arc<FeeMockTemplate>>>,
    notify: Notify,
}

impl MockMempool {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            best: StdMutex::new(None),
            notify: Notify::new(),
        })
    }

    /// Makes `template` the best assembly candidate and wakes waiters.
    pub(crate) fn publish(&self, template: Arc<FeeMockTemplate>) {
        *self.best.lock().unwrap() = Some(template);
        self.notify.notify_waiters();
    }
}

/// A template with an explicit aggregate fee level. `wait_next` only yields
/// the mempool's best candidate for a tip change, or for a fee improvement
/// that meets the requested threshold; a disabled threshold holds fee-only
/// candidates back until the timeout.
pub(crate) struct FeeMockTemplate {
    block: Block,
    fees: u64,
    mempool: Arc<MockMempool>,
}

pub(crate) fn fee_template(
    block: Block,
    fees: u64,
    mempool: Arc<MockMempool>,
) -> Arc<FeeMockTemplate> {
    Arc::new(FeeMockTemplate {
        block,
        fees,
        mempool,
    })
}

#[async_trait]
impl BlockTemplate for FeeMockTemplate {
    fn block_header(&self) -> BlockHeader {
        self.block.header
    }

    fn block(&self) -> Block {
        self.block.clone()
    }

    fn coinbase_tx(&self) -> Transaction {
        self.block.txdata[0].clone()
    }

    fn coinbase_merkle_path(&self) -> Vec<sha256d::Hash> {
        Vec::new()
    }

    fn witness_commitment_index(&self) -> Option<usize> {
        if self.block.txdata[0].output.len() > 1 {
            Some(1)
        } else {
            None
        }
    }

    async fn wait_next(&self, options: BlockWaitOptions) -> Option<Arc<dyn BlockTemplate>> {
        loop {
            let notified = self.mempool.notify.notified();
            let best = self.mempool.best.lock().unwrap().clone();
            if let Some(best) = best {
                let tip_changed =
                    best.block.header.prev_blockhash != self.block.header.prev_blockhash;
                let fees_improved = options
                    .fee_threshold
                    .map_or(false, |delta| best.fees >= self.fees + delta);
                if tip_changed || fees_improved {
                    let best: Arc<dyn BlockTemplate> = best;
                    return Some(best);
                }
            }
            match options.timeout {
                Some(timeout) => {
                    if tokio::time::timeout(timeout, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn submit_solution(
        &self,
        _version: u32,
        _header_timestamp: u32,
        _header_nonce: u32,
        _coinbase_tx: Transaction,
    ) -> bool {
        true
    }
}

pub(crate) struct MockMining {
    pub(crate) tip: Option<BlockRef>,
    pub(crate) ibd: bool,
    templates: StdMutex<VecDeque<Arc<dyn BlockTemplate>>>,
    pub(crate) last_create_options: StdMutex<Option<BlockCreateOptions>>,
}

impl MockMining {
    pub(crate) fn new(templates: Vec<Arc<dyn BlockTemplate>>) -> Self {
        Self {
            tip: Some(BlockRef {
                hash: block_hash(0xaa),
                height: 100,
            }),
            ibd: false,
            templates: StdMutex::new(templates.into()),
            last_create_options: StdMutex::new(None),
        }
    }
}

#[async_trait]
impl Mining for MockMining {
    async fn wait_tip_changed(&self, _current_tip: BlockHash) -> Option<BlockRef> {
        self.tip
    }

    fn is_initial_block_download(&self) -> bool {
        self.ibd
    }

    async fn create_new_block(&self, options: BlockCreateOptions) -> Arc<dyn BlockTemplate> {
        *self.last_create_options.lock().unwrap() = Some(options);
        self.templates
            .lock()
            .unwrap()
            .pop_front()
            .expect("no template scripted for create_new_block")
    }
}
