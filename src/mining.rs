//! Node-side collaborators of the Template Provider.
//!
//! [`Mining`] is the block assembly interface a full node exposes, and
//! [`BlockTemplate`] is its handle to one assembled candidate block. Both are
//! implemented by the embedding node (for Bitcoin Core, over its multiprocess
//! mining IPC); the Template Provider only consumes them.

use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use stratum_common::bitcoin::{
    blockdata::block::BlockHeader,
    hashes::{sha256d, Hash},
    Block, BlockHash, Transaction,
};

/// Minimum weight the node reserves for the coinbase transaction when
/// assembling a block, regardless of how little the client asked for.
pub const MIN_BLOCK_RESERVED_WEIGHT: usize = 2000;

pub(crate) fn zero_hash() -> BlockHash {
    BlockHash::from_inner([0; 32])
}

/// Reference to a block in the node's active chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub hash: BlockHash,
    pub height: i32,
}

/// Options for [`Mining::create_new_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCreateOptions {
    /// Pull transactions from the mempool. When false the template contains
    /// only the coinbase.
    pub use_mempool: bool,
    /// Weight reserved for the coinbase transaction, including the outputs
    /// the client will add.
    pub block_reserved_weight: usize,
}

impl Default for BlockCreateOptions {
    fn default() -> Self {
        Self {
            use_mempool: true,
            block_reserved_weight: MIN_BLOCK_RESERVED_WEIGHT,
        }
    }
}

/// Options for [`BlockTemplate::wait_next`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockWaitOptions {
    /// Wake when the aggregate template fees improve by at least this many
    /// satoshis. `None` ignores fee changes and waits for a new tip only.
    pub fee_threshold: Option<u64>,
    /// Give up and return `None` after this long. `None` blocks until a
    /// better template is available or the node shuts down.
    pub timeout: Option<Duration>,
}

/// Block assembly interface of the node.
#[async_trait]
pub trait Mining: Send + Sync {
    /// Blocks until the chain tip differs from `current_tip`. Returns `None`
    /// when the node is shutting down.
    async fn wait_tip_changed(&self, current_tip: BlockHash) -> Option<BlockRef>;

    /// Whether the node is still catching up with the chain.
    fn is_initial_block_download(&self) -> bool;

    /// Assembles a fresh candidate block. May take tens of milliseconds.
    async fn create_new_block(&self, options: BlockCreateOptions) -> Arc<dyn BlockTemplate>;
}

/// A candidate block owned by the node. Immutable after creation, so shared
/// references need no further synchronization.
#[async_trait]
pub trait BlockTemplate: Send + Sync {
    fn block_header(&self) -> BlockHeader;

    /// The full block, coinbase at index 0.
    fn block(&self) -> Block;

    fn coinbase_tx(&self) -> Transaction;

    /// Merkle path of the coinbase transaction, ordered from deepest.
    fn coinbase_merkle_path(&self) -> Vec<sha256d::Hash>;

    /// Index of the witness commitment output in the coinbase transaction,
    /// `None` for blocks without segwit transactions.
    fn witness_commitment_index(&self) -> Option<usize>;

    /// Blocks until a strictly better template is available: a new tip, or a
    /// fee improvement beyond `fee_threshold`. Returns `None` on timeout or
    /// node shutdown; shutdown is guaranteed to be noticed in under a second.
    async fn wait_next(&self, options: BlockWaitOptions) -> Option<Arc<dyn BlockTemplate>>;

    /// Hands a solved header back to the node for validation and broadcast.
    async fn submit_solution(
        &self,
        version: u32,
        header_timestamp: u32,
        header_nonce: u32,
        coinbase_tx: Transaction,
    ) -> bool;
}
