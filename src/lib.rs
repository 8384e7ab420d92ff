//! # Stratum V2 Template Provider core
//!
//! The template-distribution engine of a Stratum V2 mining server: it binds
//! every connected client to a dedicated template watcher, keeps a shared
//! cache of issued templates, answers transaction-data queries against that
//! cache, and forwards solved blocks back to the node.
//!
//! The crate deliberately stops at two seams:
//!
//! - Block assembly is consumed through the [`mining::Mining`] and
//!   [`mining::BlockTemplate`] traits, implemented by the embedding node
//!   (for Bitcoin Core, over its multiprocess mining IPC).
//! - The encrypted wire transport registers clients in [`connman::Sv2Connman`]
//!   and drains each client's outbound queue of
//!   [`roles_logic_sv2::parsers::TemplateDistribution`] messages; handshake,
//!   framing and noise encryption never enter this crate.
//!
//! A node embeds it like this: build an [`Sv2TemplateProvider`] from a
//! `Mining` handle, a client registry and [`Sv2TemplateProviderOptions`],
//! drive [`Sv2TemplateProvider::run`] as a tokio task, and route incoming
//! `RequestTransactionData` / `SubmitSolution` messages to the corresponding
//! handler methods. [`Sv2TemplateProvider::interrupt`] stops everything; all
//! internal waits notice the interrupt in under a second.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use nohash_hasher::BuildNoHashHasher;
use roles_logic_sv2::{
    parsers::TemplateDistribution,
    template_distribution_sv2::{RequestTransactionData, SubmitSolution},
    utils::Mutex,
};
use stratum_common::bitcoin::{consensus::encode::deserialize, Transaction};
use tokio::{task, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

pub mod config;
pub mod connman;
pub mod error;
pub mod mining;
pub mod template_cache;

mod messages;
mod watcher;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{ChainType, Sv2TemplateProviderOptions};
pub use connman::{Sv2Client, Sv2Connman};
pub use error::{TpError, TpResult};
pub use mining::{
    BlockCreateOptions, BlockRef, BlockTemplate, BlockWaitOptions, Mining,
    MIN_BLOCK_RESERVED_WEIGHT,
};
pub use template_cache::TemplateCache;

use mining::zero_hash;
use template_cache::TemplateProviderState;
use watcher::ClientWatcher;

/// Identifier of an issued template. Strictly increasing for the process
/// lifetime, never reused.
pub type TemplateId = u64;

/// How often the supervisor looks for newly set-up clients and prunes the
/// template cache. Handling new connections is not urgent.
const NEW_CLIENT_TICK: Duration = Duration::from_millis(100);
/// Poll interval while waiting to come out of initial block download.
const IBD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The template distribution supervisor.
pub struct Sv2TemplateProvider {
    mining: Arc<dyn Mining>,
    connman: Arc<Sv2Connman>,
    options: Sv2TemplateProviderOptions,
    state: Arc<Mutex<TemplateProviderState>>,
    interrupt: CancellationToken,
}

impl Sv2TemplateProvider {
    pub fn new(
        mining: Arc<dyn Mining>,
        connman: Arc<Sv2Connman>,
        options: Sv2TemplateProviderOptions,
    ) -> Self {
        Self {
            mining,
            connman,
            options,
            state: Arc::new(Mutex::new(TemplateProviderState::new())),
            interrupt: CancellationToken::new(),
        }
    }

    pub fn connman(&self) -> Arc<Sv2Connman> {
        self.connman.clone()
    }

    pub fn options(&self) -> &Sv2TemplateProviderOptions {
        &self.options
    }

    /// Requests shutdown. [`run`](Self::run) and every watcher return
    /// promptly; awaiting `run` completes the teardown.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    /// Runs the supervisor until interrupted: waits for the node to be
    /// ready, spawns one watcher per set-up client, prunes the template
    /// cache, and joins all watchers on the way out.
    pub async fn run(&self) -> TpResult<()> {
        // Wait for the node to publish its current tip.
        let tip = tokio::select! {
            _ = self.interrupt.cancelled() => return Ok(()),
            tip = self.mining.wait_tip_changed(zero_hash()) => tip,
        };
        let tip = match tip {
            Some(tip) => tip,
            // The node is shutting down.
            None => return Ok(()),
        };
        debug!("Node tip: {} height: {}", tip.hash, tip.height);

        // Make sure it's initialized, doesn't need to be accurate.
        self.state
            .safe_lock(|state| state.last_block_time = Instant::now())?;

        // Wait to come out of IBD, except on signet, where we might be the
        // only miner.
        if self.options.chain() != ChainType::Signet {
            while !self.interrupt.is_cancelled() {
                if !self.mining.is_initial_block_download() {
                    break;
                }
                trace!("Waiting to come out of IBD");
                tokio::select! {
                    _ = self.interrupt.cancelled() => return Ok(()),
                    _ = time::sleep(IBD_POLL_INTERVAL) => {}
                }
            }
        }

        let mut client_tasks: HashMap<u64, JoinHandle<()>, BuildNoHashHasher<u64>> =
            HashMap::with_hasher(BuildNoHashHasher::default());

        while !self.interrupt.is_cancelled() {
            // Each client gets its own template watcher once the handshake
            // and the CoinbaseOutputDataSize exchange are done. The task map
            // guarantees at most one watcher per client id.
            let mut ready = Vec::new();
            self.connman.for_each_client(|client| {
                if client.coinbase_output_data_size_recv
                    && !client_tasks.contains_key(&client.id())
                {
                    ready.push(client.id());
                }
            })?;

            for client_id in ready {
                debug!("Starting template watcher for client id={}", client_id);
                let client_watcher = ClientWatcher::new(
                    client_id,
                    self.mining.clone(),
                    self.connman.clone(),
                    self.state.clone(),
                    self.options.clone(),
                    self.interrupt.clone(),
                );
                client_tasks.insert(
                    client_id,
                    task::spawn(async move {
                        if let Err(e) = client_watcher.run().await {
                            error!("Template watcher for client id={} failed: {}", client_id, e);
                        }
                    }),
                );
            }

            tokio::select! {
                _ = self.interrupt.cancelled() => break,
                _ = time::sleep(NEW_CLIENT_TICK) => {}
            }

            self.state
                .safe_lock(|state| state.prune_block_template_cache())?;
        }

        // Watchers blocked in wait_next return in under a second once
        // interrupted.
        for (client_id, handle) in client_tasks {
            if let Err(e) = handle.await {
                error!(
                    "Template watcher for client id={} panicked: {}",
                    client_id, e
                );
            }
        }

        Ok(())
    }

    /// Answers a client's 0x73 `RequestTransactionData` against the template
    /// cache. Called by the transport on message arrival.
    pub fn request_transaction_data(
        &self,
        client: &Arc<Mutex<Sv2Client>>,
        message: RequestTransactionData,
    ) -> TpResult<()> {
        let client_id = client.safe_lock(|client| client.id())?;

        let template = self
            .state
            .safe_lock(|state| state.block_template_cache.get(&message.template_id))?;
        let template = match template {
            Some(template) => template,
            None => {
                debug!(
                    "Send 0x75 RequestTransactionData.Error (template-id-not-found: {}) to client id={}",
                    message.template_id, client_id
                );
                let error_msg =
                    messages::request_transaction_data_error(message.template_id, "template-id-not-found")?;
                client.safe_lock(|client| {
                    client.send_message(TemplateDistribution::RequestTransactionDataError(error_msg))
                })?;
                return Ok(());
            }
        };

        let block = template.block();
        let best_prev_hash = self.state.safe_lock(|state| state.best_prev_hash)?;
        if block.header.prev_blockhash != best_prev_hash {
            trace!(
                "Template id={} prevhash={}, tip={}",
                message.template_id,
                block.header.prev_blockhash,
                best_prev_hash
            );
            debug!(
                "Send 0x75 RequestTransactionData.Error (stale-template-id) to client id={}",
                client_id
            );
            let error_msg =
                messages::request_transaction_data_error(message.template_id, "stale-template-id")?;
            client.safe_lock(|client| {
                client.send_message(TemplateDistribution::RequestTransactionDataError(error_msg))
            })?;
            return Ok(());
        }

        let success = messages::request_transaction_data_success(&block, message.template_id)?;
        debug!(
            "Send 0x74 RequestTransactionData.Success to client id={}",
            client_id
        );
        client.safe_lock(|client| {
            client.send_message(TemplateDistribution::RequestTransactionDataSuccess(success))
        })?;
        Ok(())
    }

    /// Forwards a client's 0x76 `SubmitSolution` to the node. Called by the
    /// transport on message arrival.
    pub async fn submit_solution(&self, solution: SubmitSolution<'static>) -> TpResult<()> {
        debug!(
            "Solution for template id={} version=0x{:08x} timestamp={} nonce={}",
            solution.template_id, solution.version, solution.header_timestamp, solution.header_nonce
        );

        let coinbase_tx_bytes = solution.coinbase_tx.to_vec();
        let coinbase_tx: Transaction = match deserialize(&coinbase_tx_bytes) {
            Ok(coinbase_tx) => coinbase_tx,
            Err(e) => {
                error!("SubmitSolution.coinbase_tx is invalid: {}", e);
                return Err(TpError::BitcoinEncode(e));
            }
        };

        // The state lock must not be held across the node call: the solved
        // block may arrive over the p2p network at the same time.
        let template = self
            .state
            .safe_lock(|state| state.block_template_cache.get(&solution.template_id))?;
        let template = match template {
            Some(template) => template,
            None => {
                debug!(
                    "Template with id={} is no longer in cache",
                    solution.template_id
                );
                return Ok(());
            }
        };

        // The template stays cached: many devices may be working on it and a
        // second solution for the same template can still arrive.
        let accepted = template
            .submit_solution(
                solution.version,
                solution.header_timestamp,
                solution.header_nonce,
                coinbase_tx,
            )
            .await;
        if !accepted {
            warn!(
                "Node rejected solution for template id={}",
                solution.template_id
            );
        }
        Ok(())
    }
}
