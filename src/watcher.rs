//! Per-client template watcher.
//!
//! Each fully set-up client gets one watcher task. The watcher generates the
//! client's initial template, then loops forever waiting for a strictly
//! better one, emitting `NewTemplate` (and `SetNewPrevHash` on tip changes)
//! into the client's outbound queue. It terminates when the process is
//! interrupted, the client disappears from the registry, or emission fails.

use std::{sync::Arc, time::Duration};

use roles_logic_sv2::{parsers::TemplateDistribution, utils::Mutex};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    connman::{Sv2Client, Sv2Connman},
    error::TpResult,
    messages,
    mining::{BlockCreateOptions, BlockTemplate, BlockWaitOptions, Mining, MIN_BLOCK_RESERVED_WEIGHT},
    template_cache::TemplateProviderState,
    Sv2TemplateProviderOptions, TemplateId,
};

/// Wait timeout injected in test mode so functional tests see fee updates
/// quickly.
const TEST_WAIT_TIMEOUT: Duration = Duration::from_secs(1);
/// Pacing sleep between iterations in test mode.
const TEST_PACING: Duration = Duration::from_millis(50);

/// Tracks the minimum spacing between fee-driven template refreshes. Runs
/// on the tokio clock so tests can drive pacing with paused time.
struct Timer {
    interval: Duration,
    last_triggered: Instant,
}

impl Timer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_triggered: Instant::now(),
        }
    }

    fn trigger(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_triggered) >= self.interval {
            self.last_triggered = now;
            return true;
        }
        false
    }

    fn reset(&mut self) {
        self.last_triggered = Instant::now();
    }
}

/// Computes how the next `wait_next` call should behave.
///
/// Between fee checks the fee threshold is disabled entirely and the wait is
/// bounded by the fee check interval, so the watcher can opt back into fee
/// monitoring on the next iteration without missing a tip change.
fn wait_options(options: &Sv2TemplateProviderOptions, check_fees: bool) -> BlockWaitOptions {
    if check_fees {
        BlockWaitOptions {
            fee_threshold: Some(options.fee_delta()),
            timeout: if options.is_test() {
                Some(TEST_WAIT_TIMEOUT)
            } else {
                None
            },
        }
    } else {
        BlockWaitOptions {
            fee_threshold: None,
            timeout: Some(options.fee_check_interval()),
        }
    }
}

pub(crate) struct ClientWatcher {
    client_id: u64,
    mining: Arc<dyn Mining>,
    connman: Arc<Sv2Connman>,
    state: Arc<Mutex<TemplateProviderState>>,
    options: Sv2TemplateProviderOptions,
    interrupt: CancellationToken,
    timer: Timer,
}

impl ClientWatcher {
    pub(crate) fn new(
        client_id: u64,
        mining: Arc<dyn Mining>,
        connman: Arc<Sv2Connman>,
        state: Arc<Mutex<TemplateProviderState>>,
        options: Sv2TemplateProviderOptions,
        interrupt: CancellationToken,
    ) -> Self {
        let timer = Timer::new(options.fee_check_interval());
        Self {
            client_id,
            mining,
            connman,
            state,
            options,
            interrupt,
            timer,
        }
    }

    pub(crate) async fn run(mut self) -> TpResult<()> {
        let mut block_template: Option<Arc<dyn BlockTemplate>> = None;

        while !self.interrupt.is_cancelled() {
            let current = match block_template.clone() {
                Some(template) => template,
                None => match self.initial_template().await? {
                    Some(template) => {
                        block_template = Some(template.clone());
                        template
                    }
                    None => return Ok(()),
                },
            };

            // Between fee checks waitNext ignores fees entirely, so a client
            // never sees fee-driven refreshes closer together than the
            // configured interval.
            let check_fees = self.options.is_test() || self.timer.trigger();
            let options = wait_options(&self.options, check_fees);
            if check_fees {
                trace!(
                    "Wait for fees to rise by {} sat or a new tip, client id={}",
                    self.options.fee_delta(),
                    self.client_id
                );
            } else {
                trace!(
                    "Ignore fee changes until the interval elapses, wait for a new tip, client id={}",
                    self.client_id
                );
            }

            let old_prev_hash = current.block_header().prev_blockhash;
            let next = tokio::select! {
                _ = self.interrupt.cancelled() => return Ok(()),
                next = current.wait_next(options) => next,
            };

            // The client may have disconnected during the wait; check now to
            // avoid a spurious template assembly and confusing log lines.
            if self.connman.get_client_by_id(self.client_id)?.is_none() {
                return Ok(());
            }

            match next {
                Some(template) => {
                    block_template = Some(template.clone());
                    let new_prev_hash = template.block_header().prev_blockhash;

                    // The future template flag is set when there's a new
                    // prev hash, not when there's only a fee increase.
                    let (future_template, template_id) = self.state.safe_lock(|state| {
                        let tip_changed = new_prev_hash != old_prev_hash;
                        if tip_changed {
                            state.on_tip_changed(new_prev_hash);
                        }
                        (tip_changed, state.next_template_id())
                    })?;
                    if future_template {
                        trace!("Tip changed, client id={}", self.client_id);
                    }

                    if !self.emit(template_id, template.as_ref(), future_template)? {
                        return Ok(());
                    }
                    self.timer.reset();
                    self.state.safe_lock(|state| {
                        state.block_template_cache.insert(template_id, template)
                    })?;
                }
                None => {
                    // Only happens at shutdown in production; in test mode
                    // timeouts are routine.
                    trace!("Timeout for client id={}", self.client_id);
                }
            }

            if self.options.is_test() {
                tokio::select! {
                    _ = self.interrupt.cancelled() => return Ok(()),
                    _ = time::sleep(TEST_PACING) => {}
                }
            }
        }
        Ok(())
    }

    /// Generates and emits the client's first template. Returns `None` when
    /// the watcher should terminate because the client is gone or could not
    /// be written to.
    async fn initial_template(&mut self) -> TpResult<Option<Arc<dyn BlockTemplate>>> {
        trace!(
            "Generate initial block template for client id={}",
            self.client_id
        );

        let template_id = self.state.safe_lock(|state| state.next_template_id())?;

        let mut create_options = BlockCreateOptions::default();
        match self.connman.get_client_by_id(self.client_id)? {
            None => return Ok(None),
            Some(client) => {
                let outputs_size = client.safe_lock(|client| client.coinbase_tx_outputs_size)?;
                // The node enforces a minimum reserved weight of 2000.
                create_options.block_reserved_weight =
                    MIN_BLOCK_RESERVED_WEIGHT + outputs_size as usize * 4;
            }
        }

        let time_start = Instant::now();
        let template = tokio::select! {
            _ = self.interrupt.cancelled() => return Ok(None),
            template = self.mining.create_new_block(create_options) => template,
        };
        trace!(
            "Assemble template: {:.2}ms",
            time_start.elapsed().as_secs_f64() * 1000.0
        );

        let prev_hash = template.block_header().prev_blockhash;
        self.state.safe_lock(|state| {
            if prev_hash != state.best_prev_hash {
                state.on_tip_changed(prev_hash);
            }
        })?;

        if !self.emit(template_id, template.as_ref(), true)? {
            return Ok(None);
        }
        self.timer.reset();
        self.state.safe_lock(|state| {
            state
                .block_template_cache
                .insert(template_id, template.clone())
        })?;

        Ok(Some(template))
    }

    /// Re-looks the client up and queues the wire messages. Returns `Ok(false)`
    /// when the watcher should terminate: the client vanished, or its queue
    /// is gone, in which case the disconnect flag is raised for the transport.
    fn emit(
        &self,
        template_id: TemplateId,
        template: &dyn BlockTemplate,
        future_template: bool,
    ) -> TpResult<bool> {
        let client = match self.connman.get_client_by_id(self.client_id)? {
            Some(client) => client,
            None => return Ok(false),
        };
        if send_work(&client, template_id, template, future_template)? {
            Ok(true)
        } else {
            trace!("Disconnecting client id={}", self.client_id);
            client.safe_lock(|client| client.disconnect_flag = true)?;
            Ok(false)
        }
    }
}

/// Queues `NewTemplate` and, for tip changes, `SetNewPrevHash` on the
/// client's outbound queue, in that order.
pub(crate) fn send_work(
    client: &Arc<Mutex<Sv2Client>>,
    template_id: TemplateId,
    template: &dyn BlockTemplate,
    future_template: bool,
) -> TpResult<bool> {
    let client_id = client.safe_lock(|client| client.id())?;

    let new_template = messages::new_template(template, template_id, future_template)?;
    debug!(
        "Send 0x71 NewTemplate id={} future={} to client id={}",
        template_id, future_template, client_id
    );
    let sent = client.safe_lock(|client| {
        client.send_message(TemplateDistribution::NewTemplate(new_template))
    })?;
    if !sent {
        return Ok(false);
    }

    if future_template {
        let new_prev_hash = messages::set_new_prev_hash(template, template_id)?;
        debug!("Send 0x72 SetNewPrevHash to client id={}", client_id);
        let sent = client.safe_lock(|client| {
            client.send_message(TemplateDistribution::SetNewPrevHash(new_prev_hash))
        })?;
        if !sent {
            return Ok(false);
        }
    }

    Ok(true)
}
