//! Cache of issued block templates and the shared distribution state.
//!
//! A template stays cached from the moment its id goes out on the wire until
//! pruning decides no client can still reference it: ids never recycle, so a
//! late lookup resolves to "not found" instead of a different template.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use nohash_hasher::BuildNoHashHasher;
use stratum_common::bitcoin::BlockHash;

use crate::{
    mining::{zero_hash, BlockTemplate},
    TemplateId,
};

/// How long templates rooted on a replaced tip are kept around, so a miner
/// can still submit a solution it found just before the tip moved.
pub(crate) const BLOCK_SUBMISSION_GRACE: Duration = Duration::from_secs(10);

/// Mapping from template id to the retained template.
#[derive(Default)]
pub struct TemplateCache {
    templates: HashMap<TemplateId, Arc<dyn BlockTemplate>, BuildNoHashHasher<u64>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self {
            templates: HashMap::with_hasher(BuildNoHashHasher::default()),
        }
    }

    /// Adds a template under a freshly allocated id. Ids come from
    /// [`TemplateProviderState::next_template_id`], so no id is ever
    /// inserted twice.
    pub fn insert(&mut self, template_id: TemplateId, template: Arc<dyn BlockTemplate>) {
        self.templates.insert(template_id, template);
    }

    pub fn get(&self, template_id: &TemplateId) -> Option<Arc<dyn BlockTemplate>> {
        self.templates.get(template_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Drops every template whose previous block hash is not `best_prev_hash`.
    pub(crate) fn retain_current(&mut self, best_prev_hash: &BlockHash) {
        self.templates
            .retain(|_, template| template.block_header().prev_blockhash == *best_prev_hash);
    }
}

/// State shared between the supervisor and the per-client watchers, guarded
/// by a single mutex that is only ever held for O(1) work or pruning.
pub(crate) struct TemplateProviderState {
    /// Hash of the previous block of the most recent template observed.
    pub(crate) best_prev_hash: BlockHash,
    /// When the tip last changed, as far as template generation noticed.
    /// Does not need to be accurate.
    pub(crate) last_block_time: Instant,
    /// Last allocated template id.
    pub(crate) template_id: TemplateId,
    pub(crate) block_template_cache: TemplateCache,
}

impl TemplateProviderState {
    pub(crate) fn new() -> Self {
        Self {
            best_prev_hash: zero_hash(),
            last_block_time: Instant::now(),
            template_id: 0,
            block_template_cache: TemplateCache::new(),
        }
    }

    /// Allocates a fresh template id. Gaps in the sequence are fine; a
    /// watcher that dies between allocation and publication simply never
    /// uses its id.
    pub(crate) fn next_template_id(&mut self) -> TemplateId {
        self.template_id += 1;
        self.template_id
    }

    pub(crate) fn on_tip_changed(&mut self, prev_hash: BlockHash) {
        self.best_prev_hash = prev_hash;
        self.last_block_time = Instant::now();
    }

    /// Evicts templates rooted on a replaced tip, once the submission grace
    /// window after the tip change has passed.
    pub(crate) fn prune_block_template_cache(&mut self) {
        if self.last_block_time.elapsed() <= BLOCK_SUBMISSION_GRACE {
            return;
        }
        let best_prev_hash = self.best_prev_hash;
        self.block_template_cache.retain_current(&best_prev_hash);
    }
}
