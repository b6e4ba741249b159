//! Per-step batch construction. The decode pass keeps every running sequence
//! fed first, preempting when the block pool runs dry; the prefill pass then
//! spends the remaining token budget on queued requests, resumed swaps ahead
//! of fresh admissions. The resulting [`BatchPlan`] carries the dense tensors
//! the engine consumes.

use std::collections::HashSet;

use spate_common::config::CoreConfig;
use spate_engine::{BatchPlan, BlockId, PlanEntry, SeqId};

use crate::request::{Priority, RequestId, RequestStatus};
use crate::scheduler::CoreState;

pub enum PlanOutcome {
    Plan(BatchPlan),
    /// Nothing runnable this step; the scheduler waits on admissions.
    NoProgress,
}

pub struct Planner {
    pub max_batch_tokens: usize,
    pub max_seqs_per_batch: usize,
    pub block_size: usize,
    pub skip_promote_after: u32,
}

impl Planner {
    pub fn new(cfg: &CoreConfig) -> Self {
        Self {
            max_batch_tokens: cfg.max_batch_tokens,
            max_seqs_per_batch: cfg.max_seqs_per_batch,
            block_size: cfg.block_size,
            skip_promote_after: cfg.skip_promote_after,
        }
    }

    pub fn plan(&self, st: &mut CoreState) -> PlanOutcome {
        let mut decodes: Vec<SeqId> = Vec::new();
        let mut prefills: Vec<SeqId> = Vec::new();
        let mut cow_pairs: Vec<(BlockId, BlockId)> = Vec::new();
        let mut tokens_used = 0usize;
        // Requests already granted a seat this step; preemption must not
        // touch them or their siblings.
        let mut protected: HashSet<RequestId> = HashSet::new();

        self.decode_pass(st, &mut decodes, &mut cow_pairs, &mut tokens_used, &mut protected);
        self.prefill_pass(st, &decodes, &mut prefills, &mut tokens_used);

        if decodes.is_empty() && prefills.is_empty() {
            return PlanOutcome::NoProgress;
        }
        PlanOutcome::Plan(self.assemble(st, &prefills, &decodes, cow_pairs))
    }

    fn decode_pass(
        &self,
        st: &mut CoreState,
        decodes: &mut Vec<SeqId>,
        cow_pairs: &mut Vec<(BlockId, BlockId)>,
        tokens_used: &mut usize,
        protected: &mut HashSet<RequestId>,
    ) {
        let order: Vec<SeqId> = st.running.iter().copied().collect();
        for sid in order {
            // an earlier preemption may have evicted this sequence
            if !st.running.contains(&sid) {
                continue;
            }
            if decodes.len() >= self.max_seqs_per_batch || *tokens_used >= self.max_batch_tokens {
                break;
            }
            let Some((rid, need, cow_src)) = st.seqs.get(&sid).map(|seq| {
                let need = seq.num_blocks_needed(self.block_size);
                let cow_src = if need == 0 {
                    let bidx = seq.num_computed_tokens() / self.block_size;
                    let block = seq.block_table[bidx];
                    (st.allocator.ref_count(block) > 1).then_some((bidx, block))
                } else {
                    None
                };
                (seq.request_id.clone(), need, cow_src)
            }) else {
                continue;
            };
            protected.insert(rid);

            let need_total = need + usize::from(cow_src.is_some());
            while st.allocator.num_free() < need_total {
                if !st.preempt_one(protected) {
                    // block starvation with nothing left to evict
                    return;
                }
            }

            if need > 0 {
                let Ok(blocks) = st.allocator.allocate(need) else { return };
                if let Some(seq) = st.seqs.get_mut(&sid) {
                    seq.block_table.extend(blocks);
                }
            } else if let Some((bidx, old)) = cow_src {
                // exclusive copy of a shared write block
                let Ok(fresh) = st.allocator.allocate(1) else { return };
                let fresh = fresh[0];
                cow_pairs.push((old, fresh));
                st.allocator.release(&[old]);
                if let Some(seq) = st.seqs.get_mut(&sid) {
                    seq.block_table[bidx] = fresh;
                }
            }

            decodes.push(sid);
            *tokens_used += 1;
        }
    }

    fn prefill_pass(
        &self,
        st: &mut CoreState,
        decodes: &[SeqId],
        prefills: &mut Vec<SeqId>,
        tokens_used: &mut usize,
    ) {
        // resumed swaps go first, then waiting by priority with FIFO inside a
        // level (the sort is stable over admission order)
        let mut queue: Vec<(bool, RequestId)> =
            st.swapped.iter().map(|rid| (true, rid.clone())).collect();
        let mut waiting: Vec<RequestId> = st.waiting.iter().cloned().collect();
        waiting.sort_by_key(|rid| {
            std::cmp::Reverse(st.requests.get(rid).map_or(Priority::Normal, |r| r.priority))
        });
        queue.extend(waiting.into_iter().map(|rid| (false, rid)));

        for (from_swapped, rid) in queue {
            let Some((seq_list, new_tokens, blocks_needed)) = st.requests.get(&rid).map(|req| {
                // a forked group re-prefills every still-live sibling with
                // its own diverged prefix; otherwise only the seed sequence
                // runs the prompt
                let list: Vec<SeqId> = if req.forked {
                    req.seq_ids
                        .iter()
                        .copied()
                        .filter(|sid| st.seqs.get(sid).map_or(false, |s| !s.is_finished()))
                        .collect()
                } else {
                    req.seq_ids.first().copied().into_iter().collect()
                };
                let mut toks = 0usize;
                let mut blocks = 0usize;
                for sid in &list {
                    if let Some(seq) = st.seqs.get(sid) {
                        toks += seq.len();
                        blocks += st.allocator.blocks_for_tokens(seq.len());
                    }
                }
                (list, toks, blocks)
            }) else {
                continue;
            };

            // a group no configuration of this step could ever hold is passed
            // over entirely; the scheduler fails it once the pool sits idle
            let never_fits = new_tokens > self.max_batch_tokens
                || blocks_needed > st.allocator.num_total()
                || seq_list.len() > self.max_seqs_per_batch;
            if never_fits {
                continue;
            }
            let fits = *tokens_used + new_tokens <= self.max_batch_tokens
                && blocks_needed <= st.allocator.num_free()
                && prefills.len() + decodes.len() + seq_list.len() <= self.max_seqs_per_batch;
            if !fits {
                // head-of-line: count the skip and stop scanning so large
                // prompts are not starved by later small ones forever
                if let Some(req) = st.requests.get_mut(&rid) {
                    req.skips += 1;
                    if req.skips >= self.skip_promote_after && req.priority < Priority::High {
                        req.priority = req.priority.promoted();
                        req.skips = 0;
                        tracing::debug!(request = %rid, priority = ?req.priority, "promoted after repeated skips");
                    }
                }
                break;
            }

            for sid in &seq_list {
                let blocks = {
                    let Some(seq) = st.seqs.get(sid) else { continue };
                    st.allocator.blocks_for_tokens(seq.len())
                };
                let Ok(allocated) = st.allocator.allocate(blocks) else { return };
                if let Some(seq) = st.seqs.get_mut(sid) {
                    seq.block_table = allocated;
                    *tokens_used += seq.len();
                }
                st.running.push_back(*sid);
                prefills.push(*sid);
            }
            if from_swapped {
                st.swapped.retain(|r| r != &rid);
            } else {
                st.waiting.retain(|r| r != &rid);
            }
            if let Some(req) = st.requests.get_mut(&rid) {
                req.status = RequestStatus::Running;
                req.skips = 0;
            }
        }
    }

    fn assemble(
        &self,
        st: &CoreState,
        prefills: &[SeqId],
        decodes: &[SeqId],
        cow_pairs: Vec<(BlockId, BlockId)>,
    ) -> BatchPlan {
        let bs = self.block_size;
        let mut plan = BatchPlan { block_size: bs, cow_pairs, ..Default::default() };
        plan.cu_seq_lens.push(0);

        for &sid in prefills {
            let Some(seq) = st.seqs.get(&sid) else { continue };
            let start = seq.num_computed_tokens();
            let span = &seq.tokens()[start..];
            for (j, &tok) in span.iter().enumerate() {
                let pos = start + j;
                plan.token_ids.push(tok);
                plan.positions.push(pos as u32);
                plan.slot_ids.push(slot_of(&seq.block_table, pos, bs));
            }
            plan.entries.push(PlanEntry { seq_id: sid, is_prefill: true, num_tokens: span.len() });
            plan.cu_seq_lens.push(plan.token_ids.len() as u32);
            plan.last_token_indices.push(plan.token_ids.len() - 1);
        }

        let mut tables: Vec<Vec<BlockId>> = Vec::with_capacity(decodes.len());
        for &sid in decodes {
            let Some(seq) = st.seqs.get(&sid) else { continue };
            let pos = seq.num_computed_tokens();
            plan.token_ids.push(seq.last_token());
            plan.positions.push(pos as u32);
            plan.slot_ids.push(slot_of(&seq.block_table, pos, bs));
            plan.entries.push(PlanEntry { seq_id: sid, is_prefill: false, num_tokens: 1 });
            plan.cu_seq_lens.push(plan.token_ids.len() as u32);
            plan.last_token_indices.push(plan.token_ids.len() - 1);
            tables.push(seq.block_table.clone());
        }
        let widest = tables.iter().map(Vec::len).max().unwrap_or(0);
        for table in &mut tables {
            table.resize(widest, BatchPlan::PAD_BLOCK);
        }
        plan.block_tables = tables;
        plan
    }
}

fn slot_of(block_table: &[BlockId], pos: usize, block_size: usize) -> u32 {
    block_table[pos / block_size] * block_size as u32 + (pos % block_size) as u32
}
