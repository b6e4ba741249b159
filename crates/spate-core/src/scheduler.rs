//! The step loop. One dedicated thread owns every piece of mutable core
//! state; producers reach it only through the bounded admission channel and
//! the per-request cancel flag, and consumers only through sink callbacks
//! invoked from this thread.
//!
//! Each step drains admissions, services cancellation and aging, builds a
//! batch, runs the engine, samples, and fans completed tokens back out. The
//! thread suspends in exactly two places: the timed admission wait when
//! there is no runnable work, and inside the engine call.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use spate_common::config::{CoreConfig, PreemptionMode};
use spate_engine::{BatchPlan, EngineError, Logits, SeqId, TokenId, Tokenizer};

use crate::batch::{PlanOutcome, Planner};
use crate::engine::EngineAdapter;
use crate::kv::BlockAllocator;
use crate::request::{
    FlushOutcome, OutputEvent, OutputSink, Priority, Request, RequestId, RequestStatus,
};
use crate::sampler::sample_row;
use crate::sequence::{FinishReason, SamplingParams, Sequence};

/// Everything a producer hands over at admission.
pub struct AdmissionMsg {
    pub id: RequestId,
    pub prompt_tokens: Vec<TokenId>,
    pub sampling: Arc<SamplingParams>,
    pub priority: Priority,
    pub stream: bool,
    pub sink: Box<dyn OutputSink>,
    pub cancel: Arc<AtomicBool>,
    pub arrival: Instant,
}

/// All mutable core state, owned by the scheduler thread. Every admitted
/// sequence sits in exactly one of `waiting` (via its request), `running`,
/// or `swapped` (via its request).
pub struct CoreState {
    pub allocator: BlockAllocator,
    pub seqs: HashMap<SeqId, Sequence>,
    pub requests: HashMap<RequestId, Request>,
    pub waiting: VecDeque<RequestId>,
    pub running: VecDeque<SeqId>,
    pub swapped: VecDeque<RequestId>,
    pub preemption_mode: PreemptionMode,
    pub tokenizer: Arc<dyn Tokenizer>,
    next_seq_id: SeqId,
}

impl CoreState {
    pub fn new(allocator: BlockAllocator, preemption_mode: PreemptionMode, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            allocator,
            seqs: HashMap::new(),
            requests: HashMap::new(),
            waiting: VecDeque::new(),
            running: VecDeque::new(),
            swapped: VecDeque::new(),
            preemption_mode,
            tokenizer,
            next_seq_id: 0,
        }
    }

    fn alloc_seq_id(&mut self) -> SeqId {
        self.next_seq_id += 1;
        self.next_seq_id
    }

    /// Materialize a request and its sibling sequences into the waiting pool.
    pub fn admit(&mut self, msg: AdmissionMsg) {
        spate_obs::request_admitted();
        let mut req = Request::new(
            msg.id.clone(),
            msg.priority,
            msg.arrival,
            msg.stream,
            msg.sampling.clone(),
            msg.sink,
            msg.cancel,
            msg.prompt_tokens.len(),
        );
        for index in 0..msg.sampling.best_of() {
            let sid = self.alloc_seq_id();
            let decoder = self.tokenizer.new_stream(msg.sampling.skip_special_tokens);
            let seq = Sequence::new(sid, msg.id.clone(), index, msg.prompt_tokens.clone(), msg.sampling.clone(), decoder);
            req.seq_ids.push(sid);
            self.seqs.insert(sid, seq);
        }
        debug!(
            request = %msg.id,
            prompt_tokens = msg.prompt_tokens.len(),
            siblings = msg.sampling.best_of(),
            "request admitted"
        );
        self.requests.insert(msg.id.clone(), req);
        self.waiting.push_back(msg.id);
    }

    /// Evict one running request to free blocks: lowest priority first, then
    /// the youngest arrival; the whole request goes so siblings progress
    /// together. Returns false when nothing outside `protected` is running.
    pub fn preempt_one(&mut self, protected: &HashSet<RequestId>) -> bool {
        let victim = self
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Running && !protected.contains(&r.id))
            .filter(|r| r.seq_ids.iter().any(|sid| self.running.contains(sid)))
            .min_by(|a, b| a.priority.cmp(&b.priority).then(b.arrival.cmp(&a.arrival)))
            .map(|r| r.id.clone());
        let Some(rid) = victim else { return false };
        self.evict(&rid);
        true
    }

    fn evict(&mut self, rid: &RequestId) {
        warn!(request = %rid, mode = ?self.preemption_mode, "preempting for KV space");
        spate_obs::preemption();
        let Some(req) = self.requests.get(rid) else { return };
        let seq_ids = req.seq_ids.clone();
        let mode = self.preemption_mode;
        for sid in &seq_ids {
            self.running.retain(|s| s != sid);
            if let Some(seq) = self.seqs.get_mut(sid) {
                // a sibling that already finished keeps its output; only
                // live sequences give their state back
                if seq.is_finished() {
                    continue;
                }
                let blocks = std::mem::take(&mut seq.block_table);
                self.allocator.release(&blocks);
                match mode {
                    PreemptionMode::Recompute => {
                        let decoder = self.tokenizer.new_stream(seq.sampling.skip_special_tokens);
                        seq.reset_for_recompute(decoder);
                    }
                    PreemptionMode::Swap => seq.prepare_swap_resume(),
                }
            }
        }
        if let Some(req) = self.requests.get_mut(rid) {
            req.status = RequestStatus::Preempted;
            req.queued_since = Instant::now();
            match mode {
                PreemptionMode::Recompute => self.waiting.push_front(rid.clone()),
                PreemptionMode::Swap => self.swapped.push_back(rid.clone()),
            }
        }
    }
}

enum StepOutcome {
    Continue,
    Shutdown,
}

pub struct Scheduler {
    st: CoreState,
    planner: Planner,
    engine: EngineAdapter,
    cfg: CoreConfig,
    rx: mpsc::Receiver<AdmissionMsg>,
    eos: Option<TokenId>,
}

impl Scheduler {
    pub fn new(
        st: CoreState,
        engine: EngineAdapter,
        cfg: CoreConfig,
        rx: mpsc::Receiver<AdmissionMsg>,
    ) -> Self {
        let planner = Planner::new(&cfg);
        let eos = st.tokenizer.eos_token_id();
        Self { st, planner, engine, cfg, rx, eos }
    }

    /// Thread main: steps until the admission channel closes and all work
    /// has drained, or an invariant violation forces termination.
    pub fn run(mut self) {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
            Ok(rt) => rt,
            Err(e) => {
                error!(error = %e, "scheduler runtime init failed");
                return;
            }
        };
        info!(
            blocks = self.st.allocator.num_total(),
            block_size = self.st.allocator.block_size(),
            "scheduler thread running"
        );
        loop {
            match self.step(&rt, self.cfg.step_timeout()) {
                StepOutcome::Continue => {}
                StepOutcome::Shutdown => break,
            }
        }
        info!("scheduler thread exiting");
    }

    fn step(&mut self, rt: &tokio::runtime::Runtime, timeout: Duration) -> StepOutcome {
        let started = Instant::now();
        let channel_open = self.drain_admissions(started + timeout / 2);
        self.service_cancellations();
        self.age_waiting();

        let progressed = match self.planner.plan(&mut self.st) {
            PlanOutcome::Plan(plan) => {
                let scheduled: Vec<SeqId> = plan.entries.iter().map(|e| e.seq_id).collect();
                match self.engine.execute(&plan) {
                    Ok(logits) => self.apply_logits(&plan, &logits),
                    Err(err) => self.engine_failure(&scheduled, err),
                }
                true
            }
            PlanOutcome::NoProgress => {
                self.handle_no_progress();
                false
            }
        };

        if !self.check_accounting() {
            self.internal_failure("KV accounting mismatch");
            self.flush_outputs();
            return StepOutcome::Shutdown;
        }
        self.flush_outputs();
        self.update_gauges();
        spate_obs::observe_step(started.elapsed().as_secs_f64());

        if !channel_open && self.is_drained() {
            return StepOutcome::Shutdown;
        }
        if !progressed {
            let remaining = timeout.saturating_sub(started.elapsed());
            if channel_open {
                // idle: block on admissions for the remainder of the step budget
                if !remaining.is_zero() {
                    if let Ok(Some(msg)) = rt.block_on(async { tokio::time::timeout(remaining, self.rx.recv()).await }) {
                        self.admit_msg(msg);
                    }
                }
            } else if !remaining.is_zero() {
                // shutting down but outputs are still draining
                std::thread::sleep(remaining);
            }
        }
        StepOutcome::Continue
    }

    /// Pull admissions without blocking, up to the deadline. Returns false
    /// once every producer handle is gone.
    fn drain_admissions(&mut self, deadline: Instant) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    self.admit_msg(msg);
                    if Instant::now() >= deadline {
                        return true;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Final admission gate: refuse anything the pool or token budget could
    /// never schedule, so it cannot wedge the waiting queue.
    fn admit_msg(&mut self, msg: AdmissionMsg) {
        let prompt_blocks = self.st.allocator.blocks_for_tokens(msg.prompt_tokens.len());
        if msg.prompt_tokens.len() > self.cfg.max_batch_tokens
            || prompt_blocks > self.st.allocator.num_total()
        {
            spate_obs::request_rejected();
            warn!(request = %msg.id, prompt_tokens = msg.prompt_tokens.len(), "rejecting unschedulable prompt");
            msg.sink.deliver(OutputEvent::Rejected {
                message: "prompt exceeds schedulable capacity".into(),
            });
            return;
        }
        self.st.admit(msg);
    }

    /// Cancellation flags are observed at step boundaries only.
    fn service_cancellations(&mut self) {
        let ids: Vec<RequestId> = self
            .st
            .requests
            .values()
            .filter(|r| r.cancel_requested() && !r.status.is_terminal())
            .map(|r| r.id.clone())
            .collect();
        for rid in ids {
            self.cancel_request(&rid);
        }
    }

    fn cancel_request(&mut self, rid: &RequestId) {
        debug!(request = %rid, "cancelling");
        spate_obs::request_cancelled();
        let Some(req) = self.st.requests.get(rid) else { return };
        let seq_ids = req.seq_ids.clone();
        for sid in &seq_ids {
            self.st.running.retain(|s| s != sid);
            if let Some(seq) = self.st.seqs.get_mut(sid) {
                let blocks = std::mem::take(&mut seq.block_table);
                self.st.allocator.release(&blocks);
                if !seq.is_finished() {
                    seq.set_finish(FinishReason::Cancelled);
                }
            }
        }
        self.st.waiting.retain(|r| r != rid);
        self.st.swapped.retain(|r| r != rid);
        self.finalize_request(rid, RequestStatus::Cancelled);
    }

    /// Promote requests that have waited past the aging threshold.
    fn age_waiting(&mut self) {
        let threshold = self.cfg.aging_threshold();
        let waiting: Vec<RequestId> = self.st.waiting.iter().cloned().collect();
        for rid in waiting {
            let Some(req) = self.st.requests.get_mut(&rid) else { continue };
            if req.priority < Priority::High && req.queued_since.elapsed() > threshold {
                req.priority = req.priority.promoted();
                req.queued_since = Instant::now();
                debug!(request = %rid, priority = ?req.priority, "aged into higher priority");
            }
        }
    }

    /// No batch could be built. If something is still running or queued the
    /// pool can never serve it (nothing preemptable remains), so fail it
    /// rather than spin forever.
    fn handle_no_progress(&mut self) {
        if let Some(&sid) = self.st.running.front() {
            let Some(rid) = self.st.seqs.get(&sid).map(|s| s.request_id.clone()) else { return };
            error!(request = %rid, "sequence outgrew the KV pool with nothing left to preempt");
            self.fail_request(&rid, FinishReason::Error);
            return;
        }
        if self.st.allocator.num_free() == self.st.allocator.num_total() {
            let head = self.st.swapped.front().cloned().or_else(|| self.st.waiting.front().cloned());
            if let Some(rid) = head {
                error!(request = %rid, "request cannot fit an empty pool; failing");
                self.fail_request(&rid, FinishReason::Error);
            }
        }
    }

    /// Mark every sequence of a request with `reason`, release its blocks,
    /// and deliver what was generated so far.
    fn fail_request(&mut self, rid: &RequestId, reason: FinishReason) {
        let Some(req) = self.st.requests.get(rid) else { return };
        let seq_ids = req.seq_ids.clone();
        for sid in &seq_ids {
            self.st.running.retain(|s| s != sid);
            if let Some(seq) = self.st.seqs.get_mut(sid) {
                let blocks = std::mem::take(&mut seq.block_table);
                self.st.allocator.release(&blocks);
                if !seq.is_finished() {
                    seq.set_finish(reason);
                }
            }
        }
        self.st.waiting.retain(|r| r != rid);
        self.st.swapped.retain(|r| r != rid);
        self.finalize_request(rid, RequestStatus::Finished);
    }

    /// Batch-wide engine failure: every scheduled sequence finishes with
    /// `error`, partial progress is preserved and delivered, and the loop
    /// carries on.
    fn engine_failure(&mut self, scheduled: &[SeqId], err: EngineError) {
        spate_obs::engine_error();
        error!(error = %err, batch = scheduled.len(), "engine step failed");
        let mut rids: Vec<RequestId> = Vec::new();
        for sid in scheduled {
            if let Some(seq) = self.st.seqs.get(sid) {
                let rid = seq.request_id.clone();
                if !rids.contains(&rid) {
                    rids.push(rid);
                }
            }
        }
        for rid in rids {
            self.fail_request(&rid, FinishReason::Error);
        }
    }

    /// Sample one token per plan entry, mutate the sequences, and fan the
    /// results out.
    fn apply_logits(&mut self, plan: &BatchPlan, logits: &Logits) {
        let mut touched: Vec<RequestId> = Vec::new();
        for (i, entry) in plan.entries.iter().enumerate() {
            let sid = entry.seq_id;
            let row = logits.row(i);
            let Some(rid) = self.st.seqs.get_mut(&sid).map(|seq| {
                seq.advance_computed(entry.num_tokens);
                seq.request_id.clone()
            }) else {
                continue;
            };
            if !touched.contains(&rid) {
                touched.push(rid.clone());
            }

            let needs_fork = entry.is_prefill
                && self.st.requests.get(&rid).map_or(false, |r| r.best_of() > 1 && !r.forked);
            if needs_fork {
                self.fork_and_seed(&rid, row);
            } else if let Some(seq) = self.st.seqs.get_mut(&sid) {
                let eos = self.eos;
                let (params, counts, rng) = seq.sampling_parts();
                let sampled = sample_row(row, params, counts, rng);
                seq.process_token(sampled.token, sampled.logprob, eos);
                spate_obs::tokens_generated(1);
            }
        }
        self.post_sample(&touched);
    }

    /// A prefilled seed spawns its `best_of` siblings: each gets a forked
    /// block table and its own first token drawn from the prompt logits row.
    fn fork_and_seed(&mut self, rid: &RequestId, row: &[f32]) {
        let Some(seq_ids) = self.st.requests.get(rid).map(|r| r.seq_ids.clone()) else { return };
        let Some((seed_table, seed_computed)) = self
            .st
            .seqs
            .get(&seq_ids[0])
            .map(|s| (s.block_table.clone(), s.num_computed_tokens()))
        else {
            return;
        };
        for (idx, sid) in seq_ids.iter().enumerate() {
            if idx > 0 {
                let forked = self.st.allocator.fork(&seed_table);
                if let Some(child) = self.st.seqs.get_mut(sid) {
                    child.block_table = forked;
                    child.advance_computed(seed_computed);
                }
                self.st.running.push_back(*sid);
            }
            if let Some(seq) = self.st.seqs.get_mut(sid) {
                let eos = self.eos;
                let (params, counts, rng) = seq.sampling_parts();
                let sampled = sample_row(row, params, counts, rng);
                seq.process_token(sampled.token, sampled.logprob, eos);
                spate_obs::tokens_generated(1);
            }
        }
        if let Some(req) = self.st.requests.get_mut(rid) {
            req.forked = true;
        }
        debug!(request = %rid, siblings = seq_ids.len(), "forked prompt into siblings");
    }

    /// After sampling: release finished sequences' blocks within the same
    /// step, emit streaming deltas ordered by sequence index, and finalize
    /// requests whose last sibling just finished.
    fn post_sample(&mut self, touched: &[RequestId]) {
        for rid in touched {
            let Some(req) = self.st.requests.get(rid) else { continue };
            let stream = req.stream;
            let seq_ids = req.seq_ids.clone();

            for sid in &seq_ids {
                let finished = self.st.seqs.get(sid).map_or(false, |s| s.is_finished());
                if finished {
                    self.st.running.retain(|s| s != sid);
                    if let Some(seq) = self.st.seqs.get_mut(sid) {
                        let blocks = std::mem::take(&mut seq.block_table);
                        self.st.allocator.release(&blocks);
                    }
                }
            }

            if stream {
                let mut events = Vec::new();
                for sid in &seq_ids {
                    let started = self.st.running.contains(sid)
                        || self.st.seqs.get(sid).map_or(false, |s| s.is_finished());
                    if !started {
                        continue;
                    }
                    if let Some(seq) = self.st.seqs.get_mut(sid) {
                        if seq.take_announce() {
                            events.push(OutputEvent::Delta {
                                index: seq.index,
                                text: String::new(),
                                finish_reason: None,
                            });
                        }
                        let text = seq.take_delta();
                        let finish = seq.take_finish_delta();
                        if text.is_some() || finish.is_some() {
                            events.push(OutputEvent::Delta {
                                index: seq.index,
                                text: text.unwrap_or_default(),
                                finish_reason: finish,
                            });
                        }
                    }
                }
                if let Some(req) = self.st.requests.get_mut(rid) {
                    for event in events {
                        req.push_event(event);
                    }
                }
            }

            let all_done = seq_ids
                .iter()
                .all(|sid| self.st.seqs.get(sid).map_or(true, |s| s.is_finished()));
            if all_done {
                self.finalize_request(rid, RequestStatus::Finished);
            }
        }
    }

    /// Queue the terminal event (preceded, for streams, by any unsent
    /// per-sequence deltas) and mark the request terminal.
    fn finalize_request(&mut self, rid: &RequestId, status: RequestStatus) {
        let Some((stream, seq_ids)) = self
            .st
            .requests
            .get(rid)
            .filter(|r| !r.status.is_terminal())
            .map(|r| (r.stream, r.seq_ids.clone()))
        else {
            return;
        };
        let mut trailing: Vec<OutputEvent> = Vec::new();
        if stream {
            for sid in &seq_ids {
                if let Some(seq) = self.st.seqs.get_mut(sid) {
                    if seq.take_announce() {
                        trailing.push(OutputEvent::Delta {
                            index: seq.index,
                            text: String::new(),
                            finish_reason: None,
                        });
                    }
                    let text = seq.take_delta();
                    let finish = seq.take_finish_delta();
                    if text.is_some() || finish.is_some() {
                        trailing.push(OutputEvent::Delta {
                            index: seq.index,
                            text: text.unwrap_or_default(),
                            finish_reason: finish,
                        });
                    }
                }
            }
        }
        if let Some(req) = self.st.requests.get_mut(rid) {
            for event in trailing {
                req.push_event(event);
            }
            let final_event = req.final_event(&self.st.seqs);
            req.push_event(final_event);
            req.status = status;
        }
        debug!(request = %rid, ?status, "request reached a terminal state");
    }

    /// Deliver buffered events. A sink that refuses past the grace period
    /// cancels its request; terminal requests leave once their buffer is
    /// empty.
    fn flush_outputs(&mut self) {
        let grace = self.cfg.sink_grace();
        let mut to_cancel: Vec<RequestId> = Vec::new();
        let mut to_remove: Vec<RequestId> = Vec::new();
        for (rid, req) in &mut self.st.requests {
            match req.flush(grace) {
                FlushOutcome::Clear => {
                    if req.status.is_terminal() && !req.has_pending() {
                        to_remove.push(rid.clone());
                    }
                }
                FlushOutcome::Backpressured => {}
                FlushOutcome::GraceExceeded => {
                    warn!(request = %rid, "sink refused past grace; dropping request");
                    req.drop_pending();
                    if req.status.is_terminal() {
                        to_remove.push(rid.clone());
                    } else {
                        to_cancel.push(rid.clone());
                    }
                }
            }
        }
        for rid in to_cancel {
            self.cancel_request(&rid);
        }
        for rid in to_remove {
            self.remove_request(&rid);
        }
    }

    fn remove_request(&mut self, rid: &RequestId) {
        if let Some(req) = self.st.requests.remove(rid) {
            for sid in req.seq_ids {
                self.st.seqs.remove(&sid);
            }
        }
    }

    /// Every block-table entry anywhere must be backed by exactly one
    /// allocator reference.
    fn check_accounting(&self) -> bool {
        let table_refs: usize = self.st.seqs.values().map(|s| s.block_table.len()).sum();
        table_refs == self.st.allocator.total_refs()
    }

    /// Unexpected invariant violation: surface an error finish to everything
    /// in flight and stop the thread.
    fn internal_failure(&mut self, msg: &str) {
        error!(reason = msg, "internal failure; terminating scheduler");
        let rids: Vec<RequestId> = self
            .st
            .requests
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.id.clone())
            .collect();
        for rid in rids {
            self.fail_request(&rid, FinishReason::Error);
        }
    }

    fn is_drained(&self) -> bool {
        self.st.requests.is_empty()
            && self.st.waiting.is_empty()
            && self.st.running.is_empty()
            && self.st.swapped.is_empty()
    }

    fn update_gauges(&self) {
        spate_obs::set_pool_gauges(
            self.st.waiting.len() + self.st.swapped.len(),
            self.st.running.len(),
        );
        spate_obs::set_kv_gauges(self.st.allocator.num_free(), self.st.allocator.num_total());
    }
}
