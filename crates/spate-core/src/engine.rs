//! Thin bridge between the scheduler and the model. The adapter owns the
//! trait object and checks that the returned logits line up with the plan;
//! translating failures into per-sequence finish reasons stays with the
//! scheduler.

use std::sync::Arc;

use spate_engine::{BatchPlan, Engine, EngineError, Logits};

pub struct EngineAdapter {
    inner: Arc<dyn Engine>,
}

impl EngineAdapter {
    pub fn new(inner: Arc<dyn Engine>) -> Self {
        Self { inner }
    }

    /// Synchronous from the scheduler's perspective; returns once logits are
    /// host-visible.
    pub fn execute(&self, plan: &BatchPlan) -> Result<Logits, EngineError> {
        let logits = self.inner.execute(plan)?;
        if logits.num_rows() != plan.num_seqs() {
            return Err(EngineError::internal(format!(
                "engine returned {} logits rows for {} sequences",
                logits.num_rows(),
                plan.num_seqs()
            )));
        }
        Ok(logits)
    }

    pub fn warm_up(&self, max_batch_tokens: usize) -> Result<(), EngineError> {
        self.inner.warm_up(max_batch_tokens)
    }

    pub fn kv_cache_capacity_bytes(&self) -> u64 {
        self.inner.kv_cache_capacity_bytes()
    }

    pub fn block_bytes(&self, block_size: usize) -> u64 {
        self.inner.block_bytes(block_size)
    }
}
