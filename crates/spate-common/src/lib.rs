pub type Result<T> = core::result::Result<T, SpateError>;

#[derive(thiserror::Error, Debug)]
pub enum SpateError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("out of KV blocks: need {needed}, free {free}")]
    OutOfBlocks { needed: usize, free: usize },
    #[error("engine failure: {0}")]
    Engine(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

pub mod config {
    use serde::Deserialize;
    use std::env;
    use std::time::Duration;

    /// How a preempted request gives its KV blocks back.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
    #[serde(rename_all = "lowercase")]
    pub enum PreemptionMode {
        /// Drop generated tokens along with the blocks and re-prefill from
        /// the prompt when capacity returns.
        #[default]
        Recompute,
        /// Keep generated tokens, release the device blocks, and re-prefill
        /// the full prefix when capacity returns.
        Swap,
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(default)]
    pub struct CoreConfig {
        /// Tokens per KV block.
        pub block_size: usize,
        /// Fixed pool size. When unset the pool is sized from the engine's
        /// reported KV capacity.
        pub num_blocks: Option<usize>,
        /// Token budget per model step.
        pub max_batch_tokens: usize,
        /// Sequence cap per model step.
        pub max_seqs_per_batch: usize,
        pub preemption_mode: PreemptionMode,
        /// Waiting age after which a request is promoted one priority level.
        pub priority_aging_threshold_ms: u64,
        pub admission_queue_capacity: usize,
        /// Prompts at or above this token count are rejected at admission.
        pub max_context_len: usize,
        /// Step budget: half for draining admissions, the rest for the idle
        /// wait when there is no runnable work.
        pub step_timeout_ms: u64,
        /// How long a request may sit behind a refusing sink before it is
        /// cancelled.
        pub sink_grace_ms: u64,
        /// Prefill skips before a passed-over request is bumped one level.
        pub skip_promote_after: u32,
    }

    impl Default for CoreConfig {
        fn default() -> Self {
            Self {
                block_size: 16,
                num_blocks: None,
                max_batch_tokens: 2048,
                max_seqs_per_batch: 64,
                preemption_mode: PreemptionMode::Recompute,
                priority_aging_threshold_ms: 10_000,
                admission_queue_capacity: 256,
                max_context_len: 4096,
                step_timeout_ms: 10,
                sink_grace_ms: 1_000,
                skip_promote_after: 8,
            }
        }
    }

    impl CoreConfig {
        pub fn load() -> Self {
            if let Ok(path) = env::var("SPATE_CONFIG") {
                let Ok(text) = std::fs::read_to_string(path) else { return Self::default() };
                let Ok(cfg) = serde_yaml::from_str::<CoreConfig>(&text) else { return Self::default() };
                return cfg;
            }
            let mut cfg = Self::default();
            if let Some(v) = env_parse("SPATE_BLOCK_SIZE") { cfg.block_size = v; }
            if let Some(v) = env_parse("SPATE_NUM_BLOCKS") { cfg.num_blocks = Some(v); }
            if let Some(v) = env_parse("SPATE_MAX_BATCH_TOKENS") { cfg.max_batch_tokens = v; }
            if let Some(v) = env_parse("SPATE_MAX_SEQS_PER_BATCH") { cfg.max_seqs_per_batch = v; }
            if let Ok(v) = env::var("SPATE_PREEMPTION_MODE") {
                match v.as_str() {
                    "swap" => cfg.preemption_mode = PreemptionMode::Swap,
                    "recompute" => cfg.preemption_mode = PreemptionMode::Recompute,
                    _ => {}
                }
            }
            if let Some(v) = env_parse("SPATE_AGING_THRESHOLD_MS") { cfg.priority_aging_threshold_ms = v; }
            if let Some(v) = env_parse("SPATE_ADMISSION_QUEUE_CAPACITY") { cfg.admission_queue_capacity = v; }
            if let Some(v) = env_parse("SPATE_MAX_CONTEXT_LEN") { cfg.max_context_len = v; }
            if let Some(v) = env_parse("SPATE_STEP_TIMEOUT_MS") { cfg.step_timeout_ms = v; }
            if let Some(v) = env_parse("SPATE_SINK_GRACE_MS") { cfg.sink_grace_ms = v; }
            if let Some(v) = env_parse("SPATE_SKIP_PROMOTE_AFTER") { cfg.skip_promote_after = v; }
            cfg
        }

        pub fn aging_threshold(&self) -> Duration {
            Duration::from_millis(self.priority_aging_threshold_ms)
        }

        pub fn step_timeout(&self) -> Duration {
            Duration::from_millis(self.step_timeout_ms)
        }

        pub fn sink_grace(&self) -> Duration {
            Duration::from_millis(self.sink_grace_ms)
        }
    }

    fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
        env::var(key).ok().and_then(|v| v.parse().ok())
    }
}
