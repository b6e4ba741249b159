//! Continuous-batching scheduler and paged KV cache manager.
//!
//! [`Core::start`] sizes the block pool from the engine, spawns the dedicated
//! scheduler thread, and returns a [`CoreHandle`] producers submit through.
//! Tokenization, template rendering, and request validation happen on the
//! producer side; everything mutable lives with the scheduler thread.

pub mod batch;
pub mod engine;
pub mod kv;
pub mod request;
pub mod sampler;
pub mod scheduler;
pub mod sequence;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::info;

use spate_common::config::CoreConfig;
use spate_common::{Result, SpateError};
use spate_engine::{ChatMessage, ChatTemplate, Engine, Tokenizer};

use crate::engine::EngineAdapter;
use crate::kv::BlockAllocator;
use crate::request::{OutputEvent, OutputSink, Priority, RequestHandle};
use crate::scheduler::{AdmissionMsg, CoreState, Scheduler};
use crate::sequence::SamplingParams;

pub use crate::request::{ChannelSink, Choice, RequestId, RequestStatus, Usage};
pub use crate::sequence::FinishReason;

#[derive(Debug, Clone)]
pub enum RequestInput {
    Prompt(String),
    Messages(Vec<ChatMessage>),
}

pub struct RequestSpec {
    pub input: RequestInput,
    pub sampling: SamplingParams,
    pub priority: Priority,
    pub stream: bool,
}

impl RequestSpec {
    pub fn prompt(text: impl Into<String>, sampling: SamplingParams) -> Self {
        Self {
            input: RequestInput::Prompt(text.into()),
            sampling,
            priority: Priority::Normal,
            stream: false,
        }
    }
}

pub struct Core;

impl Core {
    /// Size the pool, warm the engine, and spawn the scheduler thread.
    pub fn start(
        engine: Arc<dyn Engine>,
        tokenizer: Arc<dyn Tokenizer>,
        template: Arc<dyn ChatTemplate>,
        cfg: CoreConfig,
    ) -> Result<CoreHandle> {
        spate_obs::init();
        let adapter = EngineAdapter::new(engine);
        let allocator = match cfg.num_blocks {
            Some(n) => BlockAllocator::new(n, cfg.block_size),
            None => BlockAllocator::from_capacity(
                adapter.kv_cache_capacity_bytes(),
                adapter.block_bytes(cfg.block_size),
                cfg.block_size,
            ),
        };
        if allocator.num_total() == 0 {
            return Err(SpateError::Internal("KV pool sized to zero blocks".into()));
        }
        adapter
            .warm_up(cfg.max_batch_tokens)
            .map_err(|e| SpateError::Engine(e.to_string()))?;

        let (tx, rx) = mpsc::channel(cfg.admission_queue_capacity);
        let state = CoreState::new(allocator, cfg.preemption_mode, tokenizer.clone());
        let max_context_len = cfg.max_context_len;
        let scheduler = Scheduler::new(state, adapter, cfg, rx);
        std::thread::Builder::new()
            .name("spate-scheduler".into())
            .spawn(move || scheduler.run())
            .map_err(|e| SpateError::Internal(format!("scheduler thread spawn: {e}")))?;
        info!("core started");

        Ok(CoreHandle {
            tx,
            tokenizer,
            template,
            max_context_len,
            next_id: Arc::new(AtomicU64::new(0)),
        })
    }
}

/// Producer-side handle. Cloneable; the scheduler drains remaining work and
/// exits once every clone is dropped.
#[derive(Clone)]
pub struct CoreHandle {
    tx: mpsc::Sender<AdmissionMsg>,
    tokenizer: Arc<dyn Tokenizer>,
    template: Arc<dyn ChatTemplate>,
    max_context_len: usize,
    next_id: Arc<AtomicU64>,
}

impl CoreHandle {
    /// Validate, tokenize, and enqueue a request. Never fails outward:
    /// invalid specs emit a `Rejected` event on the sink and the returned
    /// handle is already terminal. A full admission queue applies
    /// backpressure by suspending the caller.
    pub async fn submit(&self, spec: RequestSpec, sink: Box<dyn OutputSink>) -> RequestHandle {
        let id = format!("req-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = RequestHandle::new(id.clone(), cancel.clone());

        if let Err(e) = spec.sampling.validate() {
            return self.reject(sink, handle, e.to_string());
        }
        if spec.stream && spec.sampling.best_of() > spec.sampling.n {
            return self.reject(sink, handle, "streaming is not supported with best_of > n".into());
        }
        let text = match &spec.input {
            RequestInput::Prompt(t) => t.clone(),
            RequestInput::Messages(ms) => self.template.render(ms),
        };
        let prompt_tokens = match self.tokenizer.encode(&text) {
            Ok(t) => t,
            Err(e) => return self.reject(sink, handle, e.to_string()),
        };
        if prompt_tokens.is_empty() {
            return self.reject(sink, handle, "prompt is empty".into());
        }
        if prompt_tokens.len() >= self.max_context_len {
            return self.reject(sink, handle, "prompt exceeds model context length".into());
        }

        let msg = AdmissionMsg {
            id,
            prompt_tokens,
            sampling: Arc::new(spec.sampling),
            priority: spec.priority,
            stream: spec.stream,
            sink,
            cancel,
            arrival: Instant::now(),
        };
        if let Err(mpsc::error::SendError(msg)) = self.tx.send(msg).await {
            // core shut down between start and submit
            return self.reject(msg.sink, handle, "core is shut down".into());
        }
        handle
    }

    fn reject(&self, sink: Box<dyn OutputSink>, handle: RequestHandle, message: String) -> RequestHandle {
        spate_obs::request_rejected();
        tracing::warn!(request = %handle.id, %message, "request rejected at admission");
        sink.deliver(OutputEvent::Rejected { message });
        handle.cancel();
        handle
    }
}
