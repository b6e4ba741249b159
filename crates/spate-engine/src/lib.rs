//! Contracts the scheduling core consumes: the model engine, the tokenizer,
//! and the chat template. The core treats all three as opaque collaborators;
//! concrete adapters live here so transports and tests share them.

use serde::Deserialize;

pub mod hf;
#[cfg(feature = "mock")]
pub mod mock;

pub type TokenId = u32;
pub type SeqId = u64;
pub type BlockId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    OutOfMemory,
    Device,
    Internal,
}

#[derive(thiserror::Error, Debug, Clone)]
#[error("engine error ({kind:?}): {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self { kind: EngineErrorKind::Internal, message: message.into() }
    }
}

/// One scheduled sequence inside a [`BatchPlan`].
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub seq_id: SeqId,
    pub is_prefill: bool,
    /// Tokens this entry contributes to the flat tensors (whole remaining
    /// prefix for prefill, 1 for decode).
    pub num_tokens: usize,
}

/// Dense per-step input for the model forward pass. Prefill entries precede
/// decode entries; the flat tensors are laid out in entry order.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    pub entries: Vec<PlanEntry>,
    pub token_ids: Vec<TokenId>,
    pub positions: Vec<u32>,
    /// Cumulative token counts per entry, length `entries.len() + 1`.
    pub cu_seq_lens: Vec<u32>,
    /// KV write slot per flat token: `block_id * block_size + offset`.
    pub slot_ids: Vec<u32>,
    /// One row per decode entry, padded with [`BatchPlan::PAD_BLOCK`] to the
    /// widest table in the batch.
    pub block_tables: Vec<Vec<BlockId>>,
    /// Flat index of the final token of each entry; only those rows yield a
    /// sampled token.
    pub last_token_indices: Vec<usize>,
    /// Block copies the model must perform before the forward pass
    /// (copy-on-write divergence of shared blocks).
    pub cow_pairs: Vec<(BlockId, BlockId)>,
    pub block_size: usize,
}

impl BatchPlan {
    pub const PAD_BLOCK: BlockId = BlockId::MAX;

    pub fn num_tokens(&self) -> usize {
        self.token_ids.len()
    }

    pub fn num_seqs(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flat-tensor span of entry `i`.
    pub fn entry_span(&self, i: usize) -> std::ops::Range<usize> {
        self.cu_seq_lens[i] as usize..self.cu_seq_lens[i + 1] as usize
    }
}

/// Row-major `[num_seqs, vocab]` logits returned by the engine.
#[derive(Debug, Clone)]
pub struct Logits {
    data: Vec<f32>,
    vocab: usize,
}

impl Logits {
    pub fn new(data: Vec<f32>, vocab: usize) -> Result<Self, EngineError> {
        if vocab == 0 || data.len() % vocab != 0 {
            return Err(EngineError::internal(format!(
                "logits shape mismatch: {} values for vocab {}",
                data.len(),
                vocab
            )));
        }
        Ok(Self { data, vocab })
    }

    pub fn num_rows(&self) -> usize {
        self.data.len() / self.vocab
    }

    pub fn vocab(&self) -> usize {
        self.vocab
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.vocab..(i + 1) * self.vocab]
    }
}

/// The model seen from the core: one forward call per step plus two one-time
/// capacity calls. `execute` is synchronous from the caller's perspective and
/// returns only when logits are host-visible.
pub trait Engine: Send + Sync {
    fn execute(&self, plan: &BatchPlan) -> Result<Logits, EngineError>;

    fn warm_up(&self, max_batch_tokens: usize) -> Result<(), EngineError>;

    /// Device bytes available for the paged KV cache.
    fn kv_cache_capacity_bytes(&self) -> u64;

    /// Bytes one block of `block_size` tokens occupies for this model.
    fn block_bytes(&self, block_size: usize) -> u64;
}

/// Incremental detokenizer for one sequence. `push` returns a printable text
/// delta once the pending tokens decode to something stable; tokenizers that
/// emit partial characters mid-sequence return `None` until they do.
pub trait StreamDecoder: Send {
    fn push(&mut self, token: TokenId) -> Option<String>;
}

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> spate_common::Result<Vec<TokenId>>;

    fn decode(&self, tokens: &[TokenId], skip_special: bool) -> spate_common::Result<String>;

    fn new_stream(&self, skip_special: bool) -> Box<dyn StreamDecoder>;

    fn eos_token_id(&self) -> Option<TokenId>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Renders a chat transcript into the raw prompt text to tokenize.
pub trait ChatTemplate: Send + Sync {
    fn render(&self, messages: &[ChatMessage]) -> String;
}

/// Fallback template: `role: content` lines and a trailing assistant tag.
#[derive(Debug, Default)]
pub struct RoleTagTemplate;

impl ChatTemplate for RoleTagTemplate {
    fn render(&self, messages: &[ChatMessage]) -> String {
        let mut prompt = String::new();
        for m in messages {
            prompt.push_str(&m.role);
            prompt.push_str(": ");
            prompt.push_str(&m.content);
            prompt.push('\n');
        }
        prompt.push_str("assistant: ");
        prompt
    }
}
