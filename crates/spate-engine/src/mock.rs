//! Deterministic in-process engine and byte-level tokenizer for tests.
//!
//! The mock keeps a real slot store keyed by the plan's `slot_ids`, applies
//! `cow_pairs`, and reconstructs each decode sequence from its block table,
//! so scheduler bugs in the paged bookkeeping surface as wrong completions
//! rather than passing silently.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{
    BatchPlan, Engine, EngineError, Logits, StreamDecoder, TokenId, Tokenizer,
};

/// Byte vocabulary shifted by one so id 0 can serve as EOS.
pub const MOCK_VOCAB: usize = 257;
pub const MOCK_EOS: TokenId = 0;

pub fn mock_encode(text: &str) -> Vec<TokenId> {
    text.bytes().map(|b| b as TokenId + 1).collect()
}

#[derive(Debug, Default)]
pub struct MockTokenizer;

impl Tokenizer for MockTokenizer {
    fn encode(&self, text: &str) -> spate_common::Result<Vec<TokenId>> {
        Ok(mock_encode(text))
    }

    fn decode(&self, tokens: &[TokenId], _skip_special: bool) -> spate_common::Result<String> {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter(|&&t| t > 0 && t <= 256)
            .map(|&t| (t - 1) as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    fn new_stream(&self, _skip_special: bool) -> Box<dyn StreamDecoder> {
        Box::new(MockStreamDecoder { pending: Vec::new() })
    }

    fn eos_token_id(&self) -> Option<TokenId> {
        Some(MOCK_EOS)
    }
}

struct MockStreamDecoder {
    pending: Vec<u8>,
}

impl StreamDecoder for MockStreamDecoder {
    fn push(&mut self, token: TokenId) -> Option<String> {
        if token == 0 || token > 256 {
            return None;
        }
        self.pending.push((token - 1) as u8);
        match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let out = s.to_string();
                self.pending.clear();
                Some(out)
            }
            // hold back until the code point completes
            Err(e) if e.error_len().is_none() => None,
            Err(_) => {
                let out = String::from_utf8_lossy(&self.pending).to_string();
                self.pending.clear();
                Some(out)
            }
        }
    }
}

/// Scripted greedy model over the byte vocabulary. Completions are looked up
/// by longest prompt prefix; without a script the model emits a rotation of
/// the last token forever, and a finished script yields EOS.
pub struct MockEngine {
    scripts: Mutex<Vec<(Vec<TokenId>, Vec<TokenId>)>>,
    slots: Mutex<HashMap<u64, TokenId>>,
    fail_next: Mutex<Option<EngineError>>,
    capacity_bytes: u64,
    block_bytes: u64,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(Vec::new()),
            slots: Mutex::new(HashMap::new()),
            fail_next: Mutex::new(None),
            capacity_bytes: 1 << 30,
            block_bytes: 4096,
        }
    }

    pub fn with_pool(capacity_bytes: u64, block_bytes: u64) -> Self {
        Self { capacity_bytes, block_bytes, ..Self::new() }
    }

    /// Register `completion` as the greedy continuation of `prompt`.
    pub fn script(&self, prompt: &str, completion: &str) {
        self.script_tokens(mock_encode(prompt), mock_encode(completion));
    }

    pub fn script_tokens(&self, prompt: Vec<TokenId>, completion: Vec<TokenId>) {
        self.scripts.lock().unwrap().push((prompt, completion));
    }

    /// Make the next `execute` call fail once.
    pub fn fail_next(&self, err: EngineError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    fn scripted_next(&self, tokens: &[TokenId]) -> TokenId {
        let scripts = self.scripts.lock().unwrap();
        let hit = scripts
            .iter()
            .filter(|(prompt, _)| tokens.len() >= prompt.len() && tokens.starts_with(prompt))
            .max_by_key(|(prompt, _)| prompt.len());
        match hit {
            Some((prompt, completion)) => {
                *completion.get(tokens.len() - prompt.len()).unwrap_or(&MOCK_EOS)
            }
            None => tokens.last().map_or(1, |&t| t % 255 + 1),
        }
    }
}

impl Engine for MockEngine {
    fn execute(&self, plan: &BatchPlan) -> Result<Logits, EngineError> {
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }
        let bs = plan.block_size as u64;
        let mut slots = self.slots.lock().unwrap();
        for &(src, dst) in &plan.cow_pairs {
            for off in 0..bs {
                if let Some(&tok) = slots.get(&(src as u64 * bs + off)) {
                    slots.insert(dst as u64 * bs + off, tok);
                }
            }
        }

        let num_prefills = plan.entries.iter().filter(|e| e.is_prefill).count();
        let mut data = Vec::with_capacity(plan.entries.len() * MOCK_VOCAB);
        for (i, entry) in plan.entries.iter().enumerate() {
            let span = plan.entry_span(i);
            let toks = &plan.token_ids[span.clone()];
            for (&tok, &slot) in toks.iter().zip(&plan.slot_ids[span.clone()]) {
                slots.insert(slot as u64, tok);
            }

            let seq_tokens = if entry.is_prefill {
                toks.to_vec()
            } else {
                let table = &plan.block_tables[i - num_prefills];
                let len = plan.positions[span.start] as usize + 1;
                (0..len)
                    .map(|p| {
                        let block = table[p / plan.block_size] as u64;
                        slots.get(&(block * bs + (p % plan.block_size) as u64)).copied().unwrap_or(0)
                    })
                    .collect()
            };

            let favored = self.scripted_next(&seq_tokens);
            let runner_up = favored % 255 + 1;
            let mut row = vec![-30.0_f32; MOCK_VOCAB];
            row[favored as usize] = 4.0;
            if runner_up != favored {
                row[runner_up as usize] = 2.0;
            }
            data.extend(row);
        }
        Logits::new(data, MOCK_VOCAB)
    }

    fn warm_up(&self, _max_batch_tokens: usize) -> Result<(), EngineError> {
        Ok(())
    }

    fn kv_cache_capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    fn block_bytes(&self, _block_size: usize) -> u64 {
        self.block_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_completion_is_prefix_matched() {
        let engine = MockEngine::new();
        engine.script("hi", "ab");
        let prompt = mock_encode("hi");
        assert_eq!(engine.scripted_next(&prompt), mock_encode("a")[0]);
        let mut seen = prompt.clone();
        seen.push(mock_encode("a")[0]);
        assert_eq!(engine.scripted_next(&seen), mock_encode("b")[0]);
        seen.push(mock_encode("b")[0]);
        assert_eq!(engine.scripted_next(&seen), MOCK_EOS);
    }

    #[test]
    fn mock_tokenizer_round_trips_ascii() {
        let tok = MockTokenizer;
        let ids = tok.encode("hello").unwrap();
        assert_eq!(tok.decode(&ids, true).unwrap(), "hello");
        let mut stream = tok.new_stream(true);
        let text: String = ids.iter().filter_map(|&t| stream.push(t)).collect();
        assert_eq!(text, "hello");
    }
}
