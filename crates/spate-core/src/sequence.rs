//! Per-generation sequence state: the token list, the logical-to-physical
//! block map, sampling configuration, and stop detection over incrementally
//! decoded output text.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use spate_common::{Result, SpateError};
use spate_engine::{BlockId, SeqId, StreamDecoder, TokenId};

use crate::request::RequestId;

/// Why a sequence stopped. When several reasons could fire in one step the
/// strongest wins: cancelled over error over stop over length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Cancelled,
    Error,
    Stop,
    Length,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Cancelled => "cancelled",
            FinishReason::Error => "error",
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            FinishReason::Cancelled => 0,
            FinishReason::Error => 1,
            FinishReason::Stop => 2,
            FinishReason::Length => 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// 0 selects greedy decoding.
    pub temperature: f32,
    pub top_p: f32,
    /// 0 disables the top-k cut.
    pub top_k: usize,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// 1 means no repetition penalty.
    pub repetition_penalty: f32,
    pub max_tokens: usize,
    pub stop: Vec<String>,
    pub stop_token_ids: Vec<TokenId>,
    pub skip_special_tokens: bool,
    pub ignore_eos: bool,
    pub n: usize,
    /// Siblings generated before the top `n` are kept; defaults to `n`.
    pub best_of: Option<usize>,
    /// Additive per-token bias; `f32::NEG_INFINITY` bans a token outright.
    pub logit_bias: HashMap<TokenId, f32>,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            repetition_penalty: 1.0,
            max_tokens: 256,
            stop: Vec::new(),
            stop_token_ids: Vec::new(),
            skip_special_tokens: true,
            ignore_eos: false,
            n: 1,
            best_of: None,
            logit_bias: HashMap::new(),
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn best_of(&self) -> usize {
        self.best_of.unwrap_or(self.n)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.temperature >= 0.0 && self.temperature.is_finite()) {
            return Err(SpateError::InvalidRequest("temperature must be >= 0".into()));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(SpateError::InvalidRequest("top_p must be in (0, 1]".into()));
        }
        if !(0.0..=2.0).contains(&self.frequency_penalty) {
            return Err(SpateError::InvalidRequest("frequency_penalty must be in [0, 2]".into()));
        }
        if !(-2.0..=2.0).contains(&self.presence_penalty) {
            return Err(SpateError::InvalidRequest("presence_penalty must be in [-2, 2]".into()));
        }
        if !(self.repetition_penalty >= 0.0 && self.repetition_penalty.is_finite()) {
            return Err(SpateError::InvalidRequest("repetition_penalty must be >= 0".into()));
        }
        if self.max_tokens == 0 {
            return Err(SpateError::InvalidRequest("max_tokens must be > 0".into()));
        }
        if self.n == 0 {
            return Err(SpateError::InvalidRequest("n must be >= 1".into()));
        }
        if self.best_of() < self.n {
            return Err(SpateError::InvalidRequest("best_of must be >= n".into()));
        }
        if self.stop.iter().any(|s| s.is_empty()) {
            return Err(SpateError::InvalidRequest("stop strings must be non-empty".into()));
        }
        Ok(())
    }

    fn max_stop_len(&self) -> usize {
        self.stop.iter().map(|s| s.len()).max().unwrap_or(0)
    }
}

pub struct Sequence {
    pub id: SeqId,
    pub request_id: RequestId,
    /// Rank inside the owning request; delta ordering within a step follows it.
    pub index: usize,
    pub sampling: Arc<SamplingParams>,
    pub block_table: Vec<BlockId>,
    tokens: Vec<TokenId>,
    num_prompt_tokens: usize,
    /// Tokens whose KV has been written; the gap to `tokens.len()` is what
    /// the next step must feed.
    num_computed_tokens: usize,
    finish: Option<FinishReason>,
    pub cumulative_logprob: f32,
    output_text: String,
    emitted_bytes: usize,
    announced: bool,
    finish_delivered: bool,
    decoder: Box<dyn StreamDecoder>,
    token_counts: HashMap<TokenId, u32>,
    seed: u64,
    rng: StdRng,
}

impl Sequence {
    pub fn new(
        id: SeqId,
        request_id: RequestId,
        index: usize,
        prompt: Vec<TokenId>,
        sampling: Arc<SamplingParams>,
        decoder: Box<dyn StreamDecoder>,
    ) -> Self {
        let seed = derive_seed(&sampling, index);
        let mut token_counts = HashMap::new();
        for &t in &prompt {
            *token_counts.entry(t).or_insert(0) += 1;
        }
        Self {
            id,
            request_id,
            index,
            num_prompt_tokens: prompt.len(),
            tokens: prompt,
            num_computed_tokens: 0,
            block_table: Vec::new(),
            sampling,
            finish: None,
            cumulative_logprob: 0.0,
            output_text: String::new(),
            emitted_bytes: 0,
            announced: false,
            finish_delivered: false,
            decoder,
            token_counts,
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn last_token(&self) -> TokenId {
        *self.tokens.last().unwrap_or(&0)
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.num_prompt_tokens
    }

    pub fn completion_len(&self) -> usize {
        self.tokens.len() - self.num_prompt_tokens
    }

    pub fn num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    pub fn advance_computed(&mut self, n: usize) {
        self.num_computed_tokens += n;
    }

    pub fn output_text(&self) -> &str {
        &self.output_text
    }

    pub fn finish(&self) -> Option<FinishReason> {
        self.finish
    }

    pub fn is_finished(&self) -> bool {
        self.finish.is_some()
    }

    /// Record a finish reason, keeping the stronger one if both fire in the
    /// same step. A terminal sequence accepts no further tokens.
    pub fn set_finish(&mut self, reason: FinishReason) {
        match self.finish {
            Some(current) if current.precedence() <= reason.precedence() => {}
            _ => self.finish = Some(reason),
        }
    }

    /// Blocks this sequence must acquire before one more token can be
    /// committed to the KV cache.
    pub fn num_blocks_needed(&self, block_size: usize) -> usize {
        let covered = (self.num_computed_tokens + block_size) / block_size;
        covered.saturating_sub(self.block_table.len())
    }

    /// Append a sampled token, fold it into the decoded output unless it is
    /// a token-level stop, and evaluate the stop rules.
    pub fn process_token(&mut self, token: TokenId, logprob: f32, eos: Option<TokenId>) -> Option<FinishReason> {
        debug_assert!(self.finish.is_none(), "token appended to a finished sequence");
        self.tokens.push(token);
        *self.token_counts.entry(token).or_insert(0) += 1;
        self.cumulative_logprob += logprob;

        let eos_hit = !self.sampling.ignore_eos && eos == Some(token);
        let token_stop = eos_hit || self.sampling.stop_token_ids.contains(&token);
        if !token_stop {
            let scan_from = self.output_text.len();
            if let Some(delta) = self.decoder.push(token) {
                self.output_text.push_str(&delta);
            }
            if let Some(at) = self.find_stop_string(scan_from) {
                self.output_text.truncate(at);
                self.emitted_bytes = self.emitted_bytes.min(self.output_text.len());
                self.set_finish(FinishReason::Stop);
                return self.finish;
            }
        }

        if token_stop {
            self.set_finish(FinishReason::Stop);
        } else if self.completion_len() >= self.sampling.max_tokens {
            self.set_finish(FinishReason::Length);
        }
        self.finish
    }

    /// Earliest stop-string occurrence reachable from the latest delta. The
    /// scan backs up by the longest stop string so matches straddling a delta
    /// boundary are caught.
    fn find_stop_string(&self, scan_from: usize) -> Option<usize> {
        let max_stop = self.sampling.max_stop_len();
        if max_stop == 0 {
            return None;
        }
        let mut start = scan_from.saturating_sub(max_stop - 1);
        while start > 0 && !self.output_text.is_char_boundary(start) {
            start -= 1;
        }
        self.sampling
            .stop
            .iter()
            .filter_map(|s| self.output_text[start..].find(s.as_str()).map(|i| start + i))
            .min()
    }

    /// Output text not yet handed to the sink. While the sequence is live
    /// the tail that could still complete a stop string is held back, so a
    /// match straddling two steps never leaks streamed text.
    pub fn take_delta(&mut self) -> Option<String> {
        let holdback = if self.is_finished() { 0 } else { self.sampling.max_stop_len().saturating_sub(1) };
        let mut end = self.output_text.len().saturating_sub(holdback);
        while end > 0 && !self.output_text.is_char_boundary(end) {
            end -= 1;
        }
        if end > self.emitted_bytes {
            let delta = self.output_text[self.emitted_bytes..end].to_string();
            self.emitted_bytes = end;
            Some(delta)
        } else {
            None
        }
    }

    /// True exactly once, when the sequence first streams.
    pub fn take_announce(&mut self) -> bool {
        !std::mem::replace(&mut self.announced, true)
    }

    /// True exactly once after the sequence finishes, so a streamed finish is
    /// delivered on a single delta.
    pub fn take_finish_delta(&mut self) -> Option<FinishReason> {
        if self.finish.is_some() && !self.finish_delivered {
            self.finish_delivered = true;
            self.finish
        } else {
            None
        }
    }

    /// Recompute-mode preemption: generated tokens go with the blocks, and
    /// the RNG rewinds so regeneration draws the same stream.
    pub fn reset_for_recompute(&mut self, decoder: Box<dyn StreamDecoder>) {
        self.tokens.truncate(self.num_prompt_tokens);
        self.token_counts.clear();
        for &t in &self.tokens {
            *self.token_counts.entry(t).or_insert(0) += 1;
        }
        self.num_computed_tokens = 0;
        self.cumulative_logprob = 0.0;
        self.output_text.clear();
        self.emitted_bytes = 0;
        self.decoder = decoder;
        self.rng = StdRng::seed_from_u64(self.seed);
    }

    /// Swap-mode preemption keeps everything and only forces a full
    /// re-prefill on resume.
    pub fn prepare_swap_resume(&mut self) {
        self.num_computed_tokens = 0;
    }

    /// Disjoint borrows for the sampler.
    pub fn sampling_parts(&mut self) -> (&SamplingParams, &HashMap<TokenId, u32>, &mut StdRng) {
        (&self.sampling, &self.token_counts, &mut self.rng)
    }
}

fn derive_seed(sampling: &SamplingParams, index: usize) -> u64 {
    match sampling.seed {
        Some(s) => s ^ (index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15),
        None => rand::thread_rng().gen(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spate_engine::mock::{mock_encode, MockTokenizer};
    use spate_engine::Tokenizer;

    fn seq_with(params: SamplingParams, prompt: &str) -> Sequence {
        let tok = MockTokenizer;
        Sequence::new(
            1,
            "req-1".to_string(),
            0,
            mock_encode(prompt),
            Arc::new(params),
            tok.new_stream(true),
        )
    }

    #[test]
    fn blocks_needed_tracks_committed_tokens() {
        let mut seq = seq_with(SamplingParams::default(), "abcdefgh");
        assert_eq!(seq.num_blocks_needed(4), 1);
        seq.block_table = vec![0, 1];
        seq.advance_computed(8);
        assert_eq!(seq.num_blocks_needed(4), 1);
        seq.block_table.push(2);
        assert_eq!(seq.num_blocks_needed(4), 0);
    }

    #[test]
    fn stop_string_truncates_output() {
        let params = SamplingParams { stop: vec!["!".into()], max_tokens: 20, ..Default::default() };
        let mut seq = seq_with(params, "hi");
        for &t in &mock_encode("there") {
            assert_eq!(seq.process_token(t, -0.1, None), None);
        }
        let bang = mock_encode("!")[0];
        assert_eq!(seq.process_token(bang, -0.1, None), Some(FinishReason::Stop));
        assert_eq!(seq.output_text(), "there");
    }

    #[test]
    fn stop_string_matches_across_deltas() {
        let params = SamplingParams { stop: vec!["ab".into()], ..Default::default() };
        let mut seq = seq_with(params, "x");
        assert_eq!(seq.process_token(mock_encode("a")[0], 0.0, None), None);
        assert_eq!(seq.process_token(mock_encode("b")[0], 0.0, None), Some(FinishReason::Stop));
        assert_eq!(seq.output_text(), "");
    }

    #[test]
    fn eos_respects_ignore_eos() {
        let mut seq = seq_with(SamplingParams::default(), "x");
        assert_eq!(seq.process_token(0, 0.0, Some(0)), Some(FinishReason::Stop));

        let params = SamplingParams { ignore_eos: true, max_tokens: 2, ..Default::default() };
        let mut seq = seq_with(params, "x");
        assert_eq!(seq.process_token(0, 0.0, Some(0)), None);
        assert_eq!(seq.process_token(0, 0.0, Some(0)), Some(FinishReason::Length));
    }

    #[test]
    fn length_fires_at_max_tokens() {
        let params = SamplingParams { max_tokens: 1, ..Default::default() };
        let mut seq = seq_with(params, "x");
        let t = mock_encode("y")[0];
        assert_eq!(seq.process_token(t, -0.5, None), Some(FinishReason::Length));
        assert_eq!(seq.completion_len(), 1);
    }

    #[test]
    fn finish_precedence_keeps_the_stronger_reason() {
        let mut seq = seq_with(SamplingParams::default(), "x");
        seq.set_finish(FinishReason::Length);
        seq.set_finish(FinishReason::Cancelled);
        assert_eq!(seq.finish(), Some(FinishReason::Cancelled));
        seq.set_finish(FinishReason::Stop);
        assert_eq!(seq.finish(), Some(FinishReason::Cancelled));
    }

    #[test]
    fn recompute_reset_rewinds_generation_state() {
        let mut seq = seq_with(SamplingParams { seed: Some(7), ..Default::default() }, "ab");
        let before: u32 = seq.sampling_parts().2.gen();
        seq.process_token(mock_encode("c")[0], -0.2, None);
        let tok = MockTokenizer;
        seq.reset_for_recompute(tok.new_stream(true));
        assert_eq!(seq.len(), seq.num_prompt_tokens());
        assert_eq!(seq.completion_len(), 0);
        assert_eq!(seq.cumulative_logprob, 0.0);
        assert_eq!(seq.output_text(), "");
        let after: u32 = seq.sampling_parts().2.gen();
        assert_eq!(before, after);
    }

    #[test]
    fn params_validation_bounds() {
        assert!(SamplingParams::default().validate().is_ok());
        assert!(SamplingParams { temperature: -1.0, ..Default::default() }.validate().is_err());
        assert!(SamplingParams { top_p: 0.0, ..Default::default() }.validate().is_err());
        assert!(SamplingParams { max_tokens: 0, ..Default::default() }.validate().is_err());
        assert!(SamplingParams { n: 2, best_of: Some(1), ..Default::default() }.validate().is_err());
        assert!(SamplingParams { frequency_penalty: 2.5, ..Default::default() }.validate().is_err());
    }
}
