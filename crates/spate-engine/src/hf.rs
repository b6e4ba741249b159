//! Hugging Face `tokenizers` adapter.

use std::path::Path;
use std::sync::Arc;

use spate_common::{Result, SpateError};

use crate::{StreamDecoder, TokenId, Tokenizer};

pub struct HfTokenizer {
    inner: Arc<tokenizers::Tokenizer>,
    eos: Option<TokenId>,
}

impl HfTokenizer {
    pub fn new(inner: tokenizers::Tokenizer, eos: Option<TokenId>) -> Self {
        Self { inner: Arc::new(inner), eos }
    }

    pub fn from_file(path: impl AsRef<Path>, eos: Option<TokenId>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path.as_ref())
            .map_err(|e| SpateError::Internal(format!("tokenizer load: {e}")))?;
        Ok(Self::new(inner, eos))
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        let enc = self
            .inner
            .encode(text, false)
            .map_err(|e| SpateError::InvalidRequest(format!("tokenize: {e}")))?;
        Ok(enc.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[TokenId], skip_special: bool) -> Result<String> {
        self.inner
            .decode(tokens, skip_special)
            .map_err(|e| SpateError::Internal(format!("detokenize: {e}")))
    }

    fn new_stream(&self, skip_special: bool) -> Box<dyn StreamDecoder> {
        Box::new(HfStreamDecoder {
            inner: self.inner.clone(),
            skip_special,
            tokens: Vec::new(),
            prefix_offset: 0,
            read_offset: 0,
        })
    }

    fn eos_token_id(&self) -> Option<TokenId> {
        self.eos
    }
}

/// Offset-tracking incremental decode: hold back output while the tail of the
/// token buffer still decodes to a replacement character (partial UTF-8 from
/// byte-level vocabularies).
pub struct HfStreamDecoder {
    inner: Arc<tokenizers::Tokenizer>,
    skip_special: bool,
    tokens: Vec<TokenId>,
    prefix_offset: usize,
    read_offset: usize,
}

impl StreamDecoder for HfStreamDecoder {
    fn push(&mut self, token: TokenId) -> Option<String> {
        self.tokens.push(token);
        let prefix = self
            .inner
            .decode(&self.tokens[self.prefix_offset..self.read_offset], self.skip_special)
            .ok()?;
        let full = self
            .inner
            .decode(&self.tokens[self.prefix_offset..], self.skip_special)
            .ok()?;
        if full.len() > prefix.len() && !full.ends_with('\u{fffd}') {
            let delta = full[prefix.len()..].to_string();
            self.prefix_offset = self.read_offset;
            self.read_offset = self.tokens.len();
            Some(delta)
        } else {
            None
        }
    }
}
