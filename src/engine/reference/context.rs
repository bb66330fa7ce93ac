use std::sync::Arc;

use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::debug;

use super::ReferenceWeights;
use crate::engine::{ContextParams, DecodeContext, TokenId, VocabTable};
use crate::error::{ContextError, DecodeError};
use crate::session::TokenBatch;

/// Status for a malformed batch (bad position, sequence or token id)
const INVALID_BATCH: i32 = -1;

/// Decode state of the reference engine. The key/value cache is the list of
/// token ids folded in so far.
pub struct ReferenceContext {
    weights: Arc<ReferenceWeights>,
    capacity: u32,
    cache: Vec<TokenId>,
    output: Option<Vec<f32>>,
    pool: ThreadPool,
}

impl ReferenceContext {
    pub fn new(weights: Arc<ReferenceWeights>, params: &ContextParams) -> Result<Self, ContextError> {
        let mut cache = Vec::new();
        cache
            .try_reserve_exact(params.capacity as usize)
            .map_err(|e| ContextError::Allocation { capacity: params.capacity, reason: e.to_string() })?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(params.threads as usize)
            .thread_name(|i| format!("reference-decode-{}", i))
            .build()
            .map_err(|e| ContextError::Allocation { capacity: params.capacity, reason: e.to_string() })?;

        Ok(Self {
            weights,
            capacity: params.capacity,
            cache,
            output: None,
            pool,
        })
    }

    /// Tokens currently held in the cache, oldest first
    pub fn cached_tokens(&self) -> &[TokenId] {
        &self.cache
    }

    fn compute_output(&self, prev: TokenId) -> Vec<f32> {
        let n_vocab = self.weights.reference_vocab().n_tokens();
        let weights = &self.weights;
        let mut logits = vec![0f32; n_vocab];
        self.pool.install(|| {
            logits
                .par_iter_mut()
                .enumerate()
                .for_each(|(next, logit)| *logit = weights.logit(prev as usize, next));
        });
        logits
    }
}

impl DecodeContext for ReferenceContext {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn decode(&mut self, batch: &TokenBatch) -> Result<(), i32> {
        if batch.is_empty() {
            return Err(DecodeError::EMPTY_BATCH);
        }

        let n_cached = self.cache.len();
        if n_cached + batch.len() > self.capacity as usize {
            debug!(n_cached, n_tokens = batch.len(), capacity = self.capacity, "No cache slot for batch");
            return Err(DecodeError::NO_CACHE_SLOT);
        }

        let n_vocab = self.weights.reference_vocab().n_tokens();
        for (i, slot) in batch.slots().iter().enumerate() {
            let in_vocab = slot.token >= 0 && (slot.token as usize) < n_vocab;
            if slot.sequence_id != TokenBatch::SEQUENCE_ID
                || slot.position as usize != n_cached + i
                || !in_vocab
            {
                debug!(?slot, expected_position = n_cached + i, "Rejecting malformed batch slot");
                return Err(INVALID_BATCH);
            }
        }

        let output = batch
            .output_index()
            .map(|i| self.compute_output(batch.slots()[i].token));

        self.cache.extend(batch.slots().iter().map(|slot| slot.token));
        self.output = output;
        Ok(())
    }

    fn clear_cache(&mut self) {
        self.cache.clear();
        self.output = None;
    }

    fn output(&self) -> Option<&[f32]> {
        self.output.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reference::{TokenType, ReferenceVocab};
    use crate::engine::ModelInfo;
    use chrono::Utc;
    use ndarray::Array2;

    fn weights() -> Arc<ReferenceWeights> {
        let tokens: Vec<String> = ["<s>", "</s>", "a", "b"].iter().map(|s| s.to_string()).collect();
        let types = vec![TokenType::Control, TokenType::Control, TokenType::Normal, TokenType::Normal];
        let vocab = ReferenceVocab::new(tokens, types, Some(0), 1, None, false);
        // After "a" prefer "b", after "b" prefer end of sequence
        let mut table = Array2::<f32>::zeros((4, 4));
        table[[2, 3]] = 1.0;
        table[[3, 1]] = 1.0;
        Arc::new(ReferenceWeights {
            info: ModelInfo {
                path: "mem".into(),
                engine: "reference".into(),
                architecture: "bigram".into(),
                name: "test".into(),
                n_vocab: 4,
                n_ctx_train: None,
                tensor_count: 1,
                loaded_at: Utc::now(),
            },
            vocab,
            bigram: Some(table),
            bias: None,
        })
    }

    fn context(capacity: u32) -> ReferenceContext {
        ReferenceContext::new(weights(), &ContextParams::new(capacity, 2)).unwrap()
    }

    #[test]
    fn test_decode_appends_and_sets_output() {
        let mut ctx = context(8);
        ctx.decode(&TokenBatch::build(&[0, 2], 0)).unwrap();
        assert_eq!(ctx.cached_tokens(), &[0, 2]);
        assert_eq!(ctx.output().unwrap(), &[0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_rejects_gap_in_positions() {
        let mut ctx = context(8);
        ctx.decode(&TokenBatch::build(&[2], 0)).unwrap();
        assert_eq!(ctx.decode(&TokenBatch::build(&[3], 5)), Err(INVALID_BATCH));
        assert_eq!(ctx.cached_tokens(), &[2]);
    }

    #[test]
    fn test_capacity_exceeded_keeps_state() {
        let mut ctx = context(2);
        ctx.decode(&TokenBatch::build(&[2], 0)).unwrap();
        let before = ctx.output().map(|o| o.to_vec());
        assert_eq!(ctx.decode(&TokenBatch::build(&[3, 2], 1)), Err(DecodeError::NO_CACHE_SLOT));
        assert_eq!(ctx.cached_tokens(), &[2]);
        assert_eq!(ctx.output().map(|o| o.to_vec()), before);
    }

    #[test]
    fn test_out_of_vocab_and_empty_rejected() {
        let mut ctx = context(8);
        assert_eq!(ctx.decode(&TokenBatch::build(&[], 0)), Err(DecodeError::EMPTY_BATCH));
        assert_eq!(ctx.decode(&TokenBatch::build(&[9], 0)), Err(INVALID_BATCH));
    }

    #[test]
    fn test_clear_drops_cache_and_output() {
        let mut ctx = context(8);
        ctx.decode(&TokenBatch::build(&[2, 3], 0)).unwrap();
        ctx.clear_cache();
        assert!(ctx.cached_tokens().is_empty());
        assert!(ctx.output().is_none());
        ctx.decode(&TokenBatch::build(&[2], 0)).unwrap();
    }
}
