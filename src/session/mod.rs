//! # Inference Session
//!
//! Stateful protocol over one decode context: batches of tokens are folded
//! into the key/value cache, and the next token is sampled from the output
//! distribution of the last batch.
//!
//! `n_past` is the number of positions in the cache. It only moves on a
//! successful submission (forward by the batch length) and on `clear` (back
//! to zero), and never exceeds the context capacity.
//!
//! ## Key Components
//!
//! - `InferenceSession`: session state and the submit/sample cycle
//! - `TokenBatch`: one decode request
//! - `Sampler`: picks the next token from an output distribution
//! - `generate`: the full prompt-to-reply loop, with streaming and chat formatting on top

mod batch;
mod chat;
mod generate;
mod sampler;
pub mod stream;

use std::fmt;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{default_thread_count, ContextParams, DecodeContext, TokenId};
use crate::error::{ContextError, DecodeError, SessionError};
use crate::model::ModelHandle;
use crate::vocab::Vocabulary;

pub use batch::{BatchSlot, TokenBatch};
pub use chat::{ChatMessage, ChatTemplate, Role};
pub use generate::{Generation, GenerationParams, StopReason};
pub use sampler::{GreedySampler, Sampler, SamplerConfig, SamplingStrategy, TemperatureSampler};

/// Threads kept free for the caller when no thread count is given
pub const DEFAULT_THREAD_RESERVE: u32 = 2;

/// Settings for a new session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Token capacity of the key/value cache
    pub capacity: u32,
    /// Forward-pass threads
    pub threads: u32,
    pub sampler: SamplerConfig,
}

impl SessionConfig {
    pub fn new(capacity: u32, threads: u32) -> Self {
        Self {
            capacity,
            threads,
            sampler: SamplerConfig::greedy(),
        }
    }

    /// `capacity` tokens on all but `DEFAULT_THREAD_RESERVE` hardware threads.
    pub fn with_capacity(capacity: u32) -> Self {
        Self::new(capacity, default_thread_count(DEFAULT_THREAD_RESERVE))
    }

    pub fn sampler(mut self, sampler: SamplerConfig) -> Self {
        self.sampler = sampler;
        self
    }
}

/// One conversation against a loaded model.
///
/// Fields drop in declaration order: the sampler, then the decode context,
/// then the model reference.
pub struct InferenceSession {
    sampler: Box<dyn Sampler>,
    context: Box<dyn DecodeContext>,
    model: ModelHandle,
    id: Uuid,
    n_past: u32,
}

impl fmt::Debug for InferenceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceSession")
            .field("id", &self.id)
            .field("n_past", &self.n_past)
            .field("capacity", &self.context.capacity())
            .field("sampler", &self.sampler)
            .field("model", &self.model)
            .finish()
    }
}

impl InferenceSession {
    /// Creates a session with a greedy sampler.
    ///
    /// # Arguments
    ///
    /// * `model` - Loaded model; the session holds its own reference
    /// * `capacity` - Maximum number of positions in the cache
    /// * `threads` - Threads the engine may use for a forward pass
    pub fn create(model: &ModelHandle, capacity: u32, threads: u32) -> Result<Self, ContextError> {
        Self::create_with(model, &SessionConfig::new(capacity, threads))
    }

    pub fn create_with(model: &ModelHandle, config: &SessionConfig) -> Result<Self, ContextError> {
        let params = ContextParams::new(config.capacity, config.threads);
        let context = model.weights().clone().new_context(&params)?;
        let id = Uuid::new_v4();
        info!(
            session = %id,
            capacity = config.capacity,
            threads = config.threads,
            sampler = ?config.sampler.strategy,
            "Session created"
        );
        Ok(Self {
            sampler: config.sampler.build(),
            context,
            model: model.clone(),
            id,
            n_past: 0,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Positions currently folded into the cache
    pub fn n_past(&self) -> u32 {
        self.n_past
    }

    pub fn capacity(&self) -> u32 {
        self.context.capacity()
    }

    /// Positions still available before the cache is full
    pub fn remaining(&self) -> u32 {
        self.capacity() - self.n_past
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn vocabulary(&self) -> Vocabulary<'_> {
        self.model.vocabulary()
    }

    /// Replaces the sampler; the cache is untouched.
    pub fn set_sampler(&mut self, config: &SamplerConfig) {
        self.sampler = config.build();
    }

    /// Empties the cache and resets `n_past` to zero.
    pub fn clear(&mut self) {
        self.context.clear_cache();
        self.n_past = 0;
        debug!(session = %self.id, "Session cache cleared");
    }

    /// Evaluates `tokens` at positions `n_past..n_past + tokens.len()`.
    ///
    /// On success `n_past` advances by the number of tokens and the output
    /// distribution for the last token becomes available to [`sample`].
    /// On failure nothing changes.
    ///
    /// [`sample`]: InferenceSession::sample
    pub fn submit(&mut self, tokens: &[TokenId]) -> Result<(), DecodeError> {
        let n_past = self.n_past;
        let rejected = |status| DecodeError {
            status,
            n_past,
            n_tokens: tokens.len(),
        };

        if tokens.is_empty() {
            warn!(session = %self.id, "Rejected empty batch");
            return Err(rejected(DecodeError::EMPTY_BATCH));
        }
        if tokens.len() as u64 + n_past as u64 > self.capacity() as u64 {
            warn!(
                session = %self.id,
                n_past,
                n_tokens = tokens.len(),
                capacity = self.capacity(),
                "Batch does not fit in the remaining context"
            );
            return Err(rejected(DecodeError::NO_CACHE_SLOT));
        }

        let batch = TokenBatch::build(tokens, n_past);
        if let Err(status) = self.context.decode(&batch) {
            warn!(session = %self.id, status, n_past, n_tokens = tokens.len(), "Decode failed");
            return Err(rejected(status));
        }

        self.n_past = n_past + tokens.len() as u32;
        debug!(session = %self.id, before = n_past, after = self.n_past, n_tokens = tokens.len(), "Batch submitted");
        Ok(())
    }

    /// Next token from the output distribution of the last successful submission.
    pub fn sample(&mut self) -> Result<TokenId, SessionError> {
        let logits = self.context.output().ok_or(SessionError::NoOutput)?;
        let token = self.sampler.sample(logits).ok_or(SessionError::NoOutput)?;
        debug!(session = %self.id, token, "Sampled token");
        Ok(token)
    }

    /// Releases the sampler, then the decode context, then this session's
    /// model reference.
    pub fn destroy(self) {
        let Self {
            sampler,
            context,
            model,
            id,
            n_past,
        } = self;
        drop(sampler);
        drop(context);
        drop(model);
        info!(session = %id, n_past, "Session destroyed");
    }
}
