//! # Engine Seam
//!
//! The wrapped inference engine is consumed only through the traits in this
//! module. Everything above it (model handles, sessions, the boundary table)
//! is engine-agnostic.
//!
//! ## Key Components
//!
//! - `Engine`: loads weights from a path
//! - `Weights`: immutable loaded model; owns the vocabulary and creates decode contexts
//! - `DecodeContext`: mutable per-session engine state (key/value cache and latest output)
//! - `VocabTable`: raw tokenizer entry points following the size-then-fill convention
//!
//! Two engines are provided: `reference`, a pure-Rust engine over GGUF files
//! used for tests and for running without native libraries, and `llama`, the
//! llama.cpp engine compiled in with the `llama-cpp` feature.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ContextError, LoadError};
use crate::session::TokenBatch;

pub mod reference;
#[cfg(feature = "llama-cpp")]
pub mod llama;

/// Integer identifier of a vocabulary unit. Matches llama.cpp's `llama_token`.
pub type TokenId = i32;

/// Loads model weights from disk.
pub trait Engine: Send + Sync + fmt::Debug {
    /// Short engine name used in logs and model info
    fn name(&self) -> &'static str;

    /// Reads and validates the model file at `path`.
    fn load_weights(&self, path: &Path) -> Result<Arc<dyn Weights>, LoadError>;
}

/// Immutable loaded weights. Shared read-only by every session created from them.
pub trait Weights: Send + Sync {
    fn vocab(&self) -> &dyn VocabTable;

    fn info(&self) -> &ModelInfo;

    /// Allocates a decode context. The context keeps the weights alive.
    fn new_context(self: Arc<Self>, params: &ContextParams) -> Result<Box<dyn DecodeContext>, ContextError>;
}

/// Mutable engine state for one sequence.
pub trait DecodeContext: Send {
    /// Token capacity the context was created with
    fn capacity(&self) -> u32;

    /// Runs the forward pass for `batch`, folding its positions into the cache.
    ///
    /// On failure returns the engine's non-zero status and leaves the cache
    /// and the previous output untouched.
    fn decode(&mut self, batch: &TokenBatch) -> Result<(), i32>;

    /// Drops every cached position and the current output.
    fn clear_cache(&mut self);

    /// Output distribution (logits over the vocabulary) for the flagged slot
    /// of the most recent successful decode.
    fn output(&self) -> Option<&[f32]>;
}

/// Raw tokenizer surface.
///
/// Both fill methods write into `out` and return the number of elements
/// written, or the negated required length when `out` is too small. Callers
/// go through [`crate::vocab::Vocabulary`], which handles the retry.
pub trait VocabTable: Send + Sync {
    fn n_tokens(&self) -> usize;

    fn eos(&self) -> TokenId;

    fn bos(&self) -> Option<TokenId>;

    fn tokenize_into(&self, text: &str, add_bos: bool, out: &mut [TokenId]) -> i32;

    fn piece_into(&self, token: TokenId, out: &mut [u8]) -> i32;
}

/// Configuration for a decode context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    /// Maximum number of positions the cache can hold
    pub capacity: u32,
    /// CPU threads the forward pass may use
    pub threads: u32,
}

impl ContextParams {
    pub fn new(capacity: u32, threads: u32) -> Self {
        Self { capacity, threads }
    }

    pub(crate) fn validate(&self) -> Result<(), ContextError> {
        if self.capacity == 0 {
            return Err(ContextError::InvalidParams("capacity must be greater than 0".into()));
        }
        if self.threads == 0 {
            return Err(ContextError::InvalidParams("thread count must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Hardware parallelism minus `reserve`, never below one.
pub fn default_thread_count(reserve: u32) -> u32 {
    let available = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    available.saturating_sub(reserve).max(1)
}

/// Descriptive information about loaded weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub path: PathBuf,
    pub engine: String,
    pub architecture: String,
    pub name: String,
    pub n_vocab: usize,
    /// Context length the model was trained with, when the file declares it
    pub n_ctx_train: Option<u32>,
    pub tensor_count: usize,
    pub loaded_at: DateTime<Utc>,
}

/// Which engine to load models with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    #[default]
    Reference,
    LlamaCpp,
}

impl EngineKind {
    pub fn create(&self) -> Result<Arc<dyn Engine>, LoadError> {
        match self {
            EngineKind::Reference => Ok(Arc::new(reference::ReferenceEngine::new())),
            #[cfg(feature = "llama-cpp")]
            EngineKind::LlamaCpp => Ok(Arc::new(llama::LlamaCppEngine::new())),
            #[cfg(not(feature = "llama-cpp"))]
            EngineKind::LlamaCpp => Err(LoadError::EngineUnavailable(self.to_string())),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Reference => write!(f, "reference"),
            EngineKind::LlamaCpp => write!(f, "llama-cpp"),
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reference" => Ok(EngineKind::Reference),
            "llama-cpp" | "llamacpp" | "llama.cpp" => Ok(EngineKind::LlamaCpp),
            other => Err(format!("unknown engine '{}', expected 'reference' or 'llama-cpp'", other)),
        }
    }
}
