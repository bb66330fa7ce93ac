//! Pure-Rust engine over GGUF files.
//!
//! The "model" is a bigram table: the output distribution for a position is
//! row `token` of `bigram.weight` plus `output_bias.weight`. Both tensors are
//! optional; without them every logit is zero and greedy sampling falls back
//! to the lowest token id. This keeps the session protocol fully exercisable
//! without native libraries.

mod context;
mod vocab;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use ndarray::{Array1, Array2};
use tracing::info;

use crate::engine::{ContextParams, DecodeContext, Engine, ModelInfo, VocabTable, Weights};
use crate::error::{ContextError, LoadError};
use crate::gguf::{GGUFError, GGUFReader};

pub use context::ReferenceContext;
pub use vocab::{ReferenceVocab, TokenType, SPACE_MARKER};

/// Largest context the reference engine will allocate
pub const MAX_CONTEXT: u32 = 1 << 20;

pub const BIGRAM_TENSOR: &str = "bigram.weight";
pub const BIAS_TENSOR: &str = "output_bias.weight";

#[derive(Debug, Default)]
pub struct ReferenceEngine;

impl ReferenceEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Engine for ReferenceEngine {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn load_weights(&self, path: &Path) -> Result<Arc<dyn Weights>, LoadError> {
        let weights = ReferenceWeights::load(path).map_err(|e| LoadError::from_gguf(path, e))?;
        info!(
            path = %path.display(),
            n_vocab = weights.info.n_vocab,
            has_bigram = weights.bigram.is_some(),
            "Loaded reference weights"
        );
        Ok(Arc::new(weights))
    }
}

/// Vocabulary and logit tables read from a GGUF file.
pub struct ReferenceWeights {
    info: ModelInfo,
    vocab: ReferenceVocab,
    bigram: Option<Array2<f32>>,
    bias: Option<Array1<f32>>,
}

impl ReferenceWeights {
    pub fn load(path: &Path) -> Result<Self, GGUFError> {
        let reader = GGUFReader::new(path)?;
        let vocab = ReferenceVocab::from_reader(&reader)?;
        let n_vocab = vocab.n_tokens();

        let bigram = reader
            .tensor_f32(BIGRAM_TENSOR)?
            .map(|data| Array2::from_shape_vec((n_vocab, n_vocab), data))
            .transpose()
            .map_err(|e| GGUFError::InvalidFormat(format!("{} must be [n_vocab, n_vocab]: {}", BIGRAM_TENSOR, e)))?;

        let bias = match reader.tensor_f32(BIAS_TENSOR)? {
            Some(data) if data.len() == n_vocab => Some(Array1::from_vec(data)),
            Some(data) => {
                return Err(GGUFError::InvalidFormat(format!(
                    "{} has {} elements for a vocabulary of {}",
                    BIAS_TENSOR,
                    data.len(),
                    n_vocab
                )))
            }
            None => None,
        };

        let architecture = reader
            .metadata_value("general.architecture")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let name = reader
            .metadata_value("general.name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_default();
        let n_ctx_train = reader
            .metadata_value(&format!("{}.context_length", architecture))
            .and_then(|v| v.as_int())
            .map(|v| v as u32);

        Ok(Self {
            info: ModelInfo {
                path: path.to_path_buf(),
                engine: "reference".to_string(),
                architecture,
                name,
                n_vocab,
                n_ctx_train,
                tensor_count: reader.tensors.len(),
                loaded_at: Utc::now(),
            },
            vocab,
            bigram,
            bias,
        })
    }

    pub fn reference_vocab(&self) -> &ReferenceVocab {
        &self.vocab
    }

    /// Logit of `next` given that the previous position holds `prev`.
    pub(crate) fn logit(&self, prev: usize, next: usize) -> f32 {
        let base = self.bigram.as_ref().map(|table| table[[prev, next]]).unwrap_or(0.0);
        base + self.bias.as_ref().map(|bias| bias[next]).unwrap_or(0.0)
    }
}

impl Weights for ReferenceWeights {
    fn vocab(&self) -> &dyn VocabTable {
        &self.vocab
    }

    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn new_context(self: Arc<Self>, params: &ContextParams) -> Result<Box<dyn DecodeContext>, ContextError> {
        params.validate()?;
        if params.capacity > MAX_CONTEXT {
            return Err(ContextError::Allocation {
                capacity: params.capacity,
                reason: format!("reference engine supports at most {} positions", MAX_CONTEXT),
            });
        }
        Ok(Box::new(ReferenceContext::new(self, params)?))
    }
}
