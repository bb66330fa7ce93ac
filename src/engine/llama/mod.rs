//! llama.cpp engine via `llama-cpp-2`.
//!
//! The backend is initialized once per process. Each decode context borrows
//! the model it was created from; the borrow is erased to `'static` and the
//! context holds an `Arc` to the weights so the model outlives it.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};
use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::engine::{ContextParams, DecodeContext, Engine, ModelInfo, TokenId, VocabTable, Weights};
use crate::error::{ContextError, DecodeError, LoadError};
use crate::gguf::GGUFReader;
use crate::session::TokenBatch;

static BACKEND: OnceCell<Result<LlamaBackend, String>> = OnceCell::new();

fn backend() -> Result<&'static LlamaBackend, String> {
    BACKEND
        .get_or_init(|| {
            send_logs_to_tracing(LogOptions::default());
            LlamaBackend::init().map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(Clone::clone)
}

#[derive(Debug, Default)]
pub struct LlamaCppEngine;

impl LlamaCppEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Engine for LlamaCppEngine {
    fn name(&self) -> &'static str {
        "llama-cpp"
    }

    fn load_weights(&self, path: &Path) -> Result<Arc<dyn Weights>, LoadError> {
        // Header check first so format problems surface as typed errors
        let reader = GGUFReader::new(path).map_err(|e| LoadError::from_gguf(path, e))?;
        let backend = backend().map_err(LoadError::EngineUnavailable)?;

        let model = LlamaModel::load_from_file(backend, path, &LlamaModelParams::default()).map_err(|e| {
            LoadError::UnrecognizedFormat {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

        let architecture = reader
            .metadata_value("general.architecture")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let name = reader
            .metadata_value("general.name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_default();

        let info = ModelInfo {
            path: path.to_path_buf(),
            engine: self.name().to_string(),
            architecture,
            name,
            n_vocab: model.n_vocab().max(0) as usize,
            n_ctx_train: Some(model.n_ctx_train()),
            tensor_count: reader.tensors.len(),
            loaded_at: Utc::now(),
        };
        info!(path = %path.display(), n_vocab = info.n_vocab, "Loaded llama.cpp model");

        Ok(Arc::new(NativeWeights { model, info }))
    }
}

pub struct NativeWeights {
    model: LlamaModel,
    info: ModelInfo,
}

impl Weights for NativeWeights {
    fn vocab(&self) -> &dyn VocabTable {
        self
    }

    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn new_context(self: Arc<Self>, params: &ContextParams) -> Result<Box<dyn DecodeContext>, ContextError> {
        params.validate()?;
        let backend = backend().map_err(|reason| ContextError::Allocation {
            capacity: params.capacity,
            reason,
        })?;

        let threads = params.threads.min(i32::MAX as u32) as i32;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(params.capacity))
            .with_n_batch(params.capacity)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        // SAFETY: the model lives inside the Arc moved into `NativeContext`,
        // whose `ctx` field is declared (and therefore dropped) first.
        let model: &'static LlamaModel = unsafe { &*(&self.model as *const LlamaModel) };
        let ctx = model
            .new_context(backend, ctx_params)
            .map_err(|e| ContextError::Allocation {
                capacity: params.capacity,
                reason: e.to_string(),
            })?;

        Ok(Box::new(NativeContext {
            ctx,
            capacity: params.capacity,
            last_output: None,
            _weights: self,
        }))
    }
}

impl VocabTable for NativeWeights {
    fn n_tokens(&self) -> usize {
        self.info.n_vocab
    }

    fn eos(&self) -> TokenId {
        self.model.token_eos().0
    }

    fn bos(&self) -> Option<TokenId> {
        Some(self.model.token_bos().0)
    }

    fn tokenize_into(&self, text: &str, add_bos: bool, out: &mut [TokenId]) -> i32 {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        match self.model.str_to_token(text, add_bos) {
            Ok(tokens) => {
                if tokens.len() > out.len() {
                    return -(tokens.len() as i32);
                }
                for (slot, token) in out.iter_mut().zip(&tokens) {
                    *slot = token.0;
                }
                tokens.len() as i32
            }
            Err(e) => {
                warn!(error = %e, "llama.cpp tokenizer failed");
                0
            }
        }
    }

    fn piece_into(&self, token: TokenId, out: &mut [u8]) -> i32 {
        if token < 0 || token as usize >= self.info.n_vocab {
            return 0;
        }
        match self.model.token_to_bytes(LlamaToken::new(token), Special::Plaintext) {
            Ok(bytes) if bytes.len() > out.len() => -(bytes.len() as i32),
            Ok(bytes) => {
                out[..bytes.len()].copy_from_slice(&bytes);
                bytes.len() as i32
            }
            Err(e) => {
                warn!(token, error = %e, "llama.cpp could not render token");
                0
            }
        }
    }
}

pub struct NativeContext {
    ctx: LlamaContext<'static>,
    capacity: u32,
    /// Batch index of the flagged slot from the last successful decode
    last_output: Option<i32>,
    _weights: Arc<NativeWeights>,
}

// SAFETY: a context is only ever used by the session that owns it, one call at a time.
unsafe impl Send for NativeContext {}

fn status_code(err: llama_cpp_2::DecodeError) -> i32 {
    match err {
        llama_cpp_2::DecodeError::NoKvCacheSlot => DecodeError::NO_CACHE_SLOT,
        llama_cpp_2::DecodeError::NTokensZero => DecodeError::EMPTY_BATCH,
        llama_cpp_2::DecodeError::Unknown(code) => code,
    }
}

impl DecodeContext for NativeContext {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn decode(&mut self, batch: &TokenBatch) -> Result<(), i32> {
        if batch.is_empty() {
            return Err(DecodeError::EMPTY_BATCH);
        }

        let mut native = LlamaBatch::new(batch.len(), 1);
        for slot in batch.slots() {
            native
                .add(
                    LlamaToken::new(slot.token),
                    slot.position as i32,
                    &[slot.sequence_id],
                    slot.output,
                )
                .map_err(|e| {
                    warn!(error = %e, "Could not stage batch slot");
                    DecodeError::EMPTY_BATCH
                })?;
        }

        self.ctx.decode(&mut native).map_err(status_code)?;
        self.last_output = batch.output_index().map(|i| i as i32);
        Ok(())
    }

    fn clear_cache(&mut self) {
        self.ctx.clear_kv_cache();
        self.last_output = None;
    }

    fn output(&self) -> Option<&[f32]> {
        self.last_output.map(|i| self.ctx.get_logits_ith(i))
    }
}
