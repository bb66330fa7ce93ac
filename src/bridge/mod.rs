//! # Boundary Surface
//!
//! Integer-handle API for callers on the far side of a foreign-function
//! boundary. Every failure is translated into a sentinel (0, -1 or an empty
//! sequence) and logged; nothing here panics on bad input.
//!
//! Handles are drawn from one counter shared by models and sessions, start at
//! 1 and are never reused, so a stale handle cannot name a newer object.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

use crate::engine::{default_thread_count, EngineKind, TokenId};
use crate::error::{Error, SessionError};
use crate::model::ModelHandle;
use crate::session::{InferenceSession, SessionConfig, SamplerConfig, DEFAULT_THREAD_RESERVE};

/// Handle value meaning "no object"
pub const NULL_HANDLE: u64 = 0;
/// Returned by `sample` and `eos_token` when no value is available
pub const NO_TOKEN: i32 = -1;
/// Status returned by `submit` for a handle that names no live session
pub const UNKNOWN_HANDLE: i32 = -1;

type SharedSession = Arc<Mutex<InferenceSession>>;

/// Table of live models and sessions.
pub struct Bridge {
    engine: EngineKind,
    sampler: SamplerConfig,
    next_handle: AtomicU64,
    models: RwLock<HashMap<u64, ModelHandle>>,
    sessions: RwLock<HashMap<u64, SharedSession>>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(EngineKind::default())
    }
}

impl Bridge {
    pub fn new(engine: EngineKind) -> Self {
        Self {
            engine,
            sampler: SamplerConfig::greedy(),
            next_handle: AtomicU64::new(1),
            models: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Sampler used for sessions created from now on
    pub fn with_sampler(mut self, sampler: SamplerConfig) -> Self {
        self.sampler = sampler;
        self
    }

    fn allocate_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn poisoned(what: &str) -> Error {
        SessionError::Unavailable(format!("{} table lock poisoned", what)).into()
    }

    /// Loads a model. Returns its handle, or 0 on failure.
    pub fn load_model(&self, path: &str) -> u64 {
        match self.try_load_model(Path::new(path)) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(path, error = %e, "load_model failed");
                NULL_HANDLE
            }
        }
    }

    pub fn try_load_model(&self, path: &Path) -> Result<u64, Error> {
        let model = ModelHandle::load_with(self.engine, path)?;
        let handle = self.allocate_handle();
        self.models
            .write()
            .map_err(|_| Self::poisoned("model"))?
            .insert(handle, model);
        info!(handle, path = %path.display(), "Model handle issued");
        Ok(handle)
    }

    /// Creates a session on a loaded model. A non-positive thread count
    /// selects the hardware default. Returns the session handle, or 0.
    pub fn create_session(&self, model: u64, capacity: i32, threads: i32) -> u64 {
        match self.try_create_session(model, capacity, threads) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(model, capacity, threads, error = %e, "create_session failed");
                NULL_HANDLE
            }
        }
    }

    pub fn try_create_session(&self, model: u64, capacity: i32, threads: i32) -> Result<u64, Error> {
        let model = self.model(model)?;
        let capacity = u32::try_from(capacity).unwrap_or(0);
        let threads = match u32::try_from(threads) {
            Ok(n) if n > 0 => n,
            _ => default_thread_count(DEFAULT_THREAD_RESERVE),
        };
        let config = SessionConfig::new(capacity, threads).sampler(self.sampler.clone());
        let session = InferenceSession::create_with(&model, &config)?;
        let handle = self.allocate_handle();
        self.sessions
            .write()
            .map_err(|_| Self::poisoned("session"))?
            .insert(handle, Arc::new(Mutex::new(session)));
        info!(handle, capacity, threads, "Session handle issued");
        Ok(handle)
    }

    /// Model behind a model handle.
    pub fn model(&self, handle: u64) -> Result<ModelHandle, Error> {
        self.models
            .read()
            .map_err(|_| Self::poisoned("model"))?
            .get(&handle)
            .cloned()
            .ok_or_else(|| SessionError::UseAfterFree(handle).into())
    }

    /// Shared session behind a session handle, for callers that drive it
    /// directly (for example through the streaming adapter).
    pub fn session(&self, handle: u64) -> Result<SharedSession, Error> {
        self.sessions
            .read()
            .map_err(|_| Self::poisoned("session"))?
            .get(&handle)
            .cloned()
            .ok_or_else(|| SessionError::UseAfterFree(handle).into())
    }

    fn with_session<T>(&self, handle: u64, f: impl FnOnce(&mut InferenceSession) -> T) -> Result<T, Error> {
        let shared = self.session(handle)?;
        let mut session = shared
            .lock()
            .map_err(|e| SessionError::Unavailable(e.to_string()))?;
        Ok(f(&mut session))
    }

    /// Model named by either a model handle or a session handle.
    fn resolve_model(&self, handle: u64) -> Result<ModelHandle, Error> {
        match self.model(handle) {
            Ok(model) => Ok(model),
            Err(_) => self.with_session(handle, |session| session.model().clone()),
        }
    }

    pub fn clear_session(&self, session: u64) {
        if let Err(e) = self.with_session(session, InferenceSession::clear) {
            warn!(session, error = %e, "clear_session on unknown handle");
        }
    }

    /// Token ids for `text`; empty on failure.
    pub fn tokenize(&self, handle: u64, text: &str, add_bos: bool) -> Vec<TokenId> {
        let result = self
            .resolve_model(handle)
            .and_then(|model| model.vocabulary().tokenize(text, add_bos).map_err(Error::from));
        match result {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(handle, error = %e, "tokenize failed");
                Vec::new()
            }
        }
    }

    /// Submits a batch. 0 on success, otherwise the engine status, or
    /// [`UNKNOWN_HANDLE`] when `session` is not live.
    pub fn submit(&self, session: u64, tokens: &[TokenId]) -> i32 {
        match self.with_session(session, |s| s.submit(tokens)) {
            Ok(Ok(())) => 0,
            Ok(Err(e)) => {
                warn!(session, status = e.status, n_past = e.n_past, "submit rejected");
                e.status
            }
            Err(e) => {
                warn!(session, error = %e, "submit on unknown handle");
                UNKNOWN_HANDLE
            }
        }
    }

    /// Next token, or -1 when there is no output to sample from.
    pub fn sample(&self, session: u64) -> TokenId {
        match self.with_session(session, InferenceSession::sample) {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => {
                warn!(session, error = %e, "sample failed");
                NO_TOKEN
            }
            Err(e) => {
                warn!(session, error = %e, "sample on unknown handle");
                NO_TOKEN
            }
        }
    }

    /// Raw bytes for `token`; empty when unprintable or the handle is unknown.
    pub fn detokenize(&self, handle: u64, token: TokenId) -> Vec<u8> {
        match self.resolve_model(handle) {
            Ok(model) => model.vocabulary().detokenize(token),
            Err(e) => {
                warn!(handle, error = %e, "detokenize on unknown handle");
                Vec::new()
            }
        }
    }

    pub fn eos_token(&self, handle: u64) -> TokenId {
        match self.resolve_model(handle) {
            Ok(model) => model.vocabulary().eos_token(),
            Err(e) => {
                warn!(handle, error = %e, "eos_token on unknown handle");
                NO_TOKEN
            }
        }
    }

    /// Position counter of a session, `None` for an unknown handle.
    pub fn n_past(&self, session: u64) -> Option<u32> {
        self.with_session(session, |s| s.n_past()).ok()
    }

    pub fn destroy_session(&self, session: u64) {
        let removed = match self.sessions.write() {
            Ok(mut sessions) => sessions.remove(&session),
            Err(_) => None,
        };
        let Some(shared) = removed else {
            warn!(session, "destroy_session on unknown handle");
            return;
        };
        match Arc::try_unwrap(shared) {
            Ok(mutex) => match mutex.into_inner() {
                Ok(s) => s.destroy(),
                Err(poisoned) => poisoned.into_inner().destroy(),
            },
            // A stream still holds it; it is dropped with the last reference
            Err(_) => info!(session, "Session handle closed while in use elsewhere"),
        }
    }

    /// Drops the handle. Sessions created from the model keep its weights
    /// alive until they are destroyed.
    pub fn release_model(&self, model: u64) {
        let removed = match self.models.write() {
            Ok(mut models) => models.remove(&model),
            Err(_) => None,
        };
        match removed {
            Some(handle) => {
                if !handle.release() {
                    info!(model, "Model weights freed when remaining sessions are destroyed");
                }
            }
            None => warn!(model, "release_model on unknown handle"),
        }
    }

    pub fn live_models(&self) -> usize {
        self.models.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }
}
