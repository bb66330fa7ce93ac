use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

use crate::gguf::GGUFError;

/// Failure to turn a file on disk into a usable model.
#[derive(Debug)]
pub enum LoadError {
    /// The path could not be opened or read
    Unreadable { path: PathBuf, source: std::io::Error },
    /// The file exists but is not a model format the engine understands
    UnrecognizedFormat { path: PathBuf, reason: String },
    /// The selected engine is not compiled into this build
    EngineUnavailable(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Unreadable { path, source } => {
                write!(f, "cannot read model file {}: {}", path.display(), source)
            }
            LoadError::UnrecognizedFormat { path, reason } => {
                write!(f, "{} is not a recognized model file: {}", path.display(), reason)
            }
            LoadError::EngineUnavailable(name) => {
                write!(f, "engine '{}' is not available in this build", name)
            }
        }
    }
}

impl StdError for LoadError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            LoadError::Unreadable { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl LoadError {
    /// Maps a GGUF parse failure for `path` onto the load taxonomy.
    pub fn from_gguf(path: impl Into<PathBuf>, err: GGUFError) -> Self {
        let path = path.into();
        match err {
            GGUFError::IoError(source) if source.kind() != std::io::ErrorKind::UnexpectedEof => {
                LoadError::Unreadable { path, source }
            }
            other => LoadError::UnrecognizedFormat { path, reason: other.to_string() },
        }
    }
}

/// Failure to allocate or configure a decode context at session creation.
#[derive(Debug)]
pub enum ContextError {
    /// Requested configuration is invalid (zero capacity, zero threads)
    InvalidParams(String),
    /// The engine could not allocate a context of the requested size
    Allocation { capacity: u32, reason: String },
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::InvalidParams(msg) => write!(f, "invalid context parameters: {}", msg),
            ContextError::Allocation { capacity, reason } => {
                write!(f, "failed to allocate a context of {} tokens: {}", capacity, reason)
            }
        }
    }
}

impl StdError for ContextError {}

/// Tokenizer buffer-sizing failure that survived the size-then-fill retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizeError {
    /// Buffer length offered on the final attempt
    pub offered: usize,
    /// Raw engine return value from the final attempt
    pub returned: i32,
}

impl fmt::Display for TokenizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tokenizer rejected a buffer of {} slots after resizing (returned {})",
            self.offered, self.returned
        )
    }
}

impl StdError for TokenizeError {}

/// The engine rejected a batch. The session position is left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    /// Engine status code, never zero
    pub status: i32,
    /// Position counter at the time of the rejected submission
    pub n_past: u32,
    /// Number of tokens in the rejected batch
    pub n_tokens: usize,
}

impl DecodeError {
    /// Status for an empty batch, matching llama.cpp's `llama_decode`.
    pub const EMPTY_BATCH: i32 = -1;
    /// Status for a batch that does not fit in the remaining cache.
    pub const NO_CACHE_SLOT: i32 = 1;

    pub fn is_capacity_exceeded(&self) -> bool {
        self.status == Self::NO_CACHE_SLOT
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "decode of {} tokens at position {} failed with status {}",
            self.n_tokens, self.n_past, self.status
        )
    }
}

impl StdError for DecodeError {}

/// Session-level failures that are not engine rejections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// `sample` was called with no output distribution available
    NoOutput,
    /// A handle did not name a live object
    UseAfterFree(u64),
    /// The session could not be reached (poisoned lock, failed worker)
    Unavailable(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NoOutput => write!(f, "no output distribution available; submit tokens first"),
            SessionError::UseAfterFree(handle) => write!(f, "handle {} is not live", handle),
            SessionError::Unavailable(reason) => write!(f, "session unavailable: {}", reason),
        }
    }
}

impl StdError for SessionError {}

/// Umbrella error for callers that drive a whole conversation.
#[derive(Debug)]
pub enum Error {
    Load(LoadError),
    Context(ContextError),
    Tokenize(TokenizeError),
    Decode(DecodeError),
    Session(SessionError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Load(e) => write!(f, "{}", e),
            Error::Context(e) => write!(f, "{}", e),
            Error::Tokenize(e) => write!(f, "{}", e),
            Error::Decode(e) => write!(f, "{}", e),
            Error::Session(e) => write!(f, "{}", e),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Load(e) => Some(e),
            Error::Context(e) => Some(e),
            Error::Tokenize(e) => Some(e),
            Error::Decode(e) => Some(e),
            Error::Session(e) => Some(e),
        }
    }
}

impl From<LoadError> for Error {
    fn from(err: LoadError) -> Self {
        Error::Load(err)
    }
}

impl From<ContextError> for Error {
    fn from(err: ContextError) -> Self {
        Error::Context(err)
    }
}

impl From<TokenizeError> for Error {
    fn from(err: TokenizeError) -> Self {
        Error::Tokenize(err)
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Decode(err)
    }
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        Error::Session(err)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
