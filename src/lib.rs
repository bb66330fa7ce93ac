//! Incremental inference sessions over a wrapped language-model engine.
//!
//! A [`ModelHandle`] owns loaded weights. An [`InferenceSession`] binds a
//! model to a decode context of fixed capacity and tracks how many positions
//! have been folded into its cache. Tokens go in through
//! [`InferenceSession::submit`], the next token comes out of
//! [`InferenceSession::sample`], and [`Vocabulary`] converts between the two
//! and text. [`Bridge`] exposes the same operations behind integer handles
//! and sentinel return values for callers across an FFI boundary.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod gguf;
pub mod model;
pub mod session;
pub mod vocab;

pub use bridge::Bridge;
pub use engine::{EngineKind, ModelInfo, TokenId};
pub use error::{ContextError, DecodeError, Error, LoadError, Result, SessionError, TokenizeError};
pub use model::ModelHandle;
pub use session::{
    ChatMessage, ChatTemplate, Generation, GenerationParams, InferenceSession, Role, SamplerConfig, SessionConfig,
    StopReason,
};
pub use vocab::{PieceDecoder, Vocabulary};
