use std::fmt;
use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::InferenceSession;
use crate::engine::TokenId;
use crate::error::Result;
use crate::vocab::PieceDecoder;

/// Limits and options for one generation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Upper bound on sampled tokens, end-of-sequence excluded
    pub max_tokens: u32,
    /// Prefix the prompt with the beginning-of-sequence marker
    pub add_bos: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            add_bos: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced its end-of-sequence token
    EndOfSequence,
    /// `max_tokens` tokens were generated
    MaxTokens,
    /// The context has no room for the next token
    ContextFull,
    /// The piece callback asked to stop
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::EndOfSequence => "end of sequence",
            StopReason::MaxTokens => "token limit reached",
            StopReason::ContextFull => "context full",
            StopReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Result of a generation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    /// Sampled tokens, end-of-sequence excluded
    pub tokens: Vec<TokenId>,
    pub prompt_tokens: usize,
    pub stop_reason: StopReason,
}

impl InferenceSession {
    /// Runs the prompt through the session and samples a reply.
    ///
    /// The prompt is submitted as one batch. Each sampled token is then
    /// submitted on its own so the cache holds the whole exchange, which lets
    /// a later call continue the conversation. Text is passed to `on_piece`
    /// as soon as it forms complete characters.
    ///
    /// # Arguments
    ///
    /// * `prompt` - Text to evaluate; may be empty to continue from the current output
    /// * `params` - Token limit and marker option; the marker is only added
    ///   when the cache is empty
    /// * `on_piece` - Called with each chunk of text; `Break` stops generation
    pub fn generate<F>(&mut self, prompt: &str, params: &GenerationParams, mut on_piece: F) -> Result<Generation>
    where
        F: FnMut(&str) -> ControlFlow<()>,
    {
        // The marker only opens a sequence, never continues one
        let add_bos = params.add_bos && self.n_past == 0;
        let prompt_ids = if prompt.is_empty() {
            Vec::new()
        } else {
            self.vocabulary().tokenize(prompt, add_bos)?
        };
        if !prompt_ids.is_empty() {
            self.submit(&prompt_ids)?;
        }

        let eos = self.vocabulary().eos_token();
        let mut decoder = PieceDecoder::new();
        let mut text = String::new();
        let mut tokens = Vec::new();
        let mut stop_reason = StopReason::MaxTokens;

        for _ in 0..params.max_tokens {
            let token = self.sample()?;
            if token == eos {
                stop_reason = StopReason::EndOfSequence;
                break;
            }
            tokens.push(token);

            let fits = self.remaining() > 0;
            if fits {
                self.submit(&[token])?;
            }

            let piece = decoder.push(&self.vocabulary().detokenize(token));
            if !piece.is_empty() {
                text.push_str(&piece);
                if on_piece(&piece).is_break() {
                    stop_reason = StopReason::Cancelled;
                    break;
                }
            }

            if !fits {
                stop_reason = StopReason::ContextFull;
                break;
            }
        }

        let rest = decoder.flush();
        if !rest.is_empty() {
            text.push_str(&rest);
            let _ = on_piece(&rest);
        }

        info!(
            session = %self.id,
            prompt_tokens = prompt_ids.len(),
            generated = tokens.len(),
            n_past = self.n_past,
            stop = %stop_reason,
            "Generation finished"
        );

        Ok(Generation {
            text,
            tokens,
            prompt_tokens: prompt_ids.len(),
            stop_reason,
        })
    }
}
