//! # Vocabulary Adapter
//!
//! Converts between text and token ids on top of an engine's raw
//! [`VocabTable`]. The raw calls follow the size-then-fill convention: a
//! negative return is the required buffer length, and the call is repeated
//! with a buffer of exactly that size.

use tracing::{debug, warn};

use crate::engine::{TokenId, VocabTable};
use crate::error::TokenizeError;

/// Initial guess for a rendered piece; most pieces fit.
const PIECE_GUESS: usize = 8;

/// Borrowed view of a model's vocabulary.
#[derive(Clone, Copy)]
pub struct Vocabulary<'a> {
    table: &'a dyn VocabTable,
}

impl<'a> Vocabulary<'a> {
    pub fn new(table: &'a dyn VocabTable) -> Self {
        Self { table }
    }

    /// Converts `text` to token ids, optionally prefixed with the
    /// beginning-of-sequence marker.
    ///
    /// Empty text without the marker yields an empty sequence, not an error.
    ///
    /// # Returns
    /// The token ids, or a `TokenizeError` if the tokenizer still reports the
    /// buffer as too small after it was resized to the size it asked for.
    pub fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, TokenizeError> {
        if text.is_empty() && !add_bos {
            return Ok(Vec::new());
        }

        // One slot per byte plus the marker; vocabularies that expand past
        // this go through the retry.
        let mut buf = vec![0 as TokenId; text.len() + usize::from(add_bos)];
        let n = self.table.tokenize_into(text, add_bos, &mut buf);
        if n >= 0 {
            buf.truncate(n as usize);
            return Ok(buf);
        }

        let required = n.unsigned_abs() as usize;
        debug!(offered = buf.len(), required, "Token buffer too small, retrying");
        buf.resize(required, 0);
        let n = self.table.tokenize_into(text, add_bos, &mut buf);
        if n < 0 || n as usize > required {
            return Err(TokenizeError {
                offered: required,
                returned: n,
            });
        }
        buf.truncate(n as usize);
        Ok(buf)
    }

    /// Raw bytes a token renders to. Tokens with no printable form (control
    /// tokens, out-of-range ids) render empty.
    pub fn detokenize(&self, token: TokenId) -> Vec<u8> {
        let mut buf = vec![0u8; PIECE_GUESS];
        let n = self.table.piece_into(token, &mut buf);
        if n >= 0 {
            buf.truncate(n as usize);
            return buf;
        }

        let required = n.unsigned_abs() as usize;
        buf.resize(required, 0);
        let n = self.table.piece_into(token, &mut buf);
        if n < 0 || n as usize > required {
            warn!(token, required, returned = n, "Piece buffer rejected after resize");
            return Vec::new();
        }
        buf.truncate(n as usize);
        buf
    }

    /// Concatenated bytes of every token in `tokens`.
    pub fn detokenize_all(&self, tokens: &[TokenId]) -> Vec<u8> {
        tokens.iter().flat_map(|&t| self.detokenize(t)).collect()
    }

    pub fn eos_token(&self) -> TokenId {
        self.table.eos()
    }

    pub fn bos_token(&self) -> Option<TokenId> {
        self.table.bos()
    }

    pub fn n_tokens(&self) -> usize {
        self.table.n_tokens()
    }
}

/// Assembles rendered pieces into text, holding back bytes of a character
/// that is split across tokens until the rest arrives.
#[derive(Debug, Default)]
pub struct PieceDecoder {
    pending: Vec<u8>,
}

impl PieceDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns whatever now forms complete characters.
    /// Byte sequences that can never become valid are replaced with U+FFFD.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete character at the end, wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
        out
    }

    /// Emits held-back bytes, lossily.
    pub fn flush(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
