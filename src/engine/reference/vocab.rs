use std::collections::HashMap;

use tracing::debug;

use crate::engine::{TokenId, VocabTable};
use crate::gguf::{GGUFError, GGUFReader, GGUFValue};

/// SentencePiece word-boundary marker, stands in for a space.
pub const SPACE_MARKER: char = '\u{2581}';

/// Token types as stored in `tokenizer.ggml.token_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Normal,
    Unknown,
    Control,
    UserDefined,
    Unused,
    Byte,
}

impl From<i64> for TokenType {
    fn from(value: i64) -> Self {
        match value {
            2 => TokenType::Unknown,
            3 => TokenType::Control,
            4 => TokenType::UserDefined,
            5 => TokenType::Unused,
            6 => TokenType::Byte,
            _ => TokenType::Normal,
        }
    }
}

/// Vocabulary read from GGUF tokenizer metadata, tokenizing by greedy
/// longest match with byte fallback.
#[derive(Debug)]
pub struct ReferenceVocab {
    tokens: Vec<String>,
    types: Vec<TokenType>,
    lookup: HashMap<String, TokenId>,
    byte_tokens: [Option<TokenId>; 256],
    max_token_chars: usize,
    unk: Option<TokenId>,
    bos: Option<TokenId>,
    eos: TokenId,
    add_space_prefix: bool,
}

impl ReferenceVocab {
    pub fn from_reader(reader: &GGUFReader) -> Result<Self, GGUFError> {
        let tokens: Vec<String> = reader
            .get_metadata_value("tokenizer.ggml.tokens")?
            .as_array()
            .ok_or_else(|| GGUFError::InvalidFormat("tokenizer.ggml.tokens is not an array".into()))?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| GGUFError::InvalidFormat("tokenizer.ggml.tokens contains non-string entries".into()))?;

        if tokens.is_empty() {
            return Err(GGUFError::InvalidFormat("tokenizer.ggml.tokens is empty".into()));
        }

        let types: Vec<TokenType> = match reader.metadata_value("tokenizer.ggml.token_type") {
            Some(GGUFValue::Array(items)) => {
                if items.len() != tokens.len() {
                    return Err(GGUFError::InvalidFormat(format!(
                        "tokenizer.ggml.token_type has {} entries for {} tokens",
                        items.len(),
                        tokens.len()
                    )));
                }
                items.iter().map(|v| TokenType::from(v.as_int().unwrap_or(1))).collect()
            }
            _ => vec![TokenType::Normal; tokens.len()],
        };

        let token_id = |key: &str| -> Result<Option<TokenId>, GGUFError> {
            match reader.metadata_value(key).and_then(|v| v.as_int()) {
                Some(id) if id >= 0 && (id as usize) < tokens.len() => Ok(Some(id as TokenId)),
                Some(id) => Err(GGUFError::InvalidFormat(format!("{} = {} is outside the vocabulary", key, id))),
                None => Ok(None),
            }
        };

        let bos = token_id("tokenizer.ggml.bos_token_id")?;
        let unk = token_id("tokenizer.ggml.unknown_token_id")?
            .or_else(|| types.iter().position(|t| *t == TokenType::Unknown).map(|i| i as TokenId));
        let eos = match token_id("tokenizer.ggml.eos_token_id")? {
            Some(id) => id,
            None => tokens
                .iter()
                .position(|t| t == "</s>" || t == "<|endoftext|>" || t == "<|end|>")
                .map(|i| i as TokenId)
                .ok_or(GGUFError::MetadataNotFound("tokenizer.ggml.eos_token_id".into()))?,
        };
        let add_space_prefix = matches!(
            reader.metadata_value("tokenizer.ggml.add_space_prefix"),
            Some(GGUFValue::Bool(true))
        );

        Ok(Self::new(tokens, types, bos, eos, unk, add_space_prefix))
    }

    pub fn new(
        tokens: Vec<String>,
        types: Vec<TokenType>,
        bos: Option<TokenId>,
        eos: TokenId,
        unk: Option<TokenId>,
        add_space_prefix: bool,
    ) -> Self {
        let mut lookup = HashMap::with_capacity(tokens.len());
        let mut byte_tokens = [None; 256];
        let mut max_token_chars = 1;

        for (id, (text, kind)) in tokens.iter().zip(&types).enumerate() {
            let id = id as TokenId;
            match kind {
                TokenType::Byte => {
                    if let Some(byte) = parse_byte_token(text) {
                        byte_tokens[byte as usize] = Some(id);
                    }
                }
                TokenType::Normal | TokenType::UserDefined => {
                    // First occurrence wins for duplicated surface forms
                    lookup.entry(text.clone()).or_insert(id);
                    max_token_chars = max_token_chars.max(text.chars().count());
                }
                _ => {}
            }
        }

        Self {
            tokens,
            types,
            lookup,
            byte_tokens,
            max_token_chars,
            unk,
            bos,
            eos,
            add_space_prefix,
        }
    }

    pub fn tokenize(&self, text: &str, add_bos: bool) -> Vec<TokenId> {
        let mut ids = Vec::new();
        if add_bos {
            if let Some(bos) = self.bos {
                ids.push(bos);
            }
        }
        if text.is_empty() {
            return ids;
        }

        let mut normalized = String::with_capacity(text.len() + 3);
        if self.add_space_prefix {
            normalized.push(SPACE_MARKER);
        }
        normalized.extend(text.chars().map(|c| if c == ' ' { SPACE_MARKER } else { c }));

        let boundaries: Vec<usize> = normalized
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(normalized.len()))
            .collect();
        let n_chars = boundaries.len() - 1;

        let mut start = 0;
        while start < n_chars {
            let longest = self.max_token_chars.min(n_chars - start);
            let matched = (1..=longest).rev().find_map(|len| {
                let piece = &normalized[boundaries[start]..boundaries[start + len]];
                self.lookup.get(piece).map(|id| (*id, len))
            });

            match matched {
                Some((id, len)) => {
                    ids.push(id);
                    start += len;
                }
                None => {
                    let piece = &normalized[boundaries[start]..boundaries[start + 1]];
                    self.push_fallback(piece, &mut ids);
                    start += 1;
                }
            }
        }
        ids
    }

    fn push_fallback(&self, piece: &str, ids: &mut Vec<TokenId>) {
        let bytes = piece.as_bytes();
        if bytes.iter().all(|b| self.byte_tokens[*b as usize].is_some()) {
            ids.extend(bytes.iter().filter_map(|b| self.byte_tokens[*b as usize]));
        } else if let Some(unk) = self.unk {
            ids.push(unk);
        } else {
            debug!(piece, "No token or byte fallback for character, dropping it");
        }
    }

    /// Bytes a token renders to. Control, unused and out-of-range tokens render empty.
    pub fn piece(&self, token: TokenId) -> Vec<u8> {
        if token < 0 || token as usize >= self.tokens.len() {
            return Vec::new();
        }
        let text = &self.tokens[token as usize];
        match self.types[token as usize] {
            TokenType::Control | TokenType::Unused => Vec::new(),
            TokenType::Byte => parse_byte_token(text).map(|b| vec![b]).unwrap_or_default(),
            _ => text.replace(SPACE_MARKER, " ").into_bytes(),
        }
    }
}

impl VocabTable for ReferenceVocab {
    fn n_tokens(&self) -> usize {
        self.tokens.len()
    }

    fn eos(&self) -> TokenId {
        self.eos
    }

    fn bos(&self) -> Option<TokenId> {
        self.bos
    }

    fn tokenize_into(&self, text: &str, add_bos: bool, out: &mut [TokenId]) -> i32 {
        let ids = self.tokenize(text, add_bos);
        fill(&ids, out)
    }

    fn piece_into(&self, token: TokenId, out: &mut [u8]) -> i32 {
        let bytes = self.piece(token);
        fill(&bytes, out)
    }
}

fn fill<T: Copy>(src: &[T], out: &mut [T]) -> i32 {
    if src.len() > out.len() {
        return -(src.len() as i32);
    }
    out[..src.len()].copy_from_slice(src);
    src.len() as i32
}

/// Parses `<0xNN>` byte token text.
fn parse_byte_token(text: &str) -> Option<u8> {
    let hex = text.strip_prefix("<0x")?.strip_suffix('>')?;
    u8::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> ReferenceVocab {
        let mut tokens: Vec<String> = vec!["<unk>", "<s>", "</s>", "\u{2581}", "H", "e", "l", "o", "He", "llo", "\u{2581}world"]
            .into_iter()
            .map(String::from)
            .collect();
        let mut types = vec![TokenType::Unknown, TokenType::Control, TokenType::Control];
        types.extend(std::iter::repeat(TokenType::Normal).take(tokens.len() - 3));
        for byte in [0xC3u8, 0xA9] {
            tokens.push(format!("<0x{:02X}>", byte));
            types.push(TokenType::Byte);
        }
        ReferenceVocab::new(tokens, types, Some(1), 2, Some(0), false)
    }

    #[test]
    fn test_greedy_longest_match() {
        let v = vocab();
        assert_eq!(v.tokenize("Hello world", false), vec![8, 9, 10]);
    }

    #[test]
    fn test_bos_is_prepended() {
        let v = vocab();
        assert_eq!(v.tokenize("Hello", true), vec![1, 8, 9]);
        assert_eq!(v.tokenize("", true), vec![1]);
        assert!(v.tokenize("", false).is_empty());
    }

    #[test]
    fn test_byte_fallback_and_unknown() {
        let v = vocab();
        // é = C3 A9, both byte tokens exist
        assert_eq!(v.tokenize("é", false), vec![11, 12]);
        // 'z' has neither a token nor byte tokens
        assert_eq!(v.tokenize("z", false), vec![0]);
    }

    #[test]
    fn test_pieces() {
        let v = vocab();
        assert_eq!(v.piece(10), b" world".to_vec());
        assert_eq!(v.piece(11), vec![0xC3]);
        assert!(v.piece(2).is_empty());
        assert!(v.piece(-5).is_empty());
        assert!(v.piece(10_000).is_empty());
    }

    #[test]
    fn test_fill_reports_required_size() {
        let v = vocab();
        let mut small = [0; 1];
        assert_eq!(v.tokenize_into("Hello world", false, &mut small), -3);
        let mut big = [0; 8];
        assert_eq!(v.tokenize_into("Hello world", false, &mut big), 3);
        assert_eq!(&big[..3], &[8, 9, 10]);

        let mut empty: [u8; 0] = [];
        assert_eq!(v.piece_into(10, &mut empty), -6);
        assert_eq!(v.piece_into(2, &mut empty), 0);
    }

    #[test]
    fn test_parse_byte_token() {
        assert_eq!(parse_byte_token("<0x0A>"), Some(0x0A));
        assert_eq!(parse_byte_token("<0xZZ>"), None);
        assert_eq!(parse_byte_token("0x0A"), None);
    }
}
