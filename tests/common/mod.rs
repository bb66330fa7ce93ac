#![allow(dead_code)]

use std::path::PathBuf;

use llamabridge::gguf::GGUFWriter;
use uuid::Uuid;

pub const UNK: i32 = 0;
pub const BOS: i32 = 1;
pub const EOS: i32 = 2;
pub const SPACE: i32 = 3;
pub const HE: i32 = 8;
pub const LLO: i32 = 9;
pub const WORLD: i32 = 10;
pub const BANG: i32 = 11;

/// Surface forms and GGUF token types (1 normal, 2 unknown, 3 control, 6 byte)
const VOCAB: &[(&str, i32)] = &[
    ("<unk>", 2),
    ("<s>", 3),
    ("</s>", 3),
    ("\u{2581}", 1),
    ("H", 1),
    ("e", 1),
    ("l", 1),
    ("o", 1),
    ("He", 1),
    ("llo", 1),
    ("\u{2581}world", 1),
    ("!", 1),
    ("<0xC3>", 6),
    ("<0xA9>", 6),
    ("w", 1),
    ("r", 1),
    ("d", 1),
];

pub fn n_vocab() -> usize {
    VOCAB.len()
}

pub fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("llamabridge-test-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn writer() -> GGUFWriter {
    let tokens: Vec<&str> = VOCAB.iter().map(|(t, _)| *t).collect();
    let types: Vec<i32> = VOCAB.iter().map(|(_, k)| *k).collect();
    GGUFWriter::new()
        .add_string("general.architecture", "bigram")
        .add_string("general.name", "hello-bigram")
        .add_u32("bigram.context_length", 64)
        .add_string_array("tokenizer.ggml.tokens", &tokens)
        .add_i32_array("tokenizer.ggml.token_type", &types)
        .add_u32("tokenizer.ggml.bos_token_id", BOS as u32)
        .add_u32("tokenizer.ggml.eos_token_id", EOS as u32)
        .add_u32("tokenizer.ggml.unknown_token_id", UNK as u32)
}

/// Model that answers "Hello" with " world!" and then ends the sequence.
pub fn hello_model() -> PathBuf {
    let n = n_vocab();
    let mut table = vec![0.0f32; n * n];
    table[LLO as usize * n + WORLD as usize] = 3.0;
    table[WORLD as usize * n + BANG as usize] = 3.0;
    table[BANG as usize * n + EOS as usize] = 3.0;
    // Anything else drifts towards "!" so generation always terminates
    for prev in 0..n {
        if prev != LLO as usize && prev != WORLD as usize && prev != BANG as usize {
            table[prev * n + BANG as usize] = 1.0;
        }
    }

    let path = temp_dir().join("hello.gguf");
    writer()
        .add_tensor_f32("bigram.weight", &[n as u64, n as u64], table)
        .unwrap()
        .write_to(&path)
        .unwrap();
    path
}

/// Vocabulary only; every logit is zero.
pub fn flat_model() -> PathBuf {
    let path = temp_dir().join("flat.gguf");
    writer().write_to(&path).unwrap();
    path
}

pub fn garbage_file() -> PathBuf {
    let path = temp_dir().join("garbage.gguf");
    std::fs::write(&path, b"this is not a model file at all").unwrap();
    path
}

/// Valid vocabulary, but `bigram.weight` declares 2^90 elements.
pub fn oversized_tensor_model() -> PathBuf {
    let mut bytes = writer()
        .add_tensor_f32("bigram.weight", &[1, 1, 1], vec![0.0])
        .unwrap()
        .to_bytes()
        .unwrap();
    let name = b"bigram.weight";
    let dims_at = bytes.windows(name.len()).position(|w| w == name).unwrap() + name.len() + 4;
    for i in 0..3 {
        bytes[dims_at + i * 8..dims_at + (i + 1) * 8].copy_from_slice(&(1u64 << 30).to_le_bytes());
    }
    let path = temp_dir().join("oversized.gguf");
    std::fs::write(&path, bytes).unwrap();
    path
}
