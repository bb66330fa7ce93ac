mod common;

use llamabridge::engine::reference::MAX_CONTEXT;
use llamabridge::error::{ContextError, DecodeError, LoadError, SessionError};
use llamabridge::{InferenceSession, ModelHandle};

use common::*;

fn load_hello() -> ModelHandle {
    ModelHandle::load(hello_model()).unwrap()
}

#[test]
fn test_load_missing_file_is_unreadable() {
    let path = temp_dir().join("does-not-exist.gguf");
    let err = ModelHandle::load(&path).unwrap_err();
    assert!(matches!(err, LoadError::Unreadable { .. }), "got {:?}", err);
}

#[test]
fn test_load_garbage_is_unrecognized() {
    let err = ModelHandle::load(garbage_file()).unwrap_err();
    assert!(matches!(err, LoadError::UnrecognizedFormat { .. }), "got {:?}", err);
}

#[test]
fn test_load_overflowing_tensor_shape_is_unrecognized() {
    let err = ModelHandle::load(oversized_tensor_model()).unwrap_err();
    assert!(matches!(err, LoadError::UnrecognizedFormat { .. }), "got {:?}", err);
}

#[test]
fn test_create_rejects_bad_params() {
    let model = load_hello();
    assert!(matches!(
        InferenceSession::create(&model, 0, 1),
        Err(ContextError::InvalidParams(_))
    ));
    assert!(matches!(
        InferenceSession::create(&model, MAX_CONTEXT + 1, 1),
        Err(ContextError::Allocation { .. })
    ));
}

#[test]
fn test_n_past_accumulates_and_clears() {
    let model = load_hello();
    let mut session = InferenceSession::create(&model, 32, 1).unwrap();
    assert_eq!(session.n_past(), 0);

    session.submit(&[BOS, HE, LLO]).unwrap();
    assert_eq!(session.n_past(), 3);
    session.submit(&[WORLD]).unwrap();
    session.submit(&[BANG, SPACE]).unwrap();
    assert_eq!(session.n_past(), 6);
    assert_eq!(session.remaining(), 26);

    session.clear();
    assert_eq!(session.n_past(), 0);
    session.submit(&[BOS]).unwrap();
    assert_eq!(session.n_past(), 1);
}

#[test]
fn test_overflowing_submit_leaves_n_past() {
    let model = load_hello();
    let mut session = InferenceSession::create(&model, 16, 1).unwrap();

    session.submit(&[HE; 10]).unwrap();
    assert_eq!(session.n_past(), 10);

    let err = session.submit(&[HE; 10]).unwrap_err();
    assert!(err.is_capacity_exceeded());
    assert_eq!(err.n_past, 10);
    assert_eq!(err.n_tokens, 10);
    assert_eq!(session.n_past(), 10);

    // Whatever still fits is accepted
    session.submit(&[HE; 6]).unwrap();
    assert_eq!(session.n_past(), 16);
    assert_eq!(session.remaining(), 0);
}

#[test]
fn test_empty_submit_is_rejected() {
    let model = load_hello();
    let mut session = InferenceSession::create(&model, 8, 1).unwrap();
    let err = session.submit(&[]).unwrap_err();
    assert_eq!(err.status, DecodeError::EMPTY_BATCH);
    assert_eq!(session.n_past(), 0);
}

#[test]
fn test_sample_before_submit_has_no_output() {
    let model = load_hello();
    let mut session = InferenceSession::create(&model, 8, 1).unwrap();
    assert!(matches!(session.sample(), Err(SessionError::NoOutput)));
}

#[test]
fn test_sample_is_repeatable_without_submit() {
    let model = load_hello();
    let mut session = InferenceSession::create(&model, 8, 1).unwrap();
    session.submit(&[BOS, HE, LLO]).unwrap();
    assert_eq!(session.sample().unwrap(), WORLD);
    assert_eq!(session.sample().unwrap(), WORLD);
    assert_eq!(session.n_past(), 3);
}

#[test]
fn test_recreated_session_starts_empty() {
    let model = load_hello();
    let mut session = InferenceSession::create(&model, 8, 1).unwrap();
    session.submit(&[BOS, HE]).unwrap();
    session.destroy();

    let session = InferenceSession::create(&model, 8, 1).unwrap();
    assert_eq!(session.n_past(), 0);
}

#[test]
fn test_sessions_share_a_model() {
    let model = load_hello();
    let mut first = InferenceSession::create(&model, 8, 1).unwrap();
    let mut second = InferenceSession::create(&model, 8, 1).unwrap();
    assert!(first.model().same_weights(second.model()));

    first.submit(&[BOS, HE, LLO]).unwrap();
    second.submit(&[WORLD]).unwrap();
    assert_eq!(first.n_past(), 3);
    assert_eq!(second.n_past(), 1);
    assert_eq!(first.sample().unwrap(), WORLD);
    assert_eq!(second.sample().unwrap(), BANG);
}

#[test]
fn test_session_outlives_released_handle() {
    let model = load_hello();
    let mut session = InferenceSession::create(&model, 8, 1).unwrap();
    assert!(!model.release());

    session.submit(&[BOS, HE, LLO]).unwrap();
    assert_eq!(session.sample().unwrap(), WORLD);
    assert_eq!(session.vocabulary().eos_token(), EOS);
}

#[test]
fn test_end_to_end_generation_loop() {
    let model = load_hello();
    let mut session = InferenceSession::create(&model, 32, 1).unwrap();
    let vocab = model.vocabulary();

    let prompt = vocab.tokenize("Hello", true).unwrap();
    assert_eq!(prompt, vec![BOS, HE, LLO]);
    session.submit(&prompt).unwrap();
    assert_eq!(session.n_past(), prompt.len() as u32);

    let eos = vocab.eos_token();
    let mut reply = Vec::new();
    let mut reached_eos = false;
    for _ in 0..16 {
        let token = session.sample().unwrap();
        if token == eos {
            reached_eos = true;
            break;
        }
        reply.extend(vocab.detokenize(token));
        let before = session.n_past();
        session.submit(&[token]).unwrap();
        assert_eq!(session.n_past(), before + 1);
    }

    assert!(reached_eos);
    assert_eq!(String::from_utf8(reply).unwrap(), " world!");
    assert_eq!(session.n_past(), 5);
}

#[test]
fn test_tokenize_detokenize_round_trip() {
    let model = load_hello();
    let vocab = model.vocabulary();
    for text in ["Hello", "Hello world!", "He llo", "é", "Hello é!", "world"] {
        let tokens = vocab.tokenize(text, false).unwrap();
        assert!(!tokens.is_empty());
        assert_eq!(vocab.detokenize_all(&tokens), text.as_bytes(), "round trip of {:?}", text);
    }
}

#[test]
fn test_tokenize_empty_text() {
    let model = load_hello();
    let vocab = model.vocabulary();
    assert!(vocab.tokenize("", false).unwrap().is_empty());
    assert_eq!(vocab.tokenize("", true).unwrap(), vec![BOS]);
}

#[test]
fn test_detokenize_special_and_invalid_tokens() {
    let model = load_hello();
    let vocab = model.vocabulary();
    assert!(vocab.detokenize(BOS).is_empty());
    assert!(vocab.detokenize(EOS).is_empty());
    assert!(vocab.detokenize(-1).is_empty());
    assert!(vocab.detokenize(n_vocab() as i32).is_empty());
    assert_eq!(vocab.detokenize(WORLD), b" world".to_vec());
}
