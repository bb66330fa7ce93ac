mod common;

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use llamabridge::session::stream::{generate_stream, StreamEvent};
use llamabridge::session::SamplingStrategy;
use llamabridge::{
    ChatMessage, ChatTemplate, GenerationParams, InferenceSession, ModelHandle, SamplerConfig, SessionConfig,
    StopReason,
};

use common::*;

fn session(capacity: u32) -> InferenceSession {
    let model = ModelHandle::load(hello_model()).unwrap();
    InferenceSession::create(&model, capacity, 1).unwrap()
}

fn run(session: &mut InferenceSession, prompt: &str, params: &GenerationParams) -> (llamabridge::Generation, Vec<String>) {
    let mut pieces = Vec::new();
    let generation = session
        .generate(prompt, params, |piece| {
            pieces.push(piece.to_string());
            ControlFlow::Continue(())
        })
        .unwrap();
    (generation, pieces)
}

#[test]
fn test_generate_stops_at_end_of_sequence() {
    let mut session = session(32);
    let (generation, pieces) = run(&mut session, "Hello", &GenerationParams::default());

    assert_eq!(generation.stop_reason, StopReason::EndOfSequence);
    assert_eq!(generation.text, " world!");
    assert_eq!(generation.tokens, vec![WORLD, BANG]);
    assert_eq!(generation.prompt_tokens, 3);
    assert_eq!(pieces, vec![" world", "!"]);
    // The end-of-sequence token is never folded into the cache
    assert_eq!(session.n_past(), 5);
}

#[test]
fn test_generate_respects_max_tokens() {
    let mut session = session(32);
    let params = GenerationParams {
        max_tokens: 1,
        ..Default::default()
    };
    let (generation, _) = run(&mut session, "Hello", &params);
    assert_eq!(generation.stop_reason, StopReason::MaxTokens);
    assert_eq!(generation.text, " world");
    assert_eq!(session.n_past(), 4);
}

#[test]
fn test_generate_stops_when_context_is_full() {
    let mut session = session(4);
    let (generation, _) = run(&mut session, "Hello", &GenerationParams::default());
    assert_eq!(generation.stop_reason, StopReason::ContextFull);
    assert_eq!(generation.text, " world!");
    assert_eq!(session.n_past(), 4);
    assert_eq!(session.remaining(), 0);
}

#[test]
fn test_generate_prompt_larger_than_context_fails() {
    let mut session = session(2);
    let err = session
        .generate("Hello", &GenerationParams::default(), |_| ControlFlow::Continue(()))
        .unwrap_err();
    assert!(matches!(err, llamabridge::Error::Decode(ref e) if e.is_capacity_exceeded()), "got {:?}", err);
    assert_eq!(session.n_past(), 0);
}

#[test]
fn test_generate_cancelled_by_callback() {
    let mut session = session(32);
    let generation = session
        .generate("Hello", &GenerationParams::default(), |_| ControlFlow::Break(()))
        .unwrap();
    assert_eq!(generation.stop_reason, StopReason::Cancelled);
    assert_eq!(generation.text, " world");
    assert_eq!(generation.tokens, vec![WORLD]);
}

#[test]
fn test_generate_continues_from_cache() {
    let mut session = session(32);
    let params = GenerationParams {
        max_tokens: 1,
        ..Default::default()
    };
    run(&mut session, "Hello", &params);
    let (generation, _) = run(&mut session, "", &params);
    assert_eq!(generation.text, "!");
    assert_eq!(generation.prompt_tokens, 0);
    assert_eq!(session.n_past(), 5);
}

#[test]
fn test_continuation_prompt_has_no_bos() {
    let mut session = session(32);
    let params = GenerationParams {
        max_tokens: 1,
        ..Default::default()
    };
    run(&mut session, "Hello", &params);
    assert_eq!(session.n_past(), 4);

    let (generation, _) = run(&mut session, "Hello", &params);
    // "He" "llo" only; a second marker would make it three
    assert_eq!(generation.prompt_tokens, 2);
    assert_eq!(generation.tokens, vec![WORLD]);
    assert_eq!(session.n_past(), 7);

    session.clear();
    let (generation, _) = run(&mut session, "Hello", &params);
    assert_eq!(generation.prompt_tokens, 3);
}

#[test]
fn test_flat_model_picks_lowest_id() {
    let model = ModelHandle::load(flat_model()).unwrap();
    let mut session = InferenceSession::create(&model, 16, 1).unwrap();
    let params = GenerationParams {
        max_tokens: 3,
        ..Default::default()
    };
    let (generation, _) = run(&mut session, "Hello", &params);
    assert_eq!(generation.tokens, vec![UNK, UNK, UNK]);
    assert_eq!(generation.stop_reason, StopReason::MaxTokens);
}

#[test]
fn test_seeded_temperature_sampling_is_reproducible() {
    let model = ModelHandle::load(hello_model()).unwrap();
    let config = SessionConfig::new(32, 1).sampler(SamplerConfig {
        strategy: SamplingStrategy::Temperature,
        seed: Some(7),
        ..SamplerConfig::default()
    });
    let params = GenerationParams {
        max_tokens: 8,
        ..Default::default()
    };

    let mut first = InferenceSession::create_with(&model, &config).unwrap();
    let mut second = InferenceSession::create_with(&model, &config).unwrap();
    let (a, _) = run(&mut first, "Hello", &params);
    let (b, _) = run(&mut second, "Hello", &params);
    assert_eq!(a.tokens, b.tokens);
}

#[test]
fn test_chat_prompt_generates() {
    let template = ChatTemplate::default();
    let prompt = template.format(&[ChatMessage::user("Hello")], "");
    assert!(prompt.ends_with("<|assistant|>"));

    let mut session = session(128);
    let generation = session
        .generate(&prompt, &GenerationParams::default(), |_| ControlFlow::Continue(()))
        .unwrap();
    assert!(!generation.tokens.is_empty() || generation.stop_reason == StopReason::EndOfSequence);
    assert!(session.n_past() as usize >= generation.prompt_tokens);
}

#[tokio::test]
async fn test_stream_yields_pieces_then_done() {
    let shared = Arc::new(Mutex::new(session(32)));
    let events: Vec<_> = generate_stream(shared.clone(), "Hello".to_string(), GenerationParams::default())
        .collect()
        .await;

    let mut pieces = String::new();
    let mut done = None;
    for event in events {
        match event.unwrap() {
            StreamEvent::Piece(piece) => pieces.push_str(&piece),
            StreamEvent::Done(generation) => done = Some(generation),
        }
    }
    assert_eq!(pieces, " world!");
    assert_eq!(done.unwrap().stop_reason, StopReason::EndOfSequence);
    assert_eq!(shared.lock().unwrap().n_past(), 5);
}
