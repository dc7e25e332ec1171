use local_llm::{CancelHandle, Context, ContextError, DecodeContext, TokenGenerator};

use super::init_tracing;
use crate::stub::{greedy_params, StubBackend};

fn prompted(backend: StubBackend, context_length: usize) -> (Context<StubBackend>, DecodeContext) {
    let mut context = Context::new(backend, greedy_params(context_length));
    let decode_context = context
        .decode_text("go", DecodeContext::new(false))
        .unwrap();
    (context, decode_context)
}

#[test]
fn split_characters_are_reassembled() {
    init_tracing();

    let (mut context, decode_context) = prompted(StubBackend::replying("héllo 世界"), 256);
    let chunks: Vec<String> = TokenGenerator::new(&mut context, decode_context, CancelHandle::new())
        .collect::<Result<_, _>>()
        .unwrap();

    // every byte is a token, so continuation bytes yield empty chunks
    assert_eq!(
        chunks,
        ["h", "", "é", "l", "l", "o", " ", "", "", "世", "", "", "界"]
    );
    assert_eq!(chunks.concat(), "héllo 世界");
}

#[test]
fn generation_stops_at_the_context_budget() {
    for budget in [3, 4, 16, 64] {
        let (mut context, decode_context) = prompted(StubBackend::endless(b'a'), budget);
        let mut generator = TokenGenerator::new(&mut context, decode_context, CancelHandle::new());

        let mut chunks = 0;
        for chunk in generator.by_ref() {
            assert_eq!(chunk.unwrap(), "a");
            chunks += 1;
        }

        // "go" plus the beginning-of-sequence token
        assert_eq!(chunks, budget - 3, "budget {budget}");
        assert_eq!(generator.cursor(), budget);
        assert_eq!(generator.iteration(), budget - 3);
    }
}

#[test]
fn cancellation_is_observed_on_the_next_step() {
    let (mut context, decode_context) = prompted(StubBackend::endless(b'z'), 4096);
    let cancel = CancelHandle::new();
    let mut generator = TokenGenerator::new(&mut context, decode_context, cancel.clone());

    for _ in 0..3 {
        assert_eq!(generator.next().unwrap().unwrap(), "z");
    }

    cancel.cancel();
    assert!(generator.next().is_none());
    assert!(generator.next().is_none());
    assert_eq!(generator.iteration(), 3);
}

#[test]
fn decode_failure_ends_the_stream() {
    // call 0 decodes the prompt, call 1 the first generated token
    let backend = StubBackend::replying("abcdef").failing_on_decode(2);
    let (mut context, decode_context) = prompted(backend, 256);
    let mut generator = TokenGenerator::new(&mut context, decode_context, CancelHandle::new());

    assert_eq!(generator.next().unwrap().unwrap(), "a");
    assert_eq!(generator.next().unwrap().unwrap(), "b");
    assert!(matches!(
        generator.next(),
        Some(Err(ContextError::DecodeFailed(-1)))
    ));
    assert!(generator.next().is_none());
}

#[test]
fn extra_end_of_sequence_strings_stop_generation() {
    let mut params = greedy_params(256);
    params.extra_eos_tokens = vec!["!".to_string()];
    let mut context = Context::new(StubBackend::replying("!hi!there"), params);
    let decode_context = context
        .decode_text("go", DecodeContext::new(false))
        .unwrap();

    let text: String = TokenGenerator::new(&mut context, decode_context, CancelHandle::new())
        .collect::<Result<_, _>>()
        .unwrap();

    // only checked after the first token
    assert_eq!(text, "!hi");
}

#[test]
fn empty_response_yields_nothing() {
    let (mut context, decode_context) = prompted(StubBackend::replying(""), 256);
    let mut generator = TokenGenerator::new(&mut context, decode_context, CancelHandle::new());

    assert!(generator.next().is_none());
    assert_eq!(generator.cursor(), decode_context.cursor);
}
