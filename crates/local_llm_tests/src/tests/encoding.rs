use std::collections::HashMap;

use local_llm::{
    encode_prompt, Backend, Context, ContextError, DecodeContext, PromptAttachment,
};

use super::init_tracing;
use crate::stub::{greedy_params, BackendEvent, StubBackend};

fn decode(text: &str, first_position: usize, tokens: usize) -> BackendEvent {
    BackendEvent::Decode {
        text: text.to_string(),
        first_position,
        tokens,
    }
}

#[test]
fn cursor_equals_token_count() {
    init_tracing();

    let mut context = Context::new(StubBackend::replying(""), greedy_params(256));
    let prompts = ["", "Hello, world", "héllo wörld, 世界"];

    for prompt in prompts {
        context.clear();

        let expected = context.backend().tokenize(prompt, true, false).unwrap().len();
        let decode_context = context
            .decode_text(prompt, DecodeContext::new(false))
            .unwrap();

        assert_eq!(decode_context.cursor, expected, "prompt {prompt:?}");
        assert_eq!(context.history().len(), expected);
    }
}

#[test]
fn bos_is_only_added_at_the_start() {
    let backend = StubBackend::replying("");
    let events = backend.events();
    let mut context = Context::new(backend, greedy_params(256));

    let first = context
        .decode_text("abc", DecodeContext::new(false))
        .unwrap();
    let second = context.decode_text("de", first).unwrap();

    assert_eq!(first.cursor, 4);
    assert_eq!(second.cursor, 6);
    assert_eq!(
        events.snapshot(),
        vec![decode("abc", 0, 4), decode("de", 4, 2)]
    );
}

#[test]
fn long_text_is_split_into_full_batches() {
    let backend = StubBackend::replying("");
    let events = backend.events();
    let mut params = greedy_params(256);
    params.batch_size = 16;
    let mut context = Context::new(backend, params);

    let text = "x".repeat(40);
    let decode_context = context
        .decode_text(&text, DecodeContext::new(false))
        .unwrap();

    assert_eq!(decode_context.cursor, 41);
    assert_eq!(
        events.snapshot(),
        vec![
            decode(&"x".repeat(15), 0, 16),
            decode(&"x".repeat(16), 16, 16),
            decode(&"x".repeat(9), 32, 9),
        ]
    );
}

#[test]
fn text_longer_than_the_context_is_rejected() {
    let backend = StubBackend::replying("");
    let events = backend.events();
    let mut context = Context::new(backend, greedy_params(8));

    let result = context.decode_text("far too long for this", DecodeContext::new(false));

    assert!(matches!(
        result,
        Err(ContextError::ContextFull {
            needed: 22,
            available: 8
        })
    ));
    assert!(events.snapshot().is_empty());
}

fn interleaved(prompt: &str) -> (DecodeContext, Vec<BackendEvent>) {
    let backend = StubBackend::replying("").with_vision(5);
    let events = backend.events();
    let mut context = Context::new(backend, greedy_params(256));

    let image = context.embed_image(b"\x89PNG").unwrap();
    events.clear();

    let attachments = HashMap::from([
        ("{x}".to_string(), PromptAttachment::Text("xx".to_string())),
        ("{y}".to_string(), PromptAttachment::Image(image)),
    ]);
    let decode_context =
        encode_prompt(&mut context, DecodeContext::new(false), prompt, attachments).unwrap();

    (decode_context, events.snapshot())
}

#[test]
fn attachments_are_decoded_in_prompt_order() {
    init_tracing();

    let (decode_context, events) = interleaved("A{x}B{y}C");
    assert_eq!(
        events,
        vec![
            decode("A", 0, 2),
            decode("xx", 2, 2),
            decode("B", 4, 1),
            BackendEvent::Image {
                cursor: 5,
                slots: 5
            },
            decode("C", 10, 1),
        ]
    );
    assert_eq!(decode_context.cursor, 11);

    let (decode_context, events) = interleaved("A{y}B{x}C");
    assert_eq!(
        events,
        vec![
            decode("A", 0, 2),
            BackendEvent::Image {
                cursor: 2,
                slots: 5
            },
            decode("B", 7, 1),
            decode("xx", 8, 2),
            decode("C", 10, 1),
        ]
    );
    assert_eq!(decode_context.cursor, 11);
}

#[test]
fn adjacent_markers_decode_no_empty_text() {
    let (decode_context, events) = interleaved("{y}{x}");

    assert_eq!(
        events,
        vec![
            BackendEvent::Image {
                cursor: 0,
                slots: 5
            },
            decode("xx", 5, 2),
        ]
    );
    assert_eq!(decode_context.cursor, 7);
}

#[test]
fn missing_marker_is_reported() {
    let mut context = Context::new(StubBackend::replying(""), greedy_params(256));
    let attachments = HashMap::from([(
        "<file>".to_string(),
        PromptAttachment::Text("contents".to_string()),
    )]);

    let result = encode_prompt(
        &mut context,
        DecodeContext::new(false),
        "a prompt without markers",
        attachments,
    );

    assert!(matches!(result, Err(ContextError::MissingMarker(marker)) if marker == "<file>"));
}

#[test]
fn markers_at_the_same_offset_are_reported() {
    let mut context = Context::new(StubBackend::replying(""), greedy_params(256));
    let attachments = HashMap::from([
        ("<a>".to_string(), PromptAttachment::Text("1".to_string())),
        ("<a>b".to_string(), PromptAttachment::Text("2".to_string())),
    ]);

    let result = encode_prompt(&mut context, DecodeContext::new(false), "x<a>b", attachments);

    assert!(matches!(
        result,
        Err(ContextError::OverlappingMarkers(a, b)) if a == "<a>" && b == "<a>b"
    ));
}

#[test]
fn images_need_a_vision_backend() {
    let mut context = Context::new(StubBackend::replying(""), greedy_params(256));

    assert!(matches!(
        context.embed_image(b"\x89PNG"),
        Err(ContextError::VisionUnsupported)
    ));
}
