use std::time::Duration;

use local_llm::{
    Attachment, CancelHandle, Client, ClientParams, Conversation, LlmError, LoadError, Message,
    Prompt, PromptAttachment,
};

use super::init_tracing;
use crate::stub::{greedy_params, BackendEvent, EventLog, StubBackend};

fn client(backend: StubBackend) -> (Client<StubBackend>, EventLog) {
    let events = backend.events();
    let client = Client::new(backend, greedy_params(512)).unwrap();
    (client, events)
}

/// Splits the event log into one list of decoded texts per generation.
fn generations(events: &EventLog) -> Vec<Vec<(String, usize, usize)>> {
    let mut generations = Vec::new();
    for event in events.snapshot() {
        match event {
            BackendEvent::ClearCache => generations.push(Vec::new()),
            BackendEvent::Decode {
                text,
                first_position,
                tokens,
            } => generations
                .last_mut()
                .expect("decode before the first clear")
                .push((text, first_position, tokens)),
            _ => {}
        }
    }
    generations
}

#[test]
fn generates_a_complete_response() {
    init_tracing();

    let (client, events) = client(StubBackend::new(|prompt| format!("you said {prompt}")));

    assert_eq!(client.generate("ping").unwrap(), "you said ping");
    assert_eq!(client.generate("pong").unwrap(), "you said pong");

    // the cache is cleared before every generation
    assert_eq!(generations(&events).len(), 2);
}

#[tokio::test]
async fn streams_chunks_in_order() {
    let (client, _) = client(StubBackend::replying("abc"));
    let mut stream = client.generate_stream("go");

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next_chunk_async().await {
        chunks.push(chunk.unwrap());
    }

    assert_eq!(chunks, ["a", "b", "c"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_generations_never_interleave() {
    init_tracing();

    let backend = StubBackend::new(|prompt| prompt.to_uppercase())
        .with_decode_delay(Duration::from_millis(1));
    let (client, events) = client(backend);

    let prompts = ["alpha", "beta", "gamma", "delta"];
    let tasks: Vec<_> = prompts
        .iter()
        .map(|&prompt| {
            let client = client.clone();
            tokio::spawn(async move { client.generate_async(prompt).await })
        })
        .collect();

    for (task, prompt) in tasks.into_iter().zip(prompts) {
        assert_eq!(task.await.unwrap().unwrap(), prompt.to_uppercase());
    }

    let generations = generations(&events);
    assert_eq!(generations.len(), prompts.len());

    for generation in generations {
        let text: String = generation.iter().map(|(text, _, _)| text.as_str()).collect();
        assert!(
            prompts
                .iter()
                .any(|prompt| text == format!("{prompt}{}", prompt.to_uppercase())),
            "interleaved generation: {text:?}"
        );

        let mut position = 0;
        for (_, first_position, tokens) in generation {
            assert_eq!(first_position, position);
            position += tokens;
        }
    }
}

#[test]
fn chat_messages_are_rendered() {
    let (client, _) = client(StubBackend::new(|prompt| {
        let expected = "<|im_start|>system\nBe brief.<|im_end|>\n\
                        <|im_start|>user\nHi<|im_end|>\n\
                        <|im_start|>assistant\n";
        if prompt == expected { "ok" } else { "unexpected prompt" }.to_string()
    }));

    let messages = vec![Message::system("Be brief."), Message::user("Hi")];
    assert_eq!(client.generate(messages).unwrap(), "ok");
}

#[test]
fn images_need_a_vision_backend() {
    let (client, _) = client(StubBackend::replying("a cat"));

    let messages =
        vec![Message::user("What is this?").with_attachments(vec![Attachment::Image(vec![1, 2])])];
    assert!(matches!(
        client.generate(messages),
        Err(LlmError::VisionUnsupported)
    ));
}

#[test]
fn chat_images_are_decoded_between_the_image_tags() {
    let (client, events) = client(StubBackend::replying("a cat").with_vision(4));

    let messages =
        vec![Message::user("What is this?").with_attachments(vec![Attachment::Image(vec![1, 2])])];
    assert_eq!(client.generate(messages).unwrap(), "a cat");

    let events = events.snapshot();
    let image = events
        .iter()
        .position(|e| matches!(e, BackendEvent::Image { slots: 4, .. }))
        .expect("no image was decoded");

    let BackendEvent::Decode { text, .. } = &events[image - 1] else {
        panic!("the image was not preceded by text");
    };
    assert!(text.ends_with("What is this?<|vision_start|>"));

    let BackendEvent::Decode { text, .. } = &events[image + 1] else {
        panic!("the image was not followed by text");
    };
    assert!(text.starts_with("<|vision_end|>"));
}

#[test]
fn prompt_attachments_must_occur_in_the_prompt() {
    let (client, _) = client(StubBackend::replying("unused"));
    let prompt = Prompt::new("Summarize this.")
        .with_attachment("<doc>", PromptAttachment::Text("text".to_string()));

    assert!(matches!(
        client.generate(prompt),
        Err(LlmError::InvalidParameter(_))
    ));
}

#[tokio::test]
async fn decode_failure_is_the_last_item() {
    let (client, _) = client(StubBackend::replying("abcdef").failing_on_decode(2));
    let mut stream = client.generate_stream("go");

    assert_eq!(stream.next_chunk_async().await.unwrap().unwrap(), "a");
    assert_eq!(stream.next_chunk_async().await.unwrap().unwrap(), "b");
    assert!(matches!(
        stream.next_chunk_async().await,
        Some(Err(LlmError::DecodingFailed(_)))
    ));
    assert!(stream.next_chunk_async().await.is_none());
}

#[tokio::test]
async fn cancelled_stream_ends() {
    let (client, _) = client(StubBackend::endless(b'x'));
    let mut stream = client.generate_stream("go");

    assert_eq!(stream.next_chunk_async().await.unwrap().unwrap(), "x");
    stream.cancel();

    let mut rest = 0;
    while let Some(chunk) = stream.next_chunk_async().await {
        chunk.unwrap();
        rest += 1;
    }
    assert!(rest < 500, "generation ran to the context budget");
}

#[tokio::test]
async fn shared_cancel_handle_outlives_finished_streams() {
    let (client, _) = client(StubBackend::replying("ab"));
    let cancel = CancelHandle::new();

    for prompt in ["one", "two"] {
        let text = client
            .generate_stream_with(prompt, cancel.clone())
            .into_text_async()
            .await
            .unwrap();
        assert_eq!(text, "ab");
        assert!(!cancel.is_cancelled());
    }

    drop(client.generate_stream_with("three", cancel.clone()));
    assert!(cancel.is_cancelled());
}

#[test]
fn resuming_requires_a_chat() {
    let (client, _) = client(StubBackend::replying("unused"));

    assert!(matches!(
        client.resume(&[], &[], Conversation::Plain("hi".to_string())),
        Err(LlmError::InvalidParameter(_))
    ));
}

#[test]
fn invalid_params_are_rejected() {
    let params = ClientParams {
        context_length: 0,
        ..greedy_params(512)
    };

    assert!(matches!(
        Client::new(StubBackend::replying(""), params),
        Err(LlmError::InvalidParameter(_))
    ));
}

#[test]
fn loading_a_missing_model_fails() {
    let result = Client::load_from_file(
        "/definitely/not/a/model.gguf",
        greedy_params(512),
        |_, _| -> Result<StubBackend, LoadError> { panic!("the loader should not run") },
    );

    assert!(matches!(
        result,
        Err(LlmError::FailedToLoad(LoadError::DoesNotExist(_)))
    ));
}

#[tokio::test]
async fn loading_checks_the_vision_projector() {
    let model = std::env::temp_dir().join("local_llm_tests_projector_check.gguf");
    tokio::fs::write(&model, b"GGUF").await.unwrap();

    let params = ClientParams {
        vision_projector: Some("/definitely/not/a/projector.gguf".into()),
        ..greedy_params(512)
    };
    let result = Client::load_from_file_async(&model, params, |_, _| {
        Ok(StubBackend::replying(""))
    })
    .await;
    assert!(matches!(
        result,
        Err(LlmError::FailedToLoad(LoadError::MissingProjector(_)))
    ));

    let loaded = Client::load_from_file_async(&model, greedy_params(512), |path, _| {
        assert!(path.ends_with("local_llm_tests_projector_check.gguf"));
        Ok(StubBackend::replying("loaded"))
    })
    .await
    .unwrap();
    assert_eq!(loaded.generate_async("hi").await.unwrap(), "loaded");

    tokio::fs::remove_file(&model).await.unwrap();
}
