use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use local_llm::tool::ToolError;
use local_llm::{
    ArgumentType, Client, Conversation, FactoryModel, LlmError, Message, Role, Session, Tool,
    ToolOutput, ToolSchema, ToolSet,
};

use super::init_tracing;
use crate::stub::{greedy_params, StubBackend};

#[derive(Deserialize)]
struct AddArguments {
    a: i64,
    b: i64,
}

struct Add;

#[async_trait]
impl Tool for Add {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "Adds two integers"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new()
            .property("a", ArgumentType::integer("The first operand"))
            .property("b", ArgumentType::integer("The second operand"))
    }

    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let arguments: AddArguments = serde_json::from_value(arguments)?;
        Ok(json!(arguments.a + arguments.b))
    }
}

struct Unreachable;

#[async_trait]
impl Tool for Unreachable {
    fn name(&self) -> &str {
        "lookup"
    }

    fn description(&self) -> &str {
        "Looks something up on a server that is down"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new().property("query", ArgumentType::string("What to look up"))
    }

    async fn call(&self, _arguments: Value) -> Result<Value, ToolError> {
        Err("connection refused".into())
    }
}

/// Calls `call` until the prompt contains a tool response, then answers with that response.
fn tool_backend(call: Value) -> StubBackend {
    StubBackend::new(move |prompt| {
        let response = prompt
            .rsplit_once("<tool_response>\n")
            .and_then(|(_, rest)| rest.split_once("\n</tool_response>"));

        match response {
            Some((output, _)) => format!("The answer is {output}."),
            None => format!("<tool_call>\n{call}\n</tool_call>"),
        }
    })
}

fn add_call() -> Value {
    json!({ "name": "add", "arguments": { "a": 2, "b": 3 } })
}

fn tool_session(backend: StubBackend, tools: ToolSet) -> Session<FactoryModel<StubBackend>> {
    let client = Client::new(backend, greedy_params(4096)).unwrap();
    Session::with_tools(FactoryModel::new(move || Ok(client.clone())), tools)
}

#[tokio::test(flavor = "multi_thread")]
async fn session_runs_the_tool_round_trip() {
    init_tracing();

    let session = tool_session(tool_backend(add_call()), ToolSet::new().with(Add));

    let mut stream = session.stream_response("What is 2 + 3?", vec![]);
    let mut visible = String::new();
    while let Some(chunk) = stream.next().await {
        visible.push_str(&chunk.unwrap());
    }

    // the call itself is not shown
    assert_eq!(visible, "The answer is 5.");

    let messages = session.messages();
    assert_eq!(
        messages.iter().map(|m| m.role.clone()).collect::<Vec<_>>(),
        [Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert!(messages[1].content.contains("<tool_call>"));
    assert_eq!(messages[2].content, "5");
    assert!(messages[2].tool_call_id.is_some());
    assert_eq!(messages[3].content, "The answer is 5.");
}

#[tokio::test(flavor = "multi_thread")]
async fn tools_are_declared_in_the_system_prompt() {
    let prompts = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = prompts.clone();
    let backend = StubBackend::new(move |prompt| {
        seen.lock().unwrap().push(prompt.to_string());
        "No tools needed.".to_string()
    });
    let session = tool_session(backend, ToolSet::new().with(Add));

    assert_eq!(session.respond("Hi").await.unwrap(), "No tools needed.");

    let prompts = prompts.lock().unwrap();
    assert!(prompts[0].starts_with("<|im_start|>system\n"));
    assert!(prompts[0].contains(r#""name":"add""#));
    assert!(prompts[0].contains(r#""required":["a","b"]"#));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_tools_are_invalid() {
    let call = json!({ "name": "multiply", "arguments": { "a": 2, "b": 3 } });
    let session = tool_session(tool_backend(call), ToolSet::new().with(Add));

    let result = session.respond("What is 2 * 3?").await;
    assert!(
        matches!(&result, Err(LlmError::InvalidParameter(reason)) if reason.contains("multiply")),
        "{result:?}"
    );
    assert_eq!(session.messages(), vec![Message::user("What is 2 * 3?")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn mistyped_arguments_are_invalid() {
    let call = json!({ "name": "add", "arguments": { "a": "two", "b": 3 } });
    let session = tool_session(tool_backend(call), ToolSet::new().with(Add));

    assert!(matches!(
        session.respond("What is two + 3?").await,
        Err(LlmError::InvalidParameter(_))
    ));
    assert_eq!(session.messages(), vec![Message::user("What is two + 3?")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_calls_are_invalid() {
    let backend =
        StubBackend::replying("<tool_call>\n{\"name\": add, \"arguments\": {}}\n</tool_call>");
    let session = tool_session(backend, ToolSet::new().with(Add));

    let result = session.respond("What is 2 + 3?").await;
    assert!(
        matches!(&result, Err(LlmError::InvalidParameter(reason)) if reason.contains("malformed")),
        "{result:?}"
    );
    assert_eq!(session.messages(), vec![Message::user("What is 2 + 3?")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_tools_are_reported() {
    let call = json!({ "name": "lookup", "arguments": { "query": "weather" } });
    let session = tool_session(tool_backend(call), ToolSet::new().with(Unreachable));

    let result = session.respond("What's the weather?").await;
    assert!(
        matches!(&result, Err(LlmError::ToolExecutionFailed { tool, .. }) if tool == "lookup"),
        "{result:?}"
    );

    // neither the call nor anything after it is kept
    assert_eq!(session.messages(), vec![Message::user("What's the weather?")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_in_a_later_round_keeps_only_the_user_message() {
    let backend = StubBackend::new(|prompt| {
        if prompt.contains("<tool_response>") {
            "<tool_call>\nnot json\n</tool_call>".to_string()
        } else {
            format!("<tool_call>\n{}\n</tool_call>", add_call())
        }
    });
    let session = tool_session(backend, ToolSet::new().with(Add));

    assert!(matches!(
        session.respond("What is 2 + 3?").await,
        Err(LlmError::InvalidParameter(_))
    ));
    assert_eq!(session.messages(), vec![Message::user("What is 2 + 3?")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_consumer_during_a_tool_turn_records_nothing() {
    let session = tool_session(
        StubBackend::replying("Let me think <tool"),
        ToolSet::new().with(Add),
    );

    drop(session.stream_response("first", vec![]));

    let mut attempts = 0;
    let (mut stream, mut text) = loop {
        let mut stream = session.stream_response("second", vec![]);
        match stream.next().await {
            Some(Err(LlmError::SessionBusy)) if attempts < 200 => {
                attempts += 1;
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            Some(Ok(chunk)) => break (stream, chunk),
            other => panic!("unexpected item: {other:?}"),
        }
    };

    while let Some(chunk) = stream.next().await {
        text.push_str(&chunk.unwrap());
    }
    // a possible tag start is held back until the end
    assert_eq!(text, "Let me think <tool");
    assert_eq!(
        session.messages(),
        vec![
            Message::user("first"),
            Message::user("second"),
            Message::assistant("Let me think <tool"),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn caller_can_execute_tools_itself() {
    let session = tool_session(tool_backend(add_call()), ToolSet::new());

    let content = session.respond_with_tool_calls("What is 2 + 3?").await.unwrap();
    assert_eq!(content.tool_calls.len(), 1);
    assert_eq!(content.visible_text(), "");

    let call = &content.tool_calls[0];
    assert_eq!(call.name, "add");
    assert_eq!(call.arguments, json!({ "a": 2, "b": 3 }));

    let output = ToolSet::new().with(Add).dispatch(call).await.unwrap();
    assert_eq!(output.tool_call_id, call.id);

    let answer = session.resume_with_tool_outputs(vec![output]).await.unwrap();
    assert_eq!(answer, "The answer is 5.");
    assert_eq!(session.messages().len(), 4);
}

#[tokio::test]
async fn client_resumes_after_tool_outputs() {
    let client = Client::new(tool_backend(add_call()), greedy_params(4096)).unwrap();
    client.set_tools(ToolSet::new().with(Add).declarations());

    let conversation = vec![Message::user("What is 2 + 3?")];
    let content = client
        .generate_tool_calls_async(conversation.clone())
        .await
        .unwrap();

    let [call] = content.tool_calls.as_slice() else {
        panic!("expected one tool call, got {:?}", content.tool_calls);
    };
    let arguments: AddArguments = call.decode().unwrap();
    let output = ToolOutput::new(call.id.clone(), (arguments.a + arguments.b).to_string());

    let answer = client
        .resume_async(
            &content.tool_calls,
            &[output],
            Conversation::Chat(conversation),
        )
        .await
        .unwrap();
    assert_eq!(answer, "The answer is 5.");
}
