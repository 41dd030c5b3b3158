//! The bounded tool-iteration loop shared by every provider adapter.
//!
//! Adapters implement [`TurnExecutor`] for their own wire message type; the
//! loop owns iteration bounds, handler dispatch, and the conversation
//! bookkeeping between turns. Tool calls within a turn run sequentially in
//! model order so the conversation trace stays deterministic.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{GenieError, Result};
use crate::events::{Event, EventBus, NotificationEvent, TOPIC_NOTIFICATION};
use crate::prompt::{Handler, HandlerArgs};

/// Hard ceiling on model-initiated tool recursion.
pub const MAX_TOOL_ITERATIONS: usize = 8;

/// One function-call request emitted by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON text of the call arguments, exactly as the model emitted it.
    pub arguments: String,
}

/// The result block fed back for one tool call in the next user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    /// JSON-encoded handler result.
    pub content: String,
}

/// One completed provider round trip.
pub struct Turn<M> {
    /// The response replayed as an assistant message on the next turn.
    pub message: M,
    /// Non-empty text blocks joined with `\n`.
    pub text: String,
    /// Tool calls in the order the model emitted them.
    pub tool_calls: Vec<ToolCall>,
}

/// Executes one provider turn. Implementations publish their own usage and
/// thinking events while parsing the response; the loop publishes produced
/// text.
#[async_trait]
pub trait TurnExecutor: Send + Sync {
    type Message: Send + Sync;

    /// Provider name used in error messages ("anthropic", "openai", …).
    fn backend(&self) -> &str;

    async fn execute(&self, messages: &[Self::Message]) -> Result<Turn<Self::Message>>;

    /// Package a batch of tool results as the next user message.
    fn tool_results_message(&self, results: Vec<ToolResultBlock>) -> Self::Message;
}

/// Parse a tool call's raw argument JSON into a handler argument map.
/// Empty and `null` inputs become an empty map; anything else must be a
/// JSON object.
pub fn parse_tool_args(raw: &str) -> Result<HandlerArgs> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(HandlerArgs::new());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(HandlerArgs::new()),
        Ok(other) => Err(GenieError::ToolArgsInvalid(format!(
            "tool arguments must be a JSON object, got: {other}"
        ))),
        Err(e) => Err(GenieError::ToolArgsInvalid(format!(
            "malformed tool arguments: {e}"
        ))),
    }
}

/// Drive the request/response/dispatch cycle until the model stops calling
/// tools, a handler fails, or the iteration ceiling is hit.
pub async fn run<E: TurnExecutor>(
    executor: &E,
    first_message: E::Message,
    handlers: &HashMap<String, Handler>,
    bus: &dyn EventBus,
) -> Result<String> {
    let mut messages = vec![first_message];
    let mut any_handler_ran = false;

    for _ in 0..MAX_TOOL_ITERATIONS {
        let turn = executor.execute(&messages).await?;

        if !turn.text.trim().is_empty() {
            bus.publish(
                TOPIC_NOTIFICATION,
                Event::Notification(NotificationEvent::text(turn.text.clone())),
            );
        }

        let tool_calls = turn.tool_calls;
        messages.push(turn.message);

        if tool_calls.is_empty() {
            let text = turn.text.trim();
            if text.is_empty() && !any_handler_ran {
                return Err(GenieError::Protocol(format!(
                    "{} returned an empty response",
                    executor.backend()
                )));
            }
            return Ok(text.to_string());
        }

        if handlers.is_empty() {
            return Err(GenieError::HandlerMissing(format!(
                "model requested {} tool calls but no handlers are registered",
                tool_calls.len()
            )));
        }

        let mut results = Vec::with_capacity(tool_calls.len());
        for call in &tool_calls {
            let handler = handlers.get(&call.name).ok_or_else(|| {
                GenieError::HandlerMissing(format!(
                    "no handler registered for tool '{}'",
                    call.name
                ))
            })?;
            let args = parse_tool_args(&call.arguments)?;
            tracing::debug!(tool = %call.name, id = %call.id, "dispatching tool call");
            let result = handler(args)
                .await
                .map_err(|source| GenieError::HandlerFailure {
                    name: call.name.clone(),
                    source,
                })?;
            any_handler_ran = true;
            let content = serde_json::to_string(&Value::Object(result))
                .map_err(|e| GenieError::Protocol(format!("unencodable handler result: {e}")))?;
            results.push(ToolResultBlock {
                tool_use_id: call.id.clone(),
                content,
            });
        }
        messages.push(executor.tool_results_message(results));
    }

    Err(GenieError::IterationExhausted(MAX_TOOL_ITERATIONS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelEventBus, NullEventBus};
    use crate::prompt::handler;
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted executor: pops one canned turn per call and records the
    /// message list it was shown.
    struct ScriptedExecutor {
        turns: Mutex<Vec<Turn<FakeMessage>>>,
        observed: Mutex<Vec<Vec<FakeMessage>>>,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum FakeMessage {
        User(String),
        Assistant(String),
        ToolResults(Vec<ToolResultBlock>),
    }

    impl ScriptedExecutor {
        fn new(turns: Vec<Turn<FakeMessage>>) -> Self {
            let mut turns = turns;
            turns.reverse();
            Self {
                turns: Mutex::new(turns),
                observed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TurnExecutor for ScriptedExecutor {
        type Message = FakeMessage;

        fn backend(&self) -> &str {
            "anthropic"
        }

        async fn execute(&self, messages: &[FakeMessage]) -> Result<Turn<FakeMessage>> {
            self.observed.lock().unwrap().push(messages.to_vec());
            self.turns
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| GenieError::Protocol("script exhausted".to_string()))
        }

        fn tool_results_message(&self, results: Vec<ToolResultBlock>) -> FakeMessage {
            FakeMessage::ToolResults(results)
        }
    }

    fn text_turn(text: &str) -> Turn<FakeMessage> {
        Turn {
            message: FakeMessage::Assistant(text.to_string()),
            text: text.to_string(),
            tool_calls: vec![],
        }
    }

    fn tool_turn(name: &str, id: &str, args: &str) -> Turn<FakeMessage> {
        Turn {
            message: FakeMessage::Assistant(String::new()),
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: args.to_string(),
            }],
        }
    }

    fn weather_handlers() -> (HashMap<String, Handler>, std::sync::Arc<Mutex<Vec<HandlerArgs>>>) {
        let calls = std::sync::Arc::new(Mutex::new(Vec::new()));
        let calls_rec = calls.clone();
        let mut handlers = HashMap::new();
        handlers.insert(
            "get_weather".to_string(),
            handler(move |args: HandlerArgs| {
                let calls_rec = calls_rec.clone();
                async move {
                    calls_rec.lock().unwrap().push(args);
                    let mut out = HandlerArgs::new();
                    out.insert("summary".to_string(), json!("Sunny"));
                    out.insert("temp".to_string(), json!(22));
                    Ok(out)
                }
            }),
        );
        (handlers, calls)
    }

    #[tokio::test]
    async fn test_plain_text_turn() {
        let executor = ScriptedExecutor::new(vec![text_turn("Hello there!")]);
        let result = run(
            &executor,
            FakeMessage::User("Say hello.".to_string()),
            &HashMap::new(),
            &NullEventBus,
        )
        .await
        .unwrap();
        assert_eq!(result, "Hello there!");
    }

    #[tokio::test]
    async fn test_tool_loop_dispatches_then_returns_final_text() {
        let executor = ScriptedExecutor::new(vec![
            tool_turn("get_weather", "call_1", r#"{"location":"Lisbon"}"#),
            text_turn("It is sunny and 22°C."),
        ]);
        let (handlers, calls) = weather_handlers();
        let result = run(
            &executor,
            FakeMessage::User("weather?".to_string()),
            &handlers,
            &NullEventBus,
        )
        .await
        .unwrap();
        assert_eq!(result, "It is sunny and 22°C.");

        // Handler invoked exactly once, with the model's arguments.
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["location"], json!("Lisbon"));

        // The second request's last message carries exactly one tool_result
        // block correlated to the call id.
        let observed = executor.observed.lock().unwrap();
        assert_eq!(observed.len(), 2);
        match observed[1].last().unwrap() {
            FakeMessage::ToolResults(blocks) => {
                assert_eq!(blocks.len(), 1);
                assert_eq!(blocks[0].tool_use_id, "call_1");
                let content: Value = serde_json::from_str(&blocks[0].content).unwrap();
                assert_eq!(content["summary"], json!("Sunny"));
                assert_eq!(content["temp"], json!(22));
            }
            other => panic!("expected tool results, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_response_without_tools_is_an_error() {
        let executor = ScriptedExecutor::new(vec![text_turn("   ")]);
        let err = run(
            &executor,
            FakeMessage::User("hi".to_string()),
            &HashMap::new(),
            &NullEventBus,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("empty response"), "{err}");
    }

    #[tokio::test]
    async fn test_empty_response_after_tool_call_is_ok() {
        let executor = ScriptedExecutor::new(vec![
            tool_turn("get_weather", "call_1", r#"{"location":"Lisbon"}"#),
            text_turn(""),
        ]);
        let (handlers, _) = weather_handlers();
        let result = run(
            &executor,
            FakeMessage::User("weather?".to_string()),
            &handlers,
            &NullEventBus,
        )
        .await
        .unwrap();
        assert_eq!(result, "");
    }

    #[tokio::test]
    async fn test_tool_call_without_any_handlers() {
        let executor =
            ScriptedExecutor::new(vec![tool_turn("get_weather", "call_1", "{}")]);
        let err = run(
            &executor,
            FakeMessage::User("weather?".to_string()),
            &HashMap::new(),
            &NullEventBus,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GenieError::HandlerMissing(_)));
        assert!(err.to_string().contains("1 tool calls"));
    }

    #[tokio::test]
    async fn test_tool_call_with_unregistered_name() {
        let executor = ScriptedExecutor::new(vec![tool_turn("launch_rocket", "call_1", "{}")]);
        let (handlers, _) = weather_handlers();
        let err = run(
            &executor,
            FakeMessage::User("go".to_string()),
            &handlers,
            &NullEventBus,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GenieError::HandlerMissing(_)));
        assert!(err.to_string().contains("launch_rocket"));
    }

    #[tokio::test]
    async fn test_malformed_tool_args() {
        let executor =
            ScriptedExecutor::new(vec![tool_turn("get_weather", "call_1", "{not json")]);
        let (handlers, calls) = weather_handlers();
        let err = run(
            &executor,
            FakeMessage::User("weather?".to_string()),
            &handlers,
            &NullEventBus,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GenieError::ToolArgsInvalid(_)));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let executor = ScriptedExecutor::new(vec![tool_turn("flaky", "call_1", "{}")]);
        let mut handlers = HashMap::new();
        handlers.insert(
            "flaky".to_string(),
            handler(|_args: HandlerArgs| async { anyhow::bail!("service unavailable") }),
        );
        let err = run(
            &executor,
            FakeMessage::User("go".to_string()),
            &handlers,
            &NullEventBus,
        )
        .await
        .unwrap_err();
        match err {
            GenieError::HandlerFailure { name, .. } => assert_eq!(name, "flaky"),
            other => panic!("expected handler failure, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_iteration_ceiling() {
        let turns: Vec<_> = (0..MAX_TOOL_ITERATIONS)
            .map(|i| tool_turn("get_weather", &format!("call_{i}"), "{}"))
            .collect();
        let executor = ScriptedExecutor::new(turns);
        let (handlers, _) = weather_handlers();
        let err = run(
            &executor,
            FakeMessage::User("loop forever".to_string()),
            &handlers,
            &NullEventBus,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GenieError::IterationExhausted(8)));
    }

    #[tokio::test]
    async fn test_text_notifications_published() {
        let (bus, mut rx) = ChannelEventBus::new();
        let executor = ScriptedExecutor::new(vec![text_turn("Hello there!")]);
        run(
            &executor,
            FakeMessage::User("hi".to_string()),
            &HashMap::new(),
            bus.as_ref(),
        )
        .await
        .unwrap();
        let (topic, event) = rx.try_recv().unwrap();
        assert_eq!(topic, TOPIC_NOTIFICATION);
        assert!(matches!(event, Event::Notification(n) if n.message == "Hello there!"));
    }

    #[test]
    fn test_parse_tool_args_variants() {
        assert!(parse_tool_args("").unwrap().is_empty());
        assert!(parse_tool_args("null").unwrap().is_empty());
        assert_eq!(
            parse_tool_args(r#"{"location":"Lisbon"}"#).unwrap()["location"],
            json!("Lisbon")
        );
        assert!(matches!(
            parse_tool_args("[1,2,3]"),
            Err(GenieError::ToolArgsInvalid(_))
        ));
        assert!(matches!(
            parse_tool_args("{broken"),
            Err(GenieError::ToolArgsInvalid(_))
        ));
    }
}
