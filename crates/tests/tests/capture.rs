//! Cross-crate integration tests
//!
//! These drive the capture engine end to end: a mock provider client is
//! wrapped, called the way an application would call it, and the records
//! that reach the collector are checked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use spyglass::testing::{MockAnthropic, MockGenerate, MockOpenAi, fixtures, wait_for};
use spyglass::{
    Capture, CaptureConfig, CaptureError, Collector, ErrorCategory, GenerateClient,
    MemoryCollector, Message, NormalizedCall, OpenAiClient, ProviderError, Record, SpanPayload,
    SpanRecord, SpanType,
};
use spyglass_tracing::RecordWriter;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn engine() -> (Capture, Arc<MemoryCollector>) {
    engine_with(CaptureConfig::default())
}

fn engine_with(config: CaptureConfig) -> (Capture, Arc<MemoryCollector>) {
    init_logging();
    let collector = Arc::new(MemoryCollector::new());
    (Capture::new(config, collector.clone()), collector)
}

fn llm_call(span: &SpanRecord) -> &NormalizedCall {
    match &span.payload {
        SpanPayload::Llm(call) => call,
        other => panic!("expected llm payload, got {other:?}"),
    }
}

fn streaming(mut request: Value) -> Value {
    request["stream"] = json!(true);
    request
}

// ============================================================================
// Blocking calls
// ============================================================================

#[tokio::test]
async fn test_blocking_call_success() {
    let (capture, collector) = engine();
    let response = json!({
        "choices": [{"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 5, "completion_tokens": 3}
    });
    let provider = Arc::new(MockOpenAi::new().with_response(response.clone()));
    let client = capture.wrap_openai(provider.clone());

    let request = json!({"model": "gpt-x", "messages": [{"role": "user", "content": "hi"}]});
    let output = client.chat().completions().create(request.clone()).await.unwrap();

    // The caller sees exactly what the provider returned, for exactly the
    // request it sent.
    assert_eq!(output.into_complete(), Some(response));
    assert_eq!(provider.requests(), vec![request]);

    capture.flush().await;
    let spans = collector.spans_of(SpanType::LlmCall);
    assert_eq!(spans.len(), 1);
    let call = llm_call(&spans[0]);
    assert_eq!(call.output_messages, Some(vec![Message::assistant("hello")]));
    assert_eq!(call.usage.total_tokens, 8);
    assert!(collector.errors().is_empty());
    assert_eq!(collector.traces().len(), 1);
}

#[tokio::test]
async fn test_malformed_tool_arguments_are_repaired() {
    let (capture, collector) = engine();
    let provider = Arc::new(
        MockOpenAi::new().with_response(fixtures::chat_tool_completion("search", "\"query\":\"rain\"")),
    );
    let client = capture.wrap_openai(provider);

    client
        .chat()
        .completions()
        .create(fixtures::chat_request("Will it rain?"))
        .await
        .unwrap();

    capture.flush().await;
    assert!(collector.errors().is_empty());

    let llm = &collector.spans_of(SpanType::LlmCall)[0];
    let tool_call = llm_call(llm).output_tool_calls().next().cloned().unwrap();
    assert_eq!(tool_call.arguments, json!({"query": "rain"}));

    let tools = collector.spans_of(SpanType::ToolCall);
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].parent_span_id.as_deref(), Some(llm.span_id.as_str()));
    let SpanPayload::Tool(record) = &tools[0].payload else {
        panic!("expected tool payload");
    };
    assert_eq!(record.args, json!({"query": "rain"}));
    assert_eq!(record.tool_call_id.as_deref(), Some("call_1"));
}

#[tokio::test]
async fn test_provider_error_is_returned_unchanged() {
    let (capture, collector) = engine();
    let provider = Arc::new(MockAnthropic::new().with_error(ProviderError::Api {
        status: 429,
        message: "You exceeded your current quota".to_string(),
        code: Some("insufficient_quota".to_string()),
    }));
    let client = capture.wrap_anthropic(provider);

    let error = client
        .messages()
        .create(json!({"model": "claude-3-5-haiku", "messages": []}))
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        ProviderError::Api { status: 429, ref code, .. } if code.as_deref() == Some("insufficient_quota")
    ));

    capture.flush().await;
    let errors = collector.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_category, ErrorCategory::QuotaError);
    assert_eq!(errors[0].error_code, "insufficient_quota");

    let spans = collector.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(errors[0].span_id, spans[0].span_id);
    assert!(!collector.traces()[0].outcome.is_ok());
}

// ============================================================================
// Wrapping
// ============================================================================

#[tokio::test]
async fn test_nested_client_wrapping() {
    let (capture, collector) = engine();
    let provider = Arc::new(
        MockOpenAi::new()
            .with_response(fixtures::chat_completion("one"))
            .with_response(fixtures::chat_completion("two")),
    );

    let wrapped = capture.wrap_openai(provider.clone());
    assert!(Arc::ptr_eq(&wrapped, &capture.wrap_openai(provider.clone())));
    assert!(Arc::ptr_eq(&wrapped, &capture.wrap_openai(wrapped.clone())));

    assert!(!Arc::ptr_eq(&wrapped.chat(), &provider.chat()));
    assert!(Arc::ptr_eq(&wrapped.chat(), &wrapped.chat()));
    assert!(Arc::ptr_eq(
        &wrapped.chat().completions(),
        &wrapped.chat().completions()
    ));

    wrapped
        .chat()
        .completions()
        .create(fixtures::chat_request("first"))
        .await
        .unwrap();
    capture.flush().await;
    assert_eq!(collector.spans().len(), 1);

    wrapped
        .chat()
        .completions()
        .create(fixtures::chat_request("second"))
        .await
        .unwrap();
    capture.flush().await;
    assert_eq!(collector.spans().len(), 2);
}

#[tokio::test]
async fn test_unsampled_calls_still_run() {
    let config = CaptureConfig {
        sample_rate: 0.0,
        ..CaptureConfig::default()
    };
    let (capture, collector) = engine_with(config);
    let client = capture.wrap_generate(Arc::new(
        MockGenerate::new("local").with_response(fixtures::text_completion("fine")),
    ));

    let output = client.generate(json!({"prompt": "hi"})).await.unwrap();
    assert_eq!(output.into_complete(), Some(fixtures::text_completion("fine")));

    capture.flush().await;
    assert!(collector.is_empty());
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn test_streamed_empty_response() {
    for chunks in [Vec::new(), fixtures::chat_chunks(&["", ""])] {
        let (capture, collector) = engine();
        let client = capture.wrap_openai(Arc::new(MockOpenAi::new().with_stream(chunks.clone())));

        let live: Vec<Value> = client
            .chat()
            .completions()
            .create(streaming(fixtures::chat_request("hi")))
            .await
            .unwrap()
            .into_stream()
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(live, chunks);

        wait_for(|| !collector.errors().is_empty()).await;
        capture.flush().await;

        assert!(collector.spans().iter().all(|s| !s.outcome.is_ok()));
        let errors = collector.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_code, "empty_response");
        assert_eq!(errors[0].error_category, ErrorCategory::ModelError);
    }
}

#[tokio::test]
async fn test_streamed_tool_only_turn_is_not_empty() {
    let (capture, collector) = engine();
    let chunks = fixtures::chat_tool_chunks("search", &["{\"query\"", ":\"rain\"}"]);
    let client = capture.wrap_openai(Arc::new(MockOpenAi::new().with_stream(chunks)));

    let stream = client
        .chat()
        .completions()
        .create(streaming(fixtures::chat_request("Will it rain?")))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    let _: Vec<_> = stream.collect().await;

    wait_for(|| !collector.spans_of(SpanType::LlmCall).is_empty()).await;
    capture.flush().await;

    assert!(collector.errors().is_empty());
    let tools = collector.spans_of(SpanType::ToolCall);
    let SpanPayload::Tool(record) = &tools[0].payload else {
        panic!("expected tool payload");
    };
    assert_eq!(record.args, json!({"query": "rain"}));
}

#[tokio::test]
async fn test_chunk_split_round_trip() {
    let text = "Streams split anywhere";
    for split in 0..=text.len() {
        let (capture, collector) = engine();
        let chunks = fixtures::chat_chunks(&[&text[..split], &text[split..]]);
        let client = capture.wrap_openai(Arc::new(MockOpenAi::new().with_stream(chunks.clone())));

        let live: Vec<Value> = client
            .chat()
            .completions()
            .create(streaming(fixtures::chat_request("go")))
            .await
            .unwrap()
            .into_stream()
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(live, chunks, "split at {split}");

        wait_for(|| !collector.spans().is_empty()).await;
        let spans = collector.spans();
        assert_eq!(llm_call(&spans[0]).output_text(), text, "split at {split}");
        assert!(spans[0].outcome.is_ok());
    }
}

#[tokio::test]
async fn test_anthropic_event_stream() {
    let (capture, collector) = engine();
    let events = fixtures::anthropic_text_events(&["Bon", "jour"]);
    let client = capture.wrap_anthropic(Arc::new(MockAnthropic::new().with_stream(events.clone())));

    let live: Vec<Value> = client
        .messages()
        .create(json!({"model": "claude-3-5-haiku", "stream": true, "messages": []}))
        .await
        .unwrap()
        .into_stream()
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(live, events);

    wait_for(|| !collector.spans().is_empty()).await;
    let span = &collector.spans()[0];
    let call = llm_call(span);
    assert_eq!(call.output_text(), "Bonjour");
    assert_eq!(call.finish_reason.as_deref(), Some("end_turn"));
    assert_eq!(call.usage.input_tokens, 12);
    assert_eq!(call.usage.output_tokens, 9);
    assert!(span.time_to_first_token_ms.is_some());
}

#[tokio::test]
async fn test_abandoned_stream_is_still_recorded() {
    let (capture, collector) = engine();
    let chunks = vec![
        json!({"response": "a"}),
        json!({"response": "b"}),
        json!({"response": "c", "done": true}),
    ];
    let client = capture.wrap_generate(Arc::new(MockGenerate::new("local").with_stream(chunks)));

    let mut stream = client
        .generate(json!({"prompt": "abc", "stream": true}))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), json!({"response": "a"}));
    drop(stream);

    // The rest of the source is drained in the background.
    wait_for(|| !collector.spans().is_empty()).await;
    assert_eq!(llm_call(&collector.spans()[0]).output_text(), "abc");
}

#[tokio::test(start_paused = true)]
async fn test_stream_timeout_leaves_live_branch_alone() {
    let mut config = CaptureConfig::default();
    config.stream.max_wait_secs = 1;
    let (capture, collector) = engine_with(config);
    let client = capture.wrap_generate(Arc::new(
        MockGenerate::new("local")
            .with_chunk_delay(Duration::from_secs(2))
            .with_stream(vec![json!({"response": "slow"}), json!({"response": " answer"})]),
    ));

    let live: Vec<_> = client
        .generate(json!({"prompt": "x", "stream": true}))
        .await
        .unwrap()
        .into_stream()
        .unwrap()
        .collect()
        .await;
    assert_eq!(live.len(), 2);
    assert!(live.iter().all(Result::is_ok));

    wait_for(|| !collector.errors().is_empty()).await;
    let error = &collector.errors()[0];
    assert_eq!(error.error_code, "stream_timeout");
    assert_eq!(error.error_category, ErrorCategory::TimeoutError);
}

#[tokio::test]
async fn test_source_failure_reaches_caller_and_collector() {
    let (capture, collector) = engine();
    let chunks = fixtures::chat_chunks(&["partial"])[..2].to_vec();
    let client = capture.wrap_openai(Arc::new(
        MockOpenAi::new().with_failing_stream(chunks, ProviderError::Stream("connection reset".to_string())),
    ));

    let live: Vec<_> = client
        .chat()
        .completions()
        .create(streaming(fixtures::chat_request("hi")))
        .await
        .unwrap()
        .into_stream()
        .unwrap()
        .collect()
        .await;
    assert_eq!(live.len(), 3);
    assert_eq!(
        live[2].as_ref().unwrap_err().to_string(),
        "Stream error: connection reset"
    );

    wait_for(|| !collector.errors().is_empty()).await;
    capture.flush().await;
    assert_eq!(collector.errors()[0].error_category, ErrorCategory::NetworkError);
    assert_eq!(llm_call(&collector.spans()[0]).output_text(), "partial");
}

// ============================================================================
// Context propagation
// ============================================================================

#[tokio::test]
async fn test_overlapping_chains_are_isolated() {
    let (capture, collector) = engine();
    let mut mock = MockGenerate::new("local").with_latency(Duration::from_millis(5));
    for _ in 0..4 {
        mock = mock.with_response(fixtures::text_completion("ok"));
    }
    let client = capture.wrap_generate(Arc::new(mock));

    let run = |name: &'static str| {
        let capture = capture.clone();
        let client = client.clone();
        async move {
            capture
                .trace_chain(name, async {
                    client.generate(json!({"prompt": name})).await?;
                    tokio::task::yield_now().await;
                    client.generate(json!({"prompt": name})).await?;
                    Ok::<_, ProviderError>(())
                })
                .await
        }
    };
    let (a, b) = tokio::join!(run("a"), run("b"));
    a.unwrap();
    b.unwrap();

    capture.flush().await;
    let chains: HashMap<String, SpanRecord> = collector
        .spans_of(SpanType::Chain)
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();
    assert_eq!(chains.len(), 2);
    assert_ne!(chains["a"].trace_id, chains["b"].trace_id);

    let calls = collector.spans_of(SpanType::LlmCall);
    assert_eq!(calls.len(), 4);
    for span in &calls {
        let prompt = llm_call(span).input_messages[0].content.clone().unwrap();
        let chain = &chains[&prompt];
        assert_eq!(span.trace_id, chain.trace_id);
        assert_eq!(span.parent_span_id.as_deref(), Some(chain.span_id.as_str()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_traces_on_worker_threads() {
    let (capture, collector) = engine();
    let mut mock = MockGenerate::new("local").with_latency(Duration::from_millis(2));
    for _ in 0..16 {
        mock = mock.with_response(fixtures::text_completion("ok"));
    }
    let client = capture.wrap_generate(Arc::new(mock));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let capture = capture.clone();
            let client = client.clone();
            tokio::spawn(async move {
                let name = format!("task-{i}");
                capture
                    .trace_chain(&name, async {
                        client.generate(json!({"prompt": name})).await?;
                        client.generate(json!({"prompt": name})).await?;
                        Ok::<_, ProviderError>(())
                    })
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    capture.flush().await;
    let chains: HashMap<String, SpanRecord> = collector
        .spans_of(SpanType::Chain)
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();
    assert_eq!(chains.len(), 8);
    assert_eq!(collector.traces().len(), 8);

    for span in collector.spans_of(SpanType::LlmCall) {
        let prompt = llm_call(&span).input_messages[0].content.clone().unwrap();
        assert_eq!(span.parent_span_id.as_deref(), Some(chains[&prompt].span_id.as_str()));
    }
}

// ============================================================================
// Collectors, redaction and configuration
// ============================================================================

struct BrokenCollector;

#[async_trait]
impl Collector for BrokenCollector {
    async fn submit(&self, _record: Record) -> Result<(), CaptureError> {
        Err(CaptureError::Collector("ingestion endpoint unreachable".to_string()))
    }
}

#[tokio::test]
async fn test_collector_failure_never_reaches_caller() {
    init_logging();
    let capture = Capture::new(CaptureConfig::default(), Arc::new(BrokenCollector));
    let client = capture.wrap_openai(Arc::new(
        MockOpenAi::new().with_response(fixtures::chat_completion("still fine")),
    ));

    let output = client
        .chat()
        .completions()
        .create(fixtures::chat_request("hi"))
        .await
        .unwrap();
    assert_eq!(output.into_complete(), Some(fixtures::chat_completion("still fine")));
    capture.flush().await;
}

#[tokio::test]
async fn test_redaction_hook_applies_to_payloads() {
    init_logging();
    let collector = Arc::new(MemoryCollector::new());
    let capture = Capture::builder(CaptureConfig::default())
        .collector(collector.clone())
        .redactor(Arc::new(|payload: Value| {
            serde_json::from_str(&payload.to_string().replace("sk-secret", "[redacted]"))
                .unwrap_or(Value::Null)
        }))
        .build();
    let client = capture.wrap_openai(Arc::new(
        MockOpenAi::new().with_response(fixtures::chat_completion("noted")),
    ));

    client
        .chat()
        .completions()
        .create(fixtures::chat_request("my key is sk-secret"))
        .await
        .unwrap();

    capture.flush().await;
    let call = llm_call(&collector.spans()[0]).clone();
    assert_eq!(
        call.input_messages[0].content.as_deref(),
        Some("my key is [redacted]")
    );
}

#[tokio::test]
async fn test_discovered_config_writes_jsonl() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let spyglass_dir = dir.path().join(".spyglass");
    std::fs::create_dir_all(&spyglass_dir).unwrap();
    std::fs::write(
        spyglass_dir.join("config.toml"),
        "capture_content = false\n\n[writer]\npath = \"calls.jsonl\"\nsession_mode = true\n",
    )
    .unwrap();
    let nested = dir.path().join("src").join("app");
    std::fs::create_dir_all(&nested).unwrap();

    let capture = Capture::discover(&nested);
    assert!(capture.is_enabled());
    assert!(!capture.config().capture_content);

    let client = capture.wrap_openai(Arc::new(
        MockOpenAi::new().with_response(fixtures::chat_completion("private")),
    ));
    client
        .chat()
        .completions()
        .create(fixtures::chat_request("private question"))
        .await
        .unwrap();
    capture.flush().await;

    let records = RecordWriter::read_records(&spyglass_dir.join("calls.jsonl")).unwrap();
    assert_eq!(records.len(), 2);
    let span = records.iter().find_map(Record::as_span).unwrap();
    let call = llm_call(span);
    assert_eq!(call.input_messages[0].content, None);
    assert_eq!(call.usage.total_tokens, 8);
    assert!(records.iter().any(|r| r.as_trace().is_some()));
}
