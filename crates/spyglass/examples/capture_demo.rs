//! Demo of the capture engine on a small agent loop: a chain that streams a
//! model answer, runs the tool the model asked for, and retrieves documents.
//!
//! Records are written as JSONL to a temp directory and summarized at the end.
//! Run with `RUST_LOG=spyglass=debug` to see the engine's own logs.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use spyglass::testing::{MockOpenAi, fixtures};
use spyglass::{Capture, CaptureConfig, JsonlCollector, Record, SharedOpenAiClient};
use spyglass_tracing::{RecordWriter, WriterConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("records.jsonl");
    let collector = Arc::new(JsonlCollector::new(WriterConfig::session(&path))?);
    let capture = Capture::new(CaptureConfig::default(), collector);

    let provider: SharedOpenAiClient = Arc::new(
        MockOpenAi::new()
            .with_stream(fixtures::chat_tool_chunks("search_docs", &["{\"query\":", "\"tides\"}"]))
            .with_response(fixtures::chat_completion("High tide is at 14:05.")),
    );
    let client = capture.wrap_openai(provider);

    let answer: Result<String, spyglass::ProviderError> = capture
        .trace_chain("answer_question", async {
            let mut request = fixtures::chat_request("When is high tide?");
            request["stream"] = json!(true);
            let mut stream = client
                .chat()
                .completions()
                .create(request)
                .await?
                .into_stream()
                .ok_or_else(|| spyglass::ProviderError::Other("expected a stream".to_string()))?;
            while let Some(chunk) = stream.next().await {
                chunk?;
            }

            let docs: Result<Vec<&str>, String> = capture
                .trace_retrieval("tides", async { Ok(vec!["tide-table.pdf"]) })
                .await;
            let tool_output: Result<_, String> = capture
                .tool("search_docs", json!({"query": "tides"}))
                .with_call_id("call_1")
                .run(async { Ok(json!({"documents": docs.unwrap_or_default()})) })
                .await;
            tracing::info!(?tool_output, "Tool finished");

            let reply = client
                .chat()
                .completions()
                .create(fixtures::chat_request("Summarize the tide table."))
                .await?
                .into_complete()
                .unwrap_or_default();
            Ok(reply["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string())
        })
        .await;
    println!("answer: {}", answer?);

    // The streamed call finishes in the background.
    tokio::time::sleep(Duration::from_millis(50)).await;
    capture.flush().await;

    for record in RecordWriter::read_records(&path)? {
        match record {
            Record::Span(span) => println!(
                "span  {:<24} {:?} parent={} {}ms",
                span.name,
                span.span_type,
                span.parent_span_id.as_deref().unwrap_or("-"),
                span.latency_ms
            ),
            Record::Error(error) => println!("error {} {}", error.error_code, error.message),
            Record::Trace(trace) => println!("trace {} {}ms", trace.trace_id, trace.duration_ms),
        }
    }
    Ok(())
}
