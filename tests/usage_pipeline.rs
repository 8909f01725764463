use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tower::ServiceExt;

use usage_gateway_lib::proxy::response_processor::{create_usage_stream, StreamTimeouts};
use usage_gateway_lib::{
    AppError, AuthInfo, Database, UsageConfig, UsageDetail, UsageFilter, UsageRuntime, WireFormat,
};

fn runtime_with_logs() -> Result<UsageRuntime, AppError> {
    let config = UsageConfig {
        request_log_enabled: true,
        ..Default::default()
    };
    Ok(UsageRuntime::with_database(
        &config,
        Arc::new(Database::memory()?),
    ))
}

async fn drain(
    runtime: &UsageRuntime,
    reporter: usage_gateway_lib::UsageReporter,
    format: WireFormat,
    parts: Vec<&'static str>,
) -> String {
    let ctx = runtime.stream_context(Arc::new(reporter), format, StreamTimeouts::default());
    let source = stream::iter(
        parts
            .into_iter()
            .map(|p| Ok::<_, std::io::Error>(Bytes::from_static(p.as_bytes()))),
    );
    let chunks: Vec<_> = create_usage_stream(source, ctx).collect().await;
    let mut out = Vec::new();
    for chunk in chunks {
        out.extend_from_slice(&chunk.expect("chunk"));
    }
    String::from_utf8(out).expect("utf8")
}

async fn wait_for_logs(db: &Database, expected: u64) {
    for _ in 0..100 {
        let total = db
            .get_request_logs(&Default::default(), 1, 20)
            .expect("query logs")
            .total;
        if total == expected {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("expected {expected} request logs");
}

#[tokio::test]
async fn gemini_stream_correlates_stop_chunk_and_records_usage() -> Result<(), AppError> {
    let runtime = runtime_with_logs()?;
    let auth = AuthInfo {
        id: "gemini-cli-auth".into(),
        index: "4".into(),
        provider: "gemini-cli".into(),
        ..Default::default()
    };
    let reporter = runtime
        .reporter("gemini-cli", "gemini-2.5-pro", Some(&auth), "sk-caller")
        .with_request_meta("POST", "/v1beta/models/gemini-2.5-pro:streamGenerateContent", "10.0.0.8");

    let out = drain(
        &runtime,
        reporter,
        WireFormat::Gemini,
        vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]}}],\"traceId\":\"abc\"}\n\n",
            "data: {\"candidates\":[{\"finishReason\":\"STOP\"}],\"traceId\":\"abc\"}\n\n",
            "data: {\"usageMetadata\":{\"promptTokenCount\":8,\"candidatesTokenCount\":4,\"totalTokenCount\":12},\"traceId\":\"abc\"}\n\n",
        ],
    )
    .await;

    assert!(!out.contains("finishReason"));
    assert!(out.contains("\"usageMetadata\":{\"promptTokenCount\":8"));
    assert!(!runtime.filter.memory().contains("abc"));

    let snapshot = runtime.stats.memory_snapshot();
    assert_eq!(snapshot.total_requests, 1);
    assert_eq!(snapshot.total_tokens, 12);
    let model = &snapshot.apis["sk-caller"].models["gemini-2.5-pro"];
    assert_eq!(model.details[0].source, "gemini-cli-auth");
    assert_eq!(model.details[0].auth_index, "4");

    let db = runtime.db.as_ref().expect("db");
    wait_for_logs(db, 1).await;
    let logs = db.get_request_logs(&Default::default(), 1, 20)?;
    assert_eq!(logs.logs[0].total_tokens, 12);
    assert_eq!(logs.logs[0].client_ip, "10.0.0.8");
    assert!(!logs.logs[0].request_id.contains("sk-caller"));
    Ok(())
}

#[tokio::test]
async fn failed_and_successful_requests_roll_up() -> Result<(), AppError> {
    let runtime = UsageRuntime::new(&UsageConfig::default())?;
    for tokens in [10u64, 20, 30] {
        runtime
            .reporter("openai", "gpt-4o", None, "key")
            .publish(UsageDetail {
                total_tokens: tokens,
                ..Default::default()
            });
    }
    let failing = runtime.reporter("openai", "gpt-4o", None, "key");
    failing.track_failure::<(), &str>(&Err("upstream closed"));
    failing.publish(UsageDetail {
        total_tokens: 99,
        ..Default::default()
    });

    let snapshot = runtime.stats.snapshot()?;
    assert_eq!(
        (
            snapshot.total_requests,
            snapshot.success_count,
            snapshot.failure_count,
            snapshot.total_tokens
        ),
        (4, 3, 1, 60)
    );
    Ok(())
}

#[tokio::test]
async fn openai_usage_example_and_plain_passthrough() -> Result<(), AppError> {
    let runtime = UsageRuntime::new(&UsageConfig::default())?;
    let reporter = runtime.reporter("openai", "gpt-4o-mini", None, "");
    let body = "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"},\"finish_reason\":\"stop\"}]}\n\ndata: {\"choices\":[],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2}}\n\ndata: [DONE]\n\n";

    let out = drain(&runtime, reporter, WireFormat::OpenAi, vec![body]).await;
    assert_eq!(out, body);

    let snapshot = runtime.stats.memory_snapshot();
    let detail = snapshot.apis["openai"].models["gpt-4o-mini"].details[0].tokens;
    assert_eq!(
        (detail.input_tokens, detail.output_tokens, detail.total_tokens),
        (1, 2, 3)
    );
    Ok(())
}

#[tokio::test]
async fn exported_statistics_import_once() -> Result<(), AppError> {
    let source = UsageRuntime::new(&UsageConfig::default())?;
    source.reporter("claude", "claude-sonnet-4", None, "k1").publish(UsageDetail {
        input_tokens: 3,
        output_tokens: 4,
        ..Default::default()
    });

    let export = source
        .management_router()
        .oneshot(
            Request::builder()
                .uri("/v0/management/usage/export")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("export");
    assert_eq!(export.status(), StatusCode::OK);
    let payload = axum::body::to_bytes(export.into_body(), usize::MAX)
        .await
        .expect("export body");

    let target = UsageRuntime::new(&UsageConfig::default())?;
    let mut results = Vec::new();
    for _ in 0..2 {
        let resp = target
            .management_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v0/management/usage/import")
                    .body(Body::from(payload.clone()))
                    .expect("request"),
            )
            .await
            .expect("import");
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("import body");
        results.push(serde_json::from_slice::<Value>(&bytes)?);
    }

    assert_eq!(results[0]["added"], 1);
    assert_eq!(results[1]["added"], 0);
    assert_eq!(results[1]["skipped"], 1);
    assert_eq!(target.stats.memory_snapshot().total_tokens, 7);
    Ok(())
}

#[test]
fn shared_filter_memory_spans_streams() {
    let filter = UsageFilter::new();
    let stop = filter.filter(b"data: {\"candidates\":[{\"finishReason\":\"STOP\"}],\"traceId\":\"t-9\"}\n");
    assert!(stop.is_empty());
    assert!(filter.memory().contains("t-9"));

    let usage = b"data: {\"usageMetadata\":{\"totalTokenCount\":3},\"traceId\":\"t-9\"}\n";
    assert_eq!(filter.filter(usage).as_ref(), &usage[..]);
    assert!(!filter.memory().contains("t-9"));
}
