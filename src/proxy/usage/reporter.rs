//! Usage Reporter - 单个请求的使用量上报
//!
//! 每个上游请求创建一个 reporter，收集输入/输出内容用于链路追踪属性，
//! 并在成功、失败、空闲收尾或取消中最先到达的一次触发发布。之后的调用都是空操作。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::identity::{anonymize, resolve_usage_source, AuthInfo};
use super::parser::{json_payload, UsageDetail};
use super::publisher::{UsagePublisher, UsageRecord};
use crate::proxy::log_codes::usg;

/// 流式块中正文的候选路径，按顺序取第一个非空值
const STREAM_CONTENT_POINTERS: [&str; 4] = [
    "/choices/0/delta/content",
    "/candidates/0/content/parts/0/text",
    "/delta/text",
    "/content_block/text",
];

/// 非流式响应中正文的候选路径
const OUTPUT_VALUE_POINTERS: [&str; 3] = [
    "/choices/0/message/content",
    "/candidates/0/content/parts/0/text",
    "/content/0/text",
];

/// 创建带有全部追踪属性字段的请求 span
///
/// `tracing` 只能记录声明过的字段，网关应使用该 span 包裹一次请求。
pub fn request_span(provider: &str, model: &str) -> tracing::Span {
    use tracing::field::Empty;
    tracing::info_span!(
        "llm.request",
        gen_ai.system = provider,
        gen_ai.request.model = model,
        gen_ai.operation.name = "chat",
        openinference.span.kind = "LLM",
        gen_ai.usage.input_tokens = Empty,
        gen_ai.usage.output_tokens = Empty,
        gen_ai.usage.total_tokens = Empty,
        gen_ai.usage.reasoning_tokens = Empty,
        gen_ai.usage.cached_tokens = Empty,
        gen_ai.prompt = Empty,
        gen_ai.request.temperature = Empty,
        gen_ai.request.top_p = Empty,
        gen_ai.request.top_k = Empty,
        gen_ai.request.presence_penalty = Empty,
        gen_ai.request.frequency_penalty = Empty,
        gen_ai.request.max_tokens = Empty,
        llm.input_messages = Empty,
        input.value = Empty,
        gen_ai.completion = Empty,
        output.value = Empty,
        gen_ai.response.id = Empty,
        gen_ai.response.finish_reasons = Empty,
        llm.output_messages = Empty,
        gen_ai.response.model = Empty,
        user.id = Empty,
        usage.failed = Empty,
    )
}

#[derive(Debug, Default)]
struct Capture {
    input: Vec<u8>,
    output: Vec<u8>,
    response_id: String,
    finish_reasons: Vec<String>,
}

#[derive(Debug, Default, Clone)]
struct RequestMeta {
    method: String,
    path: String,
    client_ip: String,
    status_code: u16,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| {
        log::warn!("reporter 锁已毒化，使用恢复值: {e}");
        e.into_inner()
    })
}

/// 单个请求的使用量上报器
pub struct UsageReporter {
    provider: String,
    model: String,
    auth_id: String,
    auth_index: String,
    api_key: String,
    source: String,
    requested_at: DateTime<Utc>,
    started: Instant,
    meta: Mutex<RequestMeta>,
    capture: Mutex<Capture>,
    published: AtomicBool,
    publisher: Arc<UsagePublisher>,
}

impl UsageReporter {
    pub fn new(
        publisher: Arc<UsagePublisher>,
        provider: impl Into<String>,
        model: impl Into<String>,
        auth: Option<&AuthInfo>,
        caller_api_key: &str,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            auth_id: auth.map(|a| a.id.clone()).unwrap_or_default(),
            auth_index: auth.map(|a| a.index.clone()).unwrap_or_default(),
            api_key: caller_api_key.to_string(),
            source: resolve_usage_source(auth, caller_api_key),
            requested_at: Utc::now(),
            started: Instant::now(),
            meta: Mutex::new(RequestMeta::default()),
            capture: Mutex::new(Capture::default()),
            published: AtomicBool::new(false),
            publisher,
        }
    }

    /// 附加入站请求信息
    pub fn with_request_meta(self, method: &str, path: &str, client_ip: &str) -> Self {
        {
            let mut meta = lock(&self.meta);
            meta.method = method.to_string();
            meta.path = path.to_string();
            meta.client_ip = client_ip.to_string();
        }
        self
    }

    pub fn set_status(&self, status_code: u16) {
        lock(&self.meta).status_code = status_code;
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    /// 记录输入（最好是通用格式的请求体），每次调用替换之前的内容
    pub fn set_input(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        lock(&self.capture).input = payload.to_vec();
    }

    /// 一次性记录完整输出（非流式）
    pub fn set_output(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        lock(&self.capture).output = payload.to_vec();
    }

    /// 追加原始输出
    pub fn append_output(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        lock(&self.capture).output.extend_from_slice(chunk);
    }

    /// 解析一个流式块，追加其中的正文并记录响应 id 与结束原因
    pub fn capture_stream_chunk(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let Some(payload) = json_payload(chunk) else {
            return;
        };
        let Ok(value) = serde_json::from_slice::<Value>(payload) else {
            return;
        };

        let mut capture = lock(&self.capture);

        if let Some(id) = value.get("id").and_then(Value::as_str).filter(|s| !s.is_empty()) {
            capture.response_id = id.to_string();
        }

        for (array, field) in [("choices", "finish_reason"), ("candidates", "finishReason")] {
            if let Some(items) = value.get(array).and_then(Value::as_array) {
                for item in items {
                    if let Some(reason) = item
                        .get(field)
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                    {
                        capture.finish_reasons.push(reason.to_string());
                    }
                }
            }
        }

        if let Some(text) = STREAM_CONTENT_POINTERS.iter().find_map(|p| {
            value
                .pointer(p)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        }) {
            capture.output.extend_from_slice(text.as_bytes());
        }
    }

    /// 成功发布
    pub fn publish(&self, detail: UsageDetail) -> bool {
        self.publish_with_outcome(detail, false)
    }

    /// 失败发布（零用量）
    pub fn publish_failure(&self) -> bool {
        self.publish_with_outcome(UsageDetail::default(), true)
    }

    /// 失败发布，携带已经观察到的部分用量
    pub fn publish_partial_failure(&self, detail: UsageDetail) -> bool {
        self.publish_with_outcome(detail, true)
    }

    /// 若尚未发布则以空用量发布一次
    pub fn ensure_published(&self) -> bool {
        self.publish_with_outcome(UsageDetail::default(), false)
    }

    /// 结果为错误时发布失败记录
    pub fn track_failure<T, E>(&self, result: &Result<T, E>) {
        if result.is_err() {
            self.publish_failure();
        }
    }

    fn publish_with_outcome(&self, detail: UsageDetail, failed: bool) -> bool {
        if self.published.swap(true, Ordering::AcqRel) {
            log::debug!(
                "[{}] {} {} 已发布过使用量，忽略重复发布",
                usg::DUPLICATE_PUBLISH,
                self.provider,
                self.model
            );
            return false;
        }

        let detail = detail.normalized();
        let capture = std::mem::take(&mut *lock(&self.capture));

        let span = tracing::Span::current();
        if !span.is_disabled() {
            self.record_span_attributes(&span, &detail, failed, &capture);
        }

        let record = self.build_record(detail, failed);
        log::debug!(
            "[{}] provider={}, model={}, failed={}, input={}, output={}, reasoning={}, cached={}, total={}",
            usg::PUBLISHED,
            record.provider,
            record.model,
            record.failed,
            detail.input_tokens,
            detail.output_tokens,
            detail.reasoning_tokens,
            detail.cached_tokens,
            detail.total_tokens
        );
        self.publisher.publish(&record);
        true
    }

    fn build_record(&self, detail: UsageDetail, failed: bool) -> UsageRecord {
        let meta = lock(&self.meta).clone();
        UsageRecord {
            provider: self.provider.clone(),
            model: self.model.clone(),
            source: self.source.clone(),
            api_key: self.api_key.clone(),
            auth_id: self.auth_id.clone(),
            auth_index: self.auth_index.clone(),
            requested_at: self.requested_at,
            failed,
            detail,
            method: meta.method,
            path: meta.path,
            client_ip: meta.client_ip,
            status_code: meta.status_code,
            latency_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    fn record_span_attributes(
        &self,
        span: &tracing::Span,
        detail: &UsageDetail,
        failed: bool,
        capture: &Capture,
    ) {
        span.record("gen_ai.system", self.provider.as_str());
        span.record("gen_ai.request.model", self.model.as_str());
        span.record("gen_ai.operation.name", "chat");
        span.record("openinference.span.kind", "LLM");
        span.record("gen_ai.usage.input_tokens", detail.input_tokens);
        span.record("gen_ai.usage.output_tokens", detail.output_tokens);
        span.record("gen_ai.usage.total_tokens", detail.total_tokens);
        if detail.reasoning_tokens > 0 {
            span.record("gen_ai.usage.reasoning_tokens", detail.reasoning_tokens);
        }
        if detail.cached_tokens > 0 {
            span.record("gen_ai.usage.cached_tokens", detail.cached_tokens);
        }
        span.record("usage.failed", failed);

        if !capture.input.is_empty() {
            record_input_attributes(span, &capture.input);
        }
        if !capture.output.is_empty() {
            self.record_output_attributes(span, capture);
        }

        if !self.source.is_empty() {
            span.record("user.id", self.source.as_str());
        } else if !self.api_key.is_empty() {
            span.record("user.id", anonymize(&self.api_key).as_str());
        }
    }

    fn record_output_attributes(&self, span: &tracing::Span, capture: &Capture) {
        let output_text = String::from_utf8_lossy(&capture.output);
        span.record("gen_ai.completion", output_text.as_ref());

        let parsed = if capture.output.first() == Some(&b'{') {
            serde_json::from_slice::<Value>(&capture.output).ok()
        } else {
            None
        };

        let output_value = parsed
            .as_ref()
            .and_then(|v| {
                OUTPUT_VALUE_POINTERS
                    .iter()
                    .find_map(|p| v.pointer(p))
                    .map(|content| match content {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
            })
            .unwrap_or_else(|| output_text.to_string());
        span.record("output.value", output_value.as_str());

        let response_id = if capture.response_id.is_empty() {
            parsed
                .as_ref()
                .and_then(|v| v.get("id"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        } else {
            capture.response_id.clone()
        };
        if !response_id.is_empty() {
            span.record("gen_ai.response.id", response_id.as_str());
        }

        let mut reasons = capture.finish_reasons.clone();
        let mut last_message: Option<&Value> = None;
        if let Some(choices) = parsed
            .as_ref()
            .and_then(|v| v.get("choices"))
            .and_then(Value::as_array)
        {
            let collect_reasons = reasons.is_empty();
            for choice in choices {
                if collect_reasons {
                    if let Some(reason) = choice
                        .get("finish_reason")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                    {
                        reasons.push(reason.to_string());
                    }
                }
                if let Some(message) = choice.get("message").or_else(|| choice.get("delta")) {
                    last_message = Some(message);
                }
            }
        }
        if !reasons.is_empty() {
            let encoded = serde_json::to_string(&reasons).unwrap_or_default();
            span.record("gen_ai.response.finish_reasons", encoded.as_str());
        }

        if let Some(message) = last_message {
            span.record("llm.output_messages", format!("[{message}]").as_str());
        } else if parsed.is_none() {
            let messages = json!([{ "role": "assistant", "content": output_text }]);
            span.record("llm.output_messages", messages.to_string().as_str());
        }

        let response_model = parsed.as_ref().and_then(|v| {
            v.get("model")
                .or_else(|| v.pointer("/response/model"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        });
        if let Some(model) = response_model.filter(|m| *m != self.model) {
            span.record("gen_ai.response.model", model);
        }
    }
}

fn record_input_attributes(span: &tracing::Span, input: &[u8]) {
    let input_text = String::from_utf8_lossy(input);
    span.record("gen_ai.prompt", input_text.as_ref());
    span.record("input.value", input_text.as_ref());

    let Ok(request) = serde_json::from_slice::<Value>(input) else {
        return;
    };
    for (key, field) in [
        ("temperature", "gen_ai.request.temperature"),
        ("top_p", "gen_ai.request.top_p"),
        ("presence_penalty", "gen_ai.request.presence_penalty"),
        ("frequency_penalty", "gen_ai.request.frequency_penalty"),
    ] {
        if let Some(v) = request.get(key).and_then(Value::as_f64) {
            span.record(field, v);
        }
    }
    for (key, field) in [
        ("top_k", "gen_ai.request.top_k"),
        ("max_tokens", "gen_ai.request.max_tokens"),
    ] {
        if let Some(v) = request.get(key).and_then(Value::as_i64) {
            span.record(field, v);
        }
    }

    let messages = request
        .get("messages")
        .filter(|m| m.is_array())
        .or_else(|| request.get("contents").filter(|c| c.is_array()));
    if let Some(messages) = messages {
        span.record("llm.input_messages", messages.to_string().as_str());
    }
}

impl std::fmt::Debug for UsageReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageReporter")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("auth_index", &self.auth_index)
            .field("published", &self.is_published())
            .finish()
    }
}
