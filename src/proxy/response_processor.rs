//! 响应处理器模块
//!
//! 透传上游的流式和非流式响应，同时完成 SSE 使用量过滤与使用量上报

use std::sync::Arc;
use std::time::Duration;

use axum::response::Response;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use reqwest::header::{HeaderMap, CONTENT_TYPE};

use super::log_codes::{rsp, usg};
use super::usage::parser::{parse_stream_usage, parse_usage, UsageDetail, WireFormat};
use super::usage::reporter::UsageReporter;
use super::usage::stream_filter::UsageFilter;
use crate::error::AppError;

// ============================================================================
// 公共接口
// ============================================================================

/// 流式超时配置，`None` 表示不限制
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamTimeouts {
    /// 首字节超时
    pub first_byte: Option<Duration>,
    /// 静默期超时
    pub idle: Option<Duration>,
}

/// 一次流式透传所需的上下文
#[derive(Clone)]
pub struct UsageStreamContext {
    pub reporter: Arc<UsageReporter>,
    pub filter: Arc<UsageFilter>,
    pub format: WireFormat,
    pub timeouts: StreamTimeouts,
}

/// 检测响应是否为 SSE 流式响应
#[inline]
pub fn is_sse_response(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false)
}

/// 处理非流式响应体：记录输出并发布一次使用量
///
/// 状态码 >= 400 视为失败；否则解析不到 usage 时发布空用量。
pub fn process_body(
    reporter: &UsageReporter,
    format: WireFormat,
    status_code: u16,
    body: &[u8],
) -> Option<UsageDetail> {
    reporter.set_status(status_code);
    reporter.set_output(body);

    if status_code >= 400 {
        reporter.publish_failure();
        return None;
    }

    let detail = parse_usage(format, body);
    match detail {
        Some(detail) => reporter.publish(detail),
        None => {
            log::debug!(
                "[{}] {} 响应未包含 usage 信息 ({} bytes)",
                reporter.provider(),
                reporter.model(),
                body.len()
            );
            reporter.ensure_published()
        }
    };
    detail
}

/// 通用响应处理入口
///
/// 根据响应类型自动选择流式或非流式处理
pub async fn process_upstream_response(
    response: reqwest::Response,
    ctx: UsageStreamContext,
) -> Result<Response, AppError> {
    let status = response.status();
    let headers = response.headers().clone();
    ctx.reporter.set_status(status.as_u16());

    let mut builder = axum::response::Response::builder().status(status);
    for (key, value) in headers.iter() {
        builder = builder.header(key, value);
    }

    let body = if is_sse_response(&headers) && status.is_success() {
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::other(e.to_string())));
        axum::body::Body::from_stream(create_usage_stream(stream, ctx.clone()))
    } else {
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("[{}] 读取响应失败: {e}", rsp::READ_BODY_ERROR);
                ctx.reporter.publish_failure();
                return Err(AppError::Message(format!(
                    "Failed to read response body: {e}"
                )));
            }
        };
        process_body(&ctx.reporter, ctx.format, status.as_u16(), &bytes);
        axum::body::Body::from(bytes)
    };

    builder.body(body).map_err(|e| {
        log::error!("[{}] 构建响应失败: {e}", rsp::BUILD_RESPONSE_ERROR);
        AppError::Message(format!("Failed to build response: {e}"))
    })
}

// ============================================================================
// 流式透传
// ============================================================================

/// 流被提前丢弃（客户端断开）时以失败发布一次，携带已看到的用量
struct PublishGuard {
    reporter: Arc<UsageReporter>,
    last_usage: Option<UsageDetail>,
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        if !self.reporter.is_published() {
            log::debug!(
                "[{}] {} {} 流在完成前被丢弃",
                usg::CANCELLED,
                self.reporter.provider(),
                self.reporter.model()
            );
            self.reporter
                .publish_partial_failure(self.last_usage.unwrap_or_default());
        }
    }
}

/// 处理一段完整的行：逐行采集输出与使用量，返回过滤后的字节
fn process_lines(
    ctx: &UsageStreamContext,
    chunk: &[u8],
    last_usage: &mut Option<UsageDetail>,
) -> Bytes {
    for line in chunk.split(|b| *b == b'\n') {
        if line.trim_ascii().is_empty() {
            continue;
        }
        ctx.reporter.capture_stream_chunk(line);
        if let Some(detail) = parse_stream_usage(ctx.format, line) {
            *last_usage = Some(match *last_usage {
                Some(prev) => prev.merge(detail),
                None => detail,
            });
        }
    }
    Bytes::from(ctx.filter.filter(chunk).into_owned())
}

/// 创建带使用量采集和超时控制的透传流
///
/// 不完整的行会缓存到下一个网络块到达。正常结束时发布合并后的使用量，
/// 出错、超时或流被丢弃（包括从未被轮询）时发布携带已见用量的失败记录。
pub fn create_usage_stream(
    stream: impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    ctx: UsageStreamContext,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    let mut guard = PublishGuard {
        reporter: ctx.reporter.clone(),
        last_usage: None,
    };

    async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        let mut is_first_chunk = true;

        tokio::pin!(stream);

        loop {
            // 选择超时时间：首字节超时或静默期超时
            let timeout_duration = if is_first_chunk {
                ctx.timeouts.first_byte
            } else {
                ctx.timeouts.idle
            };

            let chunk_result = match timeout_duration {
                Some(duration) => match tokio::time::timeout(duration, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        let timeout_type = if is_first_chunk { "首字节" } else { "静默期" };
                        log::error!(
                            "[{}] 流式响应{timeout_type}超时 ({}秒)",
                            rsp::STREAM_TIMEOUT,
                            duration.as_secs()
                        );
                        guard
                            .reporter
                            .publish_partial_failure(guard.last_usage.unwrap_or_default());
                        yield Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            format!("流式响应{timeout_type}超时"),
                        ));
                        break;
                    }
                },
                None => stream.next().await,
            };

            match chunk_result {
                Some(Ok(bytes)) => {
                    is_first_chunk = false;
                    buffer.extend_from_slice(&bytes);
                    let Some(pos) = buffer.iter().rposition(|b| *b == b'\n') else {
                        continue;
                    };
                    let complete: Vec<u8> = buffer.drain(..=pos).collect();
                    let out = process_lines(&ctx, &complete, &mut guard.last_usage);
                    if !out.is_empty() {
                        yield Ok(out);
                    }
                }
                Some(Err(e)) => {
                    log::error!("[{}] 流错误: {e}", rsp::STREAM_ERROR);
                    guard
                        .reporter
                        .publish_partial_failure(guard.last_usage.unwrap_or_default());
                    yield Err(e);
                    break;
                }
                None => {
                    if !buffer.is_empty() {
                        let rest = std::mem::take(&mut buffer);
                        let out = process_lines(&ctx, &rest, &mut guard.last_usage);
                        if !out.is_empty() {
                            yield Ok(out);
                        }
                    }
                    match guard.last_usage {
                        Some(detail) => guard.reporter.publish(detail),
                        None => guard.reporter.ensure_published(),
                    };
                    break;
                }
            }
        }
    }
}
