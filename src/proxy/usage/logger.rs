//! Request Log Writer - 将使用量记录持久化为请求日志

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::identity::anonymize;
use super::publisher::{UsageRecord, UsageSink};
use crate::database::{Database, RequestLog};
use crate::proxy::log_codes::usg;

/// 失败请求统一写入的错误信息
const FAILED_MESSAGE: &str = "Request failed";

/// 请求 id: `{纳秒时间戳}-{标识哈希}`，标识依次取 api_key、auth_index、client_ip
pub fn build_request_id(record: &UsageRecord) -> String {
    let nanos = record
        .requested_at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| record.requested_at.timestamp_micros() * 1000);
    let identifier = [&record.api_key, &record.auth_index, &record.client_ip]
        .into_iter()
        .find(|s| !s.is_empty())
        .map(String::as_str)
        .unwrap_or_default();
    if identifier.is_empty() {
        return nanos.to_string();
    }
    format!("{nanos}-{}", anonymize(identifier))
}

impl From<&UsageRecord> for RequestLog {
    fn from(record: &UsageRecord) -> Self {
        let detail = record.detail.normalized();
        Self {
            id: 0,
            request_id: build_request_id(record),
            timestamp: record.requested_at,
            method: record.method.clone(),
            path: record.path.clone(),
            status_code: record.status_code,
            latency_ms: record.latency_ms,
            client_ip: record.client_ip.clone(),
            model: record.model.clone(),
            provider: record.provider.clone(),
            input_tokens: detail.input_tokens,
            output_tokens: detail.output_tokens,
            reasoning_tokens: detail.reasoning_tokens,
            cached_tokens: detail.cached_tokens,
            total_tokens: detail.total_tokens,
            is_error: record.failed,
            error_message: if record.failed {
                FAILED_MESSAGE.to_string()
            } else {
                String::new()
            },
            auth_index: record.auth_index.clone(),
        }
    }
}

/// 请求日志写入 sink
///
/// 有 tokio 运行时时写入派发到阻塞线程池，否则同步写入。写入失败只记日志。
pub struct RequestLogWriter {
    db: Arc<Database>,
    enabled: AtomicBool,
}

impl RequestLogWriter {
    pub fn new(db: Arc<Database>, enabled: bool) -> Self {
        Self {
            db,
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn write(db: &Database, log: &RequestLog) {
        if let Err(e) = db.insert_request_log(log) {
            log::debug!(
                "[{}] 写入请求日志失败 request_id={}: {e}",
                usg::LOG_FAILED,
                log.request_id
            );
        }
    }
}

impl UsageSink for RequestLogWriter {
    fn handle_usage(&self, record: &UsageRecord) {
        if !self.is_enabled() {
            return;
        }
        let log = RequestLog::from(record);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let db = self.db.clone();
                handle.spawn_blocking(move || Self::write(&db, &log));
            }
            Err(_) => Self::write(&self.db, &log),
        }
    }
}
