//! 使用量记录与分发
//!
//! 每个请求最终产生一条 `UsageRecord`，由 `UsagePublisher` 分发给所有已注册的
//! `UsageSink`（内存统计、持久化请求日志等）。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::parser::UsageDetail;

/// 一次请求的最终使用量记录，发布后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub source: String,
    pub api_key: String,
    pub auth_id: String,
    pub auth_index: String,
    pub requested_at: DateTime<Utc>,
    pub failed: bool,
    pub detail: UsageDetail,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub latency_ms: u64,
}

impl Default for UsageRecord {
    fn default() -> Self {
        Self {
            provider: String::new(),
            model: String::new(),
            source: String::new(),
            api_key: String::new(),
            auth_id: String::new(),
            auth_index: String::new(),
            requested_at: Utc::now(),
            failed: false,
            detail: UsageDetail::default(),
            method: String::new(),
            path: String::new(),
            client_ip: String::new(),
            status_code: 0,
            latency_ms: 0,
        }
    }
}

/// 使用量记录的消费者
///
/// 实现必须快速返回，阻塞 I/O 需自行派发到后台任务。
pub trait UsageSink: Send + Sync {
    fn handle_usage(&self, record: &UsageRecord);
}

/// 记录分发器
#[derive(Clone, Default)]
pub struct UsagePublisher {
    sinks: Vec<Arc<dyn UsageSink>>,
}

impl UsagePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn register(&mut self, sink: Arc<dyn UsageSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn publish(&self, record: &UsageRecord) {
        for sink in &self.sinks {
            sink.handle_usage(record);
        }
    }
}

impl std::fmt::Debug for UsagePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsagePublisher")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// 收集所有记录的测试 sink
    #[derive(Default)]
    pub struct CollectingSink {
        pub records: Mutex<Vec<UsageRecord>>,
    }

    impl CollectingSink {
        /// 取走目前收到的全部记录
        pub fn taken(&self) -> Vec<UsageRecord> {
            std::mem::take(&mut *self.records.lock().expect("lock records"))
        }
    }

    impl UsageSink for CollectingSink {
        fn handle_usage(&self, record: &UsageRecord) {
            self.records.lock().expect("lock records").push(record.clone());
        }
    }
}
