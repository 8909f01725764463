//! 使用统计服务
//!
//! 进程内的请求统计：按调用方身份与模型汇总，附带按天/按小时的请求数与 token 数。
//! 配置了请求日志库时，快照改为从数据库聚合。

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Local, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::AppError;
use crate::proxy::usage::parser::UsageDetail;
use crate::proxy::usage::publisher::{UsageRecord, UsageSink};

const UNKNOWN: &str = "unknown";

/// 单次请求明细
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDetail {
    /// 导入数据缺失时间戳时取当前时间
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub auth_index: String,
    #[serde(default)]
    pub tokens: UsageDetail,
    #[serde(default)]
    pub failed: bool,
}

/// 模型维度汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSnapshot {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub details: Vec<RequestDetail>,
}

/// 调用方维度汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSnapshot {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub models: BTreeMap<String, ModelSnapshot>,
}

/// 统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsSnapshot {
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_tokens: u64,
    pub apis: BTreeMap<String, ApiSnapshot>,
    pub requests_by_day: BTreeMap<String, u64>,
    pub requests_by_hour: BTreeMap<String, u64>,
    pub tokens_by_day: BTreeMap<String, u64>,
    pub tokens_by_hour: BTreeMap<String, u64>,
    /// 从数据库聚合时不返回明细
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub details_omitted: bool,
}

/// 合并结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub added: u64,
    pub skipped: u64,
}

/// 明细去重键
#[derive(Debug, PartialEq, Eq, Hash)]
struct DedupKey {
    api: String,
    model: String,
    timestamp: String,
    source: String,
    auth_index: String,
    failed: bool,
    tokens: UsageDetail,
}

impl DedupKey {
    fn new(api: &str, model: &str, detail: &RequestDetail) -> Self {
        Self {
            api: api.to_string(),
            model: model.to_string(),
            timestamp: detail
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Nanos, true),
            source: detail.source.clone(),
            auth_index: detail.auth_index.clone(),
            failed: detail.failed,
            tokens: detail.tokens.normalized(),
        }
    }
}

/// 统计用的身份键：api_key > "METHOD path" > provider > "unknown"
fn stats_key(record: &UsageRecord) -> String {
    if !record.api_key.is_empty() {
        return record.api_key.clone();
    }
    if !record.method.is_empty() && !record.path.is_empty() {
        return format!("{} {}", record.method, record.path);
    }
    if !record.provider.is_empty() {
        return record.provider.clone();
    }
    UNKNOWN.to_string()
}

/// 计数器饱和累加
fn bump(counter: &mut u64, by: u64) {
    *counter = counter.saturating_add(by);
}

impl StatisticsSnapshot {
    /// 计入一条明细并更新所有汇总
    fn apply(&mut self, api: &str, model: &str, detail: RequestDetail) {
        let tokens = detail.tokens.total_tokens;
        let local = detail.timestamp.with_timezone(&Local);
        let day = local.format("%Y-%m-%d").to_string();
        let hour = format!("{:02}", local.hour());

        bump(&mut self.total_requests, 1);
        if detail.failed {
            bump(&mut self.failure_count, 1);
        } else {
            bump(&mut self.success_count, 1);
        }
        bump(&mut self.total_tokens, tokens);

        let api_stats = self.apis.entry(api.to_string()).or_default();
        bump(&mut api_stats.total_requests, 1);
        bump(&mut api_stats.total_tokens, tokens);
        let model_stats = api_stats.models.entry(model.to_string()).or_default();
        bump(&mut model_stats.total_requests, 1);
        bump(&mut model_stats.total_tokens, tokens);
        model_stats.details.push(detail);

        bump(self.requests_by_day.entry(day.clone()).or_default(), 1);
        bump(self.requests_by_hour.entry(hour.clone()).or_default(), 1);
        bump(self.tokens_by_day.entry(day).or_default(), tokens);
        bump(self.tokens_by_hour.entry(hour).or_default(), tokens);
    }

    fn dedup_keys(&self) -> HashSet<DedupKey> {
        let mut seen = HashSet::new();
        for (api, api_stats) in &self.apis {
            for (model, model_stats) in &api_stats.models {
                for detail in &model_stats.details {
                    seen.insert(DedupKey::new(api, model, detail));
                }
            }
        }
        seen
    }
}

/// 请求统计存储
pub struct StatisticsStore {
    inner: RwLock<StatisticsSnapshot>,
    enabled: AtomicBool,
    db: Option<Arc<Database>>,
}

impl Default for StatisticsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StatisticsSnapshot::default()),
            enabled: AtomicBool::new(true),
            db: None,
        }
    }

    /// 使用请求日志库作为快照来源
    pub fn with_database(db: Arc<Database>) -> Self {
        Self {
            db: Some(db),
            ..Self::new()
        }
    }

    pub fn database(&self) -> Option<&Arc<Database>> {
        self.db.as_ref()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn read(&self) -> RwLockReadGuard<'_, StatisticsSnapshot> {
        self.inner.read().unwrap_or_else(|e| {
            log::warn!("统计锁已毒化，使用恢复值: {e}");
            e.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, StatisticsSnapshot> {
        self.inner.write().unwrap_or_else(|e| {
            log::warn!("统计锁已毒化，使用恢复值: {e}");
            e.into_inner()
        })
    }

    /// 计入一条使用量记录，统计关闭时忽略
    pub fn record(&self, record: &UsageRecord) {
        if !self.is_enabled() {
            return;
        }
        let api = stats_key(record);
        let model = if record.model.is_empty() {
            UNKNOWN
        } else {
            record.model.as_str()
        };
        let detail = RequestDetail {
            timestamp: record.requested_at,
            source: record.source.clone(),
            auth_index: record.auth_index.clone(),
            tokens: record.detail.normalized(),
            failed: record.failed,
        };
        self.write().apply(&api, model, detail);
    }

    /// 当前统计快照；有数据库时从数据库聚合
    pub fn snapshot(&self) -> Result<StatisticsSnapshot, AppError> {
        match &self.db {
            Some(db) => snapshot_from_db(db),
            None => Ok(self.memory_snapshot()),
        }
    }

    /// 内存统计的深拷贝
    pub fn memory_snapshot(&self) -> StatisticsSnapshot {
        self.read().clone()
    }

    /// 合并导出的快照，重复明细跳过
    pub fn merge_snapshot(&self, snapshot: &StatisticsSnapshot) -> MergeResult {
        let mut result = MergeResult::default();
        let mut inner = self.write();
        let mut seen = inner.dedup_keys();

        for (api, api_snapshot) in &snapshot.apis {
            let api = api.trim();
            if api.is_empty() {
                continue;
            }
            for (model, model_snapshot) in &api_snapshot.models {
                let model = match model.trim() {
                    "" => UNKNOWN,
                    trimmed => trimmed,
                };
                for detail in &model_snapshot.details {
                    let mut detail = detail.clone();
                    detail.tokens = detail.tokens.normalized();
                    if !seen.insert(DedupKey::new(api, model, &detail)) {
                        result.skipped += 1;
                        continue;
                    }
                    inner.apply(api, model, detail);
                    result.added += 1;
                }
            }
        }

        result
    }
}

impl UsageSink for StatisticsStore {
    fn handle_usage(&self, record: &UsageRecord) {
        self.record(record);
    }
}

/// 从请求日志库聚合快照；明细不返回
fn snapshot_from_db(db: &Database) -> Result<StatisticsSnapshot, AppError> {
    let totals = db.usage_totals()?;
    let groups = db.usage_groups()?;
    let series = db.usage_series()?;

    let mut snapshot = StatisticsSnapshot {
        total_requests: totals.requests,
        success_count: totals.requests.saturating_sub(totals.failures),
        failure_count: totals.failures,
        total_tokens: totals.total_tokens,
        requests_by_day: series.requests_by_day,
        requests_by_hour: series.requests_by_hour,
        tokens_by_day: series.tokens_by_day,
        tokens_by_hour: series.tokens_by_hour,
        details_omitted: true,
        ..Default::default()
    };

    for group in groups {
        let api = snapshot.apis.entry(group.auth_index).or_default();
        api.total_requests += group.requests;
        api.total_tokens += group.total_tokens;
        api.models.insert(
            group.model,
            ModelSnapshot {
                total_requests: group.requests,
                total_tokens: group.total_tokens,
                details: Vec::new(),
            },
        );
    }

    Ok(snapshot)
}
