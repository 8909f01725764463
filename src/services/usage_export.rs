//! 使用统计导出/导入
//!
//! 导出格式: `{"version":1,"exported_at":RFC3339,"usage":StatisticsSnapshot}`。
//! 配置了请求日志库时按 (auth_index, model, timestamp) 顺序逐行写出，不在内存中构建完整快照。

use std::io::Write;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use super::usage_stats::{RequestDetail, StatisticsSnapshot, StatisticsStore};
use crate::database::{Database, RequestLog};
use crate::error::AppError;
use crate::proxy::log_codes::exp;
use crate::proxy::usage::parser::UsageDetail;

/// 当前导出格式版本
pub const EXPORT_VERSION: u32 = 1;

/// 导入负载无法解析或版本不支持时的错误信息
pub const INVALID_IMPORT_MESSAGE: &str = "invalid json or unsupported version";

/// 导出信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportEnvelope {
    #[serde(default)]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub usage: StatisticsSnapshot,
}

impl ExportEnvelope {
    pub fn new(usage: StatisticsSnapshot) -> Self {
        Self {
            version: EXPORT_VERSION,
            exported_at: Utc::now(),
            usage,
        }
    }
}

/// 导入结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub added: u64,
    pub skipped: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    /// 写入数据库时不做去重
    pub deduplicated: bool,
}

/// 附件文件名 `usage_export_YYYYMMDD_HHMMSS.json`
pub fn export_file_name(now: DateTime<Local>) -> String {
    format!("usage_export_{}.json", now.format("%Y%m%d_%H%M%S"))
}

/// 导出统计数据到 writer
pub fn export_usage<W: Write>(store: &StatisticsStore, out: W) -> Result<(), AppError> {
    match store.database() {
        Some(db) => write_database_export(db, out).map(|_| ()),
        None => {
            let envelope = ExportEnvelope::new(store.memory_snapshot());
            serde_json::to_writer(out, &envelope)?;
            Ok(())
        }
    }
}

/// 解析导入负载；版本缺省 (0) 或 1 可接受
pub fn parse_envelope(bytes: &[u8]) -> Result<ExportEnvelope, AppError> {
    let envelope: ExportEnvelope = serde_json::from_slice(bytes).map_err(|e| {
        log::warn!("[{}] 导入负载解析失败: {e}", exp::IMPORT_FAILED);
        AppError::InvalidInput(INVALID_IMPORT_MESSAGE.to_string())
    })?;
    if envelope.version > EXPORT_VERSION {
        log::warn!(
            "[{}] 不支持的导入版本: {}",
            exp::IMPORT_FAILED,
            envelope.version
        );
        return Err(AppError::InvalidInput(INVALID_IMPORT_MESSAGE.to_string()));
    }
    Ok(envelope)
}

/// 导入统计数据
///
/// 有数据库时批量写入且不去重；否则合并到内存统计。
pub fn import_usage(store: &StatisticsStore, bytes: &[u8]) -> Result<ImportOutcome, AppError> {
    let envelope = parse_envelope(bytes)?;

    let outcome = match store.database() {
        Some(db) => {
            let logs = snapshot_to_logs(&envelope.usage);
            let added = db.insert_request_logs(&logs)? as u64;
            let snapshot = store.snapshot()?;
            ImportOutcome {
                added,
                skipped: 0,
                total_requests: snapshot.total_requests,
                failed_requests: snapshot.failure_count,
                deduplicated: false,
            }
        }
        None => {
            let merged = store.merge_snapshot(&envelope.usage);
            let snapshot = store.memory_snapshot();
            ImportOutcome {
                added: merged.added,
                skipped: merged.skipped,
                total_requests: snapshot.total_requests,
                failed_requests: snapshot.failure_count,
                deduplicated: true,
            }
        }
    };

    log::info!(
        "[{}] 导入完成: added={}, skipped={}, total={}",
        exp::IMPORTED,
        outcome.added,
        outcome.skipped,
        outcome.total_requests
    );
    Ok(outcome)
}

/// 快照明细展开为请求日志行；auth_index 为空时使用调用方键
fn snapshot_to_logs(snapshot: &StatisticsSnapshot) -> Vec<RequestLog> {
    let mut logs = Vec::new();
    for (api, api_snapshot) in &snapshot.apis {
        for (model, model_snapshot) in &api_snapshot.models {
            for detail in &model_snapshot.details {
                let tokens = detail.tokens.normalized();
                let auth_index = if detail.auth_index.is_empty() {
                    api.clone()
                } else {
                    detail.auth_index.clone()
                };
                logs.push(RequestLog {
                    timestamp: detail.timestamp,
                    provider: detail.source.clone(),
                    model: model.clone(),
                    auth_index,
                    input_tokens: tokens.input_tokens,
                    output_tokens: tokens.output_tokens,
                    reasoning_tokens: tokens.reasoning_tokens,
                    cached_tokens: tokens.cached_tokens,
                    total_tokens: tokens.total_tokens,
                    is_error: detail.failed,
                    ..Default::default()
                });
            }
        }
    }
    logs
}

// ============================================================================
// 数据库流式导出
// ============================================================================

fn json_str(value: &str) -> Result<String, AppError> {
    Ok(serde_json::to_string(value)?)
}

/// 按分组键变化打开/关闭 JSON 对象作用域
#[derive(Default)]
struct GroupWriter {
    api: Option<String>,
    model: Option<String>,
    apis_written: u64,
    models_written: u64,
    details_written: u64,
    api_requests: u64,
    api_tokens: u64,
    model_requests: u64,
    model_tokens: u64,
}

impl GroupWriter {
    fn push<W: Write>(&mut self, out: &mut W, log: RequestLog) -> Result<(), AppError> {
        if self.api.as_deref() != Some(log.auth_index.as_str()) {
            self.close_api(out)?;
            if self.apis_written > 0 {
                out.write_all(b",")?;
            }
            write!(out, "{}:{{\"models\":{{", json_str(&log.auth_index)?)?;
            self.api = Some(log.auth_index.clone());
            self.apis_written += 1;
            self.models_written = 0;
        }

        if self.model.as_deref() != Some(log.model.as_str()) {
            self.close_model(out)?;
            if self.models_written > 0 {
                out.write_all(b",")?;
            }
            write!(out, "{}:{{\"details\":[", json_str(&log.model)?)?;
            self.model = Some(log.model.clone());
            self.models_written += 1;
            self.details_written = 0;
        }

        if self.details_written > 0 {
            out.write_all(b",")?;
        }
        let detail = RequestDetail {
            timestamp: log.timestamp,
            source: log.provider,
            auth_index: log.auth_index,
            tokens: UsageDetail {
                input_tokens: log.input_tokens,
                output_tokens: log.output_tokens,
                reasoning_tokens: log.reasoning_tokens,
                cached_tokens: log.cached_tokens,
                total_tokens: log.total_tokens,
            },
            failed: log.is_error,
        };
        serde_json::to_writer(&mut *out, &detail)?;
        self.details_written += 1;
        self.model_requests += 1;
        self.model_tokens += log.total_tokens;
        Ok(())
    }

    fn close_model<W: Write>(&mut self, out: &mut W) -> Result<(), AppError> {
        if self.model.take().is_some() {
            write!(
                out,
                "],\"total_requests\":{},\"total_tokens\":{}}}",
                self.model_requests, self.model_tokens
            )?;
            self.api_requests += self.model_requests;
            self.api_tokens += self.model_tokens;
            self.model_requests = 0;
            self.model_tokens = 0;
        }
        Ok(())
    }

    fn close_api<W: Write>(&mut self, out: &mut W) -> Result<(), AppError> {
        self.close_model(out)?;
        if self.api.take().is_some() {
            write!(
                out,
                "}},\"total_requests\":{},\"total_tokens\":{}}}",
                self.api_requests, self.api_tokens
            )?;
            self.api_requests = 0;
            self.api_tokens = 0;
        }
        Ok(())
    }
}

/// 从请求日志库流式写出导出文档，返回写出的明细行数
pub fn write_database_export<W: Write>(db: &Database, mut out: W) -> Result<u64, AppError> {
    let totals = db.usage_totals()?;
    let series = db.usage_series()?;

    write!(
        out,
        "{{\"version\":{EXPORT_VERSION},\"exported_at\":{},\"usage\":{{",
        json_str(&Utc::now().to_rfc3339())?
    )?;
    write!(
        out,
        "\"total_requests\":{},\"success_count\":{},\"failure_count\":{},\"total_tokens\":{},\"apis\":{{",
        totals.requests,
        totals.requests.saturating_sub(totals.failures),
        totals.failures,
        totals.total_tokens
    )?;

    let mut groups = GroupWriter::default();
    let rows = db.for_each_request_log_ordered(|log| groups.push(&mut out, log))?;
    groups.close_api(&mut out)?;
    out.write_all(b"}")?;

    for (name, buckets) in [
        ("requests_by_day", &series.requests_by_day),
        ("requests_by_hour", &series.requests_by_hour),
        ("tokens_by_day", &series.tokens_by_day),
        ("tokens_by_hour", &series.tokens_by_hour),
    ] {
        write!(out, ",\"{name}\":")?;
        serde_json::to_writer(&mut out, buckets)?;
    }
    out.write_all(b"}}")?;
    out.flush()?;

    log::debug!("[{}] 数据库导出完成，共 {rows} 行", exp::EXPORTED);
    Ok(rows)
}
