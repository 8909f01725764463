//! 请求日志 DAO
//!
//! 单条/批量写入、分页查询、聚合统计与有序遍历（供流式导出使用）。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use crate::database::{lock_conn, Database};
use crate::error::AppError;

/// 批量写入时每批行数
pub const IMPORT_BATCH_SIZE: usize = 500;

/// 空的 auth_index / model 归一为 "unknown"，分组与排序都使用同一表达式
const API_KEY_EXPR: &str = "COALESCE(NULLIF(auth_index, ''), 'unknown')";
const MODEL_KEY_EXPR: &str = "COALESCE(NULLIF(model, ''), 'unknown')";

const SELECT_COLUMNS: &str = "id, request_id, timestamp, method, path, status_code, latency_ms,
    client_ip, model, provider, input_tokens, output_tokens, reasoning_tokens, cached_tokens,
    total_tokens, is_error, error_message, auth_index";

/// 一条持久化请求日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLog {
    #[serde(default)]
    pub id: i64,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub latency_ms: u64,
    pub client_ip: String,
    pub model: String,
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    pub total_tokens: u64,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    pub auth_index: String,
}

impl Default for RequestLog {
    fn default() -> Self {
        Self {
            id: 0,
            request_id: String::new(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            method: String::new(),
            path: String::new(),
            status_code: 0,
            latency_ms: 0,
            client_ip: String::new(),
            model: String::new(),
            provider: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            reasoning_tokens: 0,
            cached_tokens: 0,
            total_tokens: 0,
            is_error: false,
            error_message: String::new(),
            auth_index: String::new(),
        }
    }
}

impl RequestLog {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            request_id: row.get(1)?,
            timestamp: nanos_to_datetime(row.get(2)?),
            method: row.get(3)?,
            path: row.get(4)?,
            status_code: row.get::<_, i64>(5)?.clamp(0, u16::MAX as i64) as u16,
            latency_ms: to_u64(row.get(6)?),
            client_ip: row.get(7)?,
            model: row.get(8)?,
            provider: row.get(9)?,
            input_tokens: to_u64(row.get(10)?),
            output_tokens: to_u64(row.get(11)?),
            reasoning_tokens: to_u64(row.get(12)?),
            cached_tokens: to_u64(row.get(13)?),
            total_tokens: to_u64(row.get(14)?),
            is_error: row.get(15)?,
            error_message: row.get(16)?,
            auth_index: row.get(17)?,
        })
    }
}

/// 请求日志过滤器（精确匹配）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilters {
    pub model: Option<String>,
    pub status_code: Option<u16>,
}

/// 分页请求日志
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedLogs {
    pub logs: Vec<RequestLog>,
    pub total: u64,
    pub page: u32,
    pub size: u32,
}

/// 全表汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub requests: u64,
    pub failures: u64,
    pub total_tokens: u64,
}

/// 按 (auth_index, model) 分组的汇总
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageGroup {
    pub auth_index: String,
    pub model: String,
    pub requests: u64,
    pub total_tokens: u64,
}

/// 按本地日期 / 小时分桶的请求数与 token 数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSeries {
    pub requests_by_day: BTreeMap<String, u64>,
    pub requests_by_hour: BTreeMap<String, u64>,
    pub tokens_by_day: BTreeMap<String, u64>,
    pub tokens_by_hour: BTreeMap<String, u64>,
}

fn to_u64(v: i64) -> u64 {
    v.max(0) as u64
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn datetime_to_nanos(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt()
        .unwrap_or_else(|| ts.timestamp().saturating_mul(1_000_000_000))
}

fn nanos_to_datetime(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

const INSERT_SQL: &str = "INSERT INTO request_logs (
        request_id, timestamp, method, path, status_code, latency_ms, client_ip,
        model, provider, input_tokens, output_tokens, reasoning_tokens, cached_tokens,
        total_tokens, is_error, error_message, auth_index
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)";

fn insert_with(stmt: &mut rusqlite::Statement<'_>, log: &RequestLog) -> rusqlite::Result<usize> {
    stmt.execute(params![
        log.request_id,
        datetime_to_nanos(&log.timestamp),
        log.method,
        log.path,
        log.status_code as i64,
        to_i64(log.latency_ms),
        log.client_ip,
        log.model,
        log.provider,
        to_i64(log.input_tokens),
        to_i64(log.output_tokens),
        to_i64(log.reasoning_tokens),
        to_i64(log.cached_tokens),
        to_i64(log.total_tokens),
        log.is_error,
        log.error_message,
        log.auth_index,
    ])
}

impl Database {
    /// 写入单条请求日志
    pub fn insert_request_log(&self, log: &RequestLog) -> Result<(), AppError> {
        let conn = lock_conn!(self.conn);
        let mut stmt = conn
            .prepare_cached(INSERT_SQL)
            .map_err(|e| AppError::Database(format!("准备写入语句失败: {e}")))?;
        insert_with(&mut stmt, log)
            .map_err(|e| AppError::Database(format!("记录请求日志失败: {e}")))?;
        Ok(())
    }

    /// 在一个事务内批量写入，每批 `IMPORT_BATCH_SIZE` 行
    pub fn insert_request_logs(&self, logs: &[RequestLog]) -> Result<usize, AppError> {
        if logs.is_empty() {
            return Ok(0);
        }

        let mut conn = lock_conn!(self.conn);
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Database(e.to_string()))?;
        {
            let mut stmt = tx
                .prepare_cached(INSERT_SQL)
                .map_err(|e| AppError::Database(format!("准备写入语句失败: {e}")))?;
            for (batch_no, batch) in logs.chunks(IMPORT_BATCH_SIZE).enumerate() {
                for log in batch {
                    insert_with(&mut stmt, log).map_err(|e| {
                        AppError::Database(format!("批量写入第 {} 批失败: {e}", batch_no + 1))
                    })?;
                }
                log::debug!("[DB] 已写入第 {} 批，共 {} 行", batch_no + 1, batch.len());
            }
        }
        tx.commit()
            .map_err(|e| AppError::Database(format!("提交批量写入失败: {e}")))?;

        Ok(logs.len())
    }

    /// 分页查询请求日志，按时间倒序
    pub fn get_request_logs(
        &self,
        filters: &LogFilters,
        page: u32,
        size: u32,
    ) -> Result<PaginatedLogs, AppError> {
        let page = page.max(1);
        let size = size.max(1);
        let conn = lock_conn!(self.conn);

        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref model) = filters.model {
            conditions.push("model = ?");
            params.push(Box::new(model.clone()));
        }
        if let Some(status) = filters.status_code {
            conditions.push("status_code = ?");
            params.push(Box::new(status as i64));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM request_logs {where_clause}");
        let count_params: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let total: i64 = conn.query_row(&count_sql, count_params.as_slice(), |row| row.get(0))?;

        let offset = (page as i64 - 1) * size as i64;
        params.push(Box::new(size as i64));
        params.push(Box::new(offset));

        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM request_logs
             {where_clause}
             ORDER BY timestamp DESC, id DESC
             LIMIT ? OFFSET ?"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), RequestLog::from_row)?;

        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?);
        }

        Ok(PaginatedLogs {
            logs,
            total: to_u64(total),
            page,
            size,
        })
    }

    /// 全表请求数、失败数与 token 总量
    pub fn usage_totals(&self) -> Result<UsageTotals, AppError> {
        let conn = lock_conn!(self.conn);
        let (requests, failures, tokens): (i64, i64, i64) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN is_error THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(total_tokens), 0)
                 FROM request_logs",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|e| AppError::Database(format!("查询使用量汇总失败: {e}")))?;

        Ok(UsageTotals {
            requests: to_u64(requests),
            failures: to_u64(failures),
            total_tokens: to_u64(tokens),
        })
    }

    /// 按 (auth_index, model) 分组汇总
    pub fn usage_groups(&self) -> Result<Vec<UsageGroup>, AppError> {
        let conn = lock_conn!(self.conn);
        let sql = format!(
            "SELECT {API_KEY_EXPR} AS api, {MODEL_KEY_EXPR} AS mdl,
                    COUNT(*), COALESCE(SUM(total_tokens), 0)
             FROM request_logs
             GROUP BY api, mdl
             ORDER BY api, mdl"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(UsageGroup {
                auth_index: row.get(0)?,
                model: row.get(1)?,
                requests: to_u64(row.get(2)?),
                total_tokens: to_u64(row.get(3)?),
            })
        })?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    /// 按本地日期（YYYY-MM-DD）与小时（00-23）分桶
    pub fn usage_series(&self) -> Result<UsageSeries, AppError> {
        let conn = lock_conn!(self.conn);
        let mut series = UsageSeries::default();

        let mut by_day = conn.prepare(
            "SELECT strftime('%Y-%m-%d', timestamp / 1000000000, 'unixepoch', 'localtime') AS bucket,
                    COUNT(*), COALESCE(SUM(total_tokens), 0)
             FROM request_logs
             GROUP BY bucket",
        )?;
        let rows = by_day.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;
        for row in rows {
            let (day, requests, tokens) = row?;
            series.requests_by_day.insert(day.clone(), to_u64(requests));
            series.tokens_by_day.insert(day, to_u64(tokens));
        }

        let mut by_hour = conn.prepare(
            "SELECT strftime('%H', timestamp / 1000000000, 'unixepoch', 'localtime') AS bucket,
                    COUNT(*), COALESCE(SUM(total_tokens), 0)
             FROM request_logs
             GROUP BY bucket",
        )?;
        let rows = by_hour.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;
        for row in rows {
            let (hour, requests, tokens) = row?;
            series.requests_by_hour.insert(hour.clone(), to_u64(requests));
            series.tokens_by_hour.insert(hour, to_u64(tokens));
        }

        Ok(series)
    }

    /// 按 (auth_index, model, timestamp) 顺序逐行遍历
    ///
    /// 空 auth_index / model 已归一为 "unknown"。回调返回错误时停止遍历。
    pub fn for_each_request_log_ordered<F>(&self, mut f: F) -> Result<u64, AppError>
    where
        F: FnMut(RequestLog) -> Result<(), AppError>,
    {
        let conn = lock_conn!(self.conn);
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM request_logs
             ORDER BY {API_KEY_EXPR} ASC, {MODEL_KEY_EXPR} ASC, timestamp ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;

        let mut visited = 0u64;
        while let Some(row) = rows.next()? {
            let mut log = RequestLog::from_row(row)?;
            if log.auth_index.is_empty() {
                log.auth_index = "unknown".to_string();
            }
            if log.model.is_empty() {
                log.model = "unknown".to_string();
            }
            f(log)?;
            visited += 1;
        }
        Ok(visited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn log_at(secs: i64, auth_index: &str, model: &str, tokens: u64, failed: bool) -> RequestLog {
        RequestLog {
            request_id: format!("{secs}-test"),
            timestamp: Utc.timestamp_opt(secs, 0).single().expect("valid ts"),
            model: model.to_string(),
            provider: "openai".to_string(),
            input_tokens: tokens / 2,
            output_tokens: tokens - tokens / 2,
            total_tokens: tokens,
            is_error: failed,
            status_code: if failed { 500 } else { 200 },
            auth_index: auth_index.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn insert_and_page_logs() -> Result<(), AppError> {
        let db = Database::memory()?;
        for i in 0..25 {
            db.insert_request_log(&log_at(1_700_000_000 + i, "0", "gpt-4o", 10, false))?;
        }
        db.insert_request_log(&log_at(1_700_000_100, "1", "claude", 5, true))?;

        let page1 = db.get_request_logs(&LogFilters::default(), 1, 20)?;
        assert_eq!(page1.total, 26);
        assert_eq!(page1.logs.len(), 20);
        // 最新的在前
        assert_eq!(page1.logs[0].model, "claude");

        let page2 = db.get_request_logs(&LogFilters::default(), 2, 20)?;
        assert_eq!(page2.logs.len(), 6);

        let filtered = db.get_request_logs(
            &LogFilters {
                model: Some("gpt-4o".into()),
                status_code: Some(200),
            },
            1,
            100,
        )?;
        assert_eq!(filtered.total, 25);

        let none = db.get_request_logs(
            &LogFilters {
                model: Some("gpt".into()),
                status_code: None,
            },
            1,
            20,
        )?;
        assert_eq!(none.total, 0);
        Ok(())
    }

    #[test]
    fn round_trips_timestamp_with_nanos() -> Result<(), AppError> {
        let db = Database::memory()?;
        let ts = Utc
            .timestamp_opt(1_700_000_000, 123_456_789)
            .single()
            .expect("valid ts");
        db.insert_request_log(&RequestLog {
            timestamp: ts,
            reasoning_tokens: 7,
            cached_tokens: 3,
            ..log_at(0, "k", "m", 10, false)
        })?;
        let page = db.get_request_logs(&LogFilters::default(), 1, 20)?;
        assert_eq!(page.logs[0].timestamp, ts);
        assert_eq!(page.logs[0].reasoning_tokens, 7);
        assert_eq!(page.logs[0].cached_tokens, 3);
        Ok(())
    }

    #[test]
    fn batch_insert_spans_multiple_batches() -> Result<(), AppError> {
        let db = Database::memory()?;
        let logs: Vec<_> = (0..(IMPORT_BATCH_SIZE as i64 + 20))
            .map(|i| log_at(1_700_000_000 + i, "a", "m", 1, false))
            .collect();
        let written = db.insert_request_logs(&logs)?;
        assert_eq!(written, IMPORT_BATCH_SIZE + 20);
        assert_eq!(db.usage_totals()?.requests, (IMPORT_BATCH_SIZE + 20) as u64);
        assert_eq!(db.insert_request_logs(&[])?, 0);
        Ok(())
    }

    #[test]
    fn totals_and_groups() -> Result<(), AppError> {
        let db = Database::memory()?;
        assert_eq!(db.usage_totals()?, UsageTotals::default());

        db.insert_request_log(&log_at(1_700_000_000, "0", "gpt", 10, false))?;
        db.insert_request_log(&log_at(1_700_000_001, "0", "gpt", 20, false))?;
        db.insert_request_log(&log_at(1_700_000_002, "", "", 30, false))?;
        db.insert_request_log(&log_at(1_700_000_003, "unknown", "", 0, true))?;

        let totals = db.usage_totals()?;
        assert_eq!(
            totals,
            UsageTotals {
                requests: 4,
                failures: 1,
                total_tokens: 60
            }
        );

        let groups = db.usage_groups()?;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].auth_index, "0");
        assert_eq!(groups[0].requests, 2);
        assert_eq!(groups[1].auth_index, "unknown");
        assert_eq!(groups[1].model, "unknown");
        assert_eq!(groups[1].requests, 2);
        assert_eq!(groups[1].total_tokens, 30);
        Ok(())
    }

    #[test]
    fn series_buckets_match_local_time() -> Result<(), AppError> {
        let db = Database::memory()?;
        let log = log_at(1_700_000_000, "0", "gpt", 10, false);
        let local = log.timestamp.with_timezone(&chrono::Local);
        db.insert_request_log(&log)?;
        db.insert_request_log(&log_at(1_700_000_000, "1", "gpt", 5, false))?;

        let series = db.usage_series()?;
        let day = local.format("%Y-%m-%d").to_string();
        let hour = local.format("%H").to_string();
        assert_eq!(series.requests_by_day.get(&day), Some(&2));
        assert_eq!(series.tokens_by_day.get(&day), Some(&15));
        assert_eq!(series.requests_by_hour.get(&hour), Some(&2));
        assert_eq!(series.tokens_by_hour.get(&hour), Some(&15));
        Ok(())
    }

    #[test]
    fn ordered_iteration_groups_rows() -> Result<(), AppError> {
        let db = Database::memory()?;
        db.insert_request_log(&log_at(3, "b", "m1", 1, false))?;
        db.insert_request_log(&log_at(1, "a", "m2", 1, false))?;
        db.insert_request_log(&log_at(2, "a", "m1", 1, false))?;
        db.insert_request_log(&log_at(0, "a", "m1", 1, false))?;

        let mut seen = Vec::new();
        let visited = db.for_each_request_log_ordered(|log| {
            seen.push((log.auth_index, log.model, log.timestamp.timestamp()));
            Ok(())
        })?;
        assert_eq!(visited, 4);
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), "m1".to_string(), 0),
                ("a".to_string(), "m1".to_string(), 2),
                ("a".to_string(), "m2".to_string(), 1),
                ("b".to_string(), "m1".to_string(), 3),
            ]
        );
        Ok(())
    }
}
