//! Schema 定义
//!
//! 建表、补齐旧库缺失的列、建索引。补列必须在建索引之前完成，
//! 否则旧库上的索引语句会因列不存在而失败。

use super::{lock_conn, Database};
use crate::error::AppError;
use rusqlite::Connection;

/// request_logs 的列定义（id 除外）
///
/// `timestamp` 存储 UTC Unix 纳秒。所有列都带默认值，旧库补列时可直接 ALTER。
const REQUEST_LOG_COLUMNS: &[(&str, &str)] = &[
    ("request_id", "TEXT NOT NULL DEFAULT ''"),
    ("timestamp", "INTEGER NOT NULL DEFAULT 0"),
    ("method", "TEXT NOT NULL DEFAULT ''"),
    ("path", "TEXT NOT NULL DEFAULT ''"),
    ("status_code", "INTEGER NOT NULL DEFAULT 0"),
    ("latency_ms", "INTEGER NOT NULL DEFAULT 0"),
    ("client_ip", "TEXT NOT NULL DEFAULT ''"),
    ("model", "TEXT NOT NULL DEFAULT ''"),
    ("provider", "TEXT NOT NULL DEFAULT ''"),
    ("input_tokens", "INTEGER NOT NULL DEFAULT 0"),
    ("output_tokens", "INTEGER NOT NULL DEFAULT 0"),
    ("reasoning_tokens", "INTEGER NOT NULL DEFAULT 0"),
    ("cached_tokens", "INTEGER NOT NULL DEFAULT 0"),
    ("total_tokens", "INTEGER NOT NULL DEFAULT 0"),
    ("is_error", "BOOLEAN NOT NULL DEFAULT 0"),
    ("error_message", "TEXT NOT NULL DEFAULT ''"),
    ("auth_index", "TEXT NOT NULL DEFAULT ''"),
];

const REQUEST_LOG_INDEXES: &[(&str, &str)] = &[
    ("idx_request_logs_request_id", "request_id"),
    ("idx_request_logs_timestamp", "timestamp"),
    ("idx_request_logs_status", "status_code"),
    ("idx_request_logs_model", "model"),
    ("idx_request_logs_is_error", "is_error"),
];

impl Database {
    /// 建表、补列、建索引
    pub(crate) fn ensure_schema(&self) -> Result<(), AppError> {
        let conn = lock_conn!(self.conn);
        Self::ensure_schema_on_conn(&conn)
    }

    fn ensure_schema_on_conn(conn: &Connection) -> Result<(), AppError> {
        let columns: Vec<String> = REQUEST_LOG_COLUMNS
            .iter()
            .map(|(name, definition)| format!("{name} {definition}"))
            .collect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                {}
            )",
            columns.join(",\n                ")
        );
        conn.execute(&sql, [])
            .map_err(|e| AppError::Database(format!("创建 request_logs 表失败: {e}")))?;

        let existing = Self::column_names(conn, "request_logs")?;
        for (name, definition) in REQUEST_LOG_COLUMNS {
            if existing.iter().any(|c| c.eq_ignore_ascii_case(name)) {
                continue;
            }
            conn.execute(
                &format!("ALTER TABLE request_logs ADD COLUMN {name} {definition}"),
                [],
            )
            .map_err(|e| AppError::Database(format!("为 request_logs 添加列 {name} 失败: {e}")))?;
            log::info!("[DB] 已为旧版 request_logs 补齐列 {name}");
        }

        for (index, column) in REQUEST_LOG_INDEXES {
            conn.execute(
                &format!("CREATE INDEX IF NOT EXISTS {index} ON request_logs({column})"),
                [],
            )
            .map_err(|e| AppError::Database(format!("创建索引失败: {e}")))?;
        }

        Ok(())
    }

    fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>, AppError> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .map_err(|e| AppError::Database(format!("读取表结构失败: {e}")))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| AppError::Database(format!("查询表结构失败: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::Database(format!("读取列名失败: {e}")))?;
        Ok(names)
    }
}
