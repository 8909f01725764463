//! 持久化存储
//!
//! SQLite 请求日志库。所有访问都通过 `Database` 上的方法完成，
//! 连接由一把互斥锁保护。

pub mod dao;
mod schema;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::AppError;

pub use dao::request_logs::{
    LogFilters, PaginatedLogs, RequestLog, UsageGroup, UsageSeries, UsageTotals,
};

/// 获取连接锁，锁中毒时转换为数据库错误
macro_rules! lock_conn {
    ($mutex:expr) => {
        $mutex
            .lock()
            .map_err(|e| $crate::error::AppError::Database(format!("获取数据库锁失败: {e}")))?
    };
}

pub(crate) use lock_conn;

pub struct Database {
    pub(crate) conn: Mutex<Connection>,
}

impl Database {
    /// 打开（或创建）指定路径的数据库文件
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| AppError::io(parent, e))?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Database(format!("打开数据库失败 {}: {e}", path.display())))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AppError::Database(format!("设置 journal_mode 失败: {e}")))?;

        log::info!("[DB] 已打开请求日志库: {}", path.display());
        Self::init(conn)
    }

    /// 内存数据库（测试使用）
    pub fn memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Database(format!("创建内存数据库失败: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, AppError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }
}
