//! 使用量管道配置
//!
//! 从 TOML 读取统计开关与持久化存储设置。

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

const DEFAULT_DB_FILE: &str = "usage.db";

fn default_true() -> bool {
    true
}

/// 持久化存储驱动
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseDriver {
    Sqlite,
}

/// `[database]` 配置段
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl DatabaseConfig {
    /// 解析驱动名称，未知或不支持的驱动直接报错，不做替换
    pub fn driver(&self) -> Result<DatabaseDriver, AppError> {
        match self.driver.trim().to_ascii_lowercase().as_str() {
            "" | "sqlite" | "sqlite3" => Ok(DatabaseDriver::Sqlite),
            "mysql" | "postgres" | "postgresql" => Err(AppError::Config(format!(
                "不支持的数据库驱动: {}",
                self.driver
            ))),
            other => Err(AppError::Config(format!("未知的数据库驱动: {other}"))),
        }
    }

    /// 解析 SQLite 数据库文件路径
    ///
    /// `dsn` 优先；否则使用 `log_dir/usage.db`。
    pub fn resolve_path(&self) -> Result<PathBuf, AppError> {
        if let Some(dsn) = self.dsn.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let path = dsn.strip_prefix("file:").unwrap_or(dsn);
            return Ok(PathBuf::from(path));
        }
        match &self.log_dir {
            Some(dir) if !dir.as_os_str().is_empty() => Ok(dir.join(DEFAULT_DB_FILE)),
            _ => Err(AppError::Config(
                "数据库配置缺少 dsn 或 log_dir".to_string(),
            )),
        }
    }
}

/// 使用量管道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    /// 是否写入持久化请求日志
    #[serde(default)]
    pub request_log_enabled: bool,
    /// 是否启用内存统计
    #[serde(default = "default_true")]
    pub statistics_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            request_log_enabled: false,
            statistics_enabled: true,
            database: None,
        }
    }
}

impl UsageConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, AppError> {
        toml::from_str(content).map_err(|e| AppError::Config(format!("解析配置失败: {e}")))
    }

    /// 从文件加载配置，文件不存在时返回默认配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("[CFG] 配置文件不存在，使用默认配置: {}", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| AppError::io(path, e))?;
        Self::from_toml_str(&content)
    }

    /// 是否写入请求日志（需同时配置数据库）
    pub fn request_log_active(&self) -> bool {
        self.request_log_enabled && self.database.is_some()
    }
}
