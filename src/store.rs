//! 使用量管道运行时
//!
//! 根据配置装配请求日志库、统计存储、记录分发器与 SSE 过滤器。

use std::sync::Arc;

use axum::Router;

use crate::config::UsageConfig;
use crate::database::Database;
use crate::error::AppError;
use crate::management::{self, ManagementState};
use crate::proxy::log_codes::cfg;
use crate::proxy::response_processor::{StreamTimeouts, UsageStreamContext};
use crate::proxy::usage::{
    AuthInfo, RequestLogWriter, UsageFilter, UsagePublisher, UsageReporter, WireFormat,
};
use crate::services::usage_stats::StatisticsStore;

/// 全局使用量运行时
pub struct UsageRuntime {
    pub db: Option<Arc<Database>>,
    pub stats: Arc<StatisticsStore>,
    pub request_logs: Option<Arc<RequestLogWriter>>,
    pub publisher: Arc<UsagePublisher>,
    pub filter: Arc<UsageFilter>,
    request_log_enabled: bool,
}

impl UsageRuntime {
    /// 按配置创建运行时；数据库驱动不受支持时直接返回配置错误
    pub fn new(config: &UsageConfig) -> Result<Self, AppError> {
        let db = match &config.database {
            Some(db_config) => {
                let driver = db_config.driver().inspect_err(|e| {
                    log::error!("[{}] {e}", cfg::INVALID_DRIVER);
                })?;
                let path = db_config.resolve_path()?;
                let db = Database::open(&path)?;
                log::info!(
                    "[{}] 请求日志库已就绪: driver={driver:?}, path={}, request_log={}",
                    cfg::DATABASE_OPENED,
                    path.display(),
                    config.request_log_active()
                );
                Some(Arc::new(db))
            }
            None => None,
        };
        Ok(Self::assemble(config, db))
    }

    /// 使用已打开的数据库创建运行时
    pub fn with_database(config: &UsageConfig, db: Arc<Database>) -> Self {
        Self::assemble(config, Some(db))
    }

    fn assemble(config: &UsageConfig, db: Option<Arc<Database>>) -> Self {
        let stats = Arc::new(match &db {
            Some(db) => StatisticsStore::with_database(db.clone()),
            None => StatisticsStore::new(),
        });
        stats.set_enabled(config.statistics_enabled);

        let request_logs = db.as_ref().map(|db| {
            Arc::new(RequestLogWriter::new(
                db.clone(),
                config.request_log_enabled && config.statistics_enabled,
            ))
        });

        let mut publisher = UsagePublisher::new();
        publisher.register(stats.clone());
        if let Some(writer) = &request_logs {
            publisher.register(writer.clone());
        }

        Self {
            db,
            stats,
            request_logs,
            publisher: Arc::new(publisher),
            filter: Arc::new(UsageFilter::new()),
            request_log_enabled: config.request_log_enabled,
        }
    }

    /// 统计开关同时控制请求日志写入
    pub fn set_statistics_enabled(&self, enabled: bool) {
        self.stats.set_enabled(enabled);
        if let Some(writer) = &self.request_logs {
            writer.set_enabled(enabled && self.request_log_enabled);
        }
    }

    /// 为一次上游请求创建 reporter
    pub fn reporter(
        &self,
        provider: &str,
        model: &str,
        auth: Option<&AuthInfo>,
        caller_api_key: &str,
    ) -> UsageReporter {
        UsageReporter::new(self.publisher.clone(), provider, model, auth, caller_api_key)
    }

    /// 流式透传上下文
    pub fn stream_context(
        &self,
        reporter: Arc<UsageReporter>,
        format: WireFormat,
        timeouts: StreamTimeouts,
    ) -> UsageStreamContext {
        UsageStreamContext {
            reporter,
            filter: self.filter.clone(),
            format,
            timeouts,
        }
    }

    /// 管理接口路由
    pub fn management_router(&self) -> Router {
        management::router(ManagementState::new(self.stats.clone()))
    }
}
