//! 管理接口
//!
//! 使用统计查询、导出/导入与请求日志分页查询

mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::services::usage_stats::StatisticsStore;

/// 管理接口共享状态
#[derive(Clone)]
pub struct ManagementState {
    pub stats: Arc<StatisticsStore>,
}

impl ManagementState {
    pub fn new(stats: Arc<StatisticsStore>) -> Self {
        Self { stats }
    }
}

/// 构建管理路由
pub fn router(state: ManagementState) -> Router {
    Router::new()
        .route("/v0/management/usage", get(handlers::get_usage))
        .route("/v0/management/usage/export", get(handlers::export_usage))
        .route("/v0/management/usage/import", post(handlers::import_usage))
        .route("/v0/management/logs", get(handlers::get_logs))
        .with_state(state)
}
