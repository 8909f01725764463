//! 多供应商 LLM 网关的使用量遥测管道
//!
//! token 用量解析、SSE 使用量过滤、单请求上报、统计聚合与导出/导入。

pub mod config;
pub mod database;
pub mod error;
pub mod management;
pub mod proxy;
pub mod services;
mod store;

pub use config::{DatabaseConfig, UsageConfig};
pub use database::Database;
pub use error::AppError;
pub use proxy::usage::{
    AuthInfo, CorrelationMemory, UsageDetail, UsageFilter, UsagePublisher, UsageRecord,
    UsageReporter, UsageSink, WireFormat,
};
pub use services::{StatisticsSnapshot, StatisticsStore};
pub use store::UsageRuntime;
