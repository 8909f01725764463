//! 管理接口处理器

use std::io::{BufWriter, Write};

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Local;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::ManagementState;
use crate::database::LogFilters;
use crate::error::AppError;
use crate::proxy::log_codes::exp;
use crate::services::usage_export::{self, export_file_name};

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;
const EXPORT_CHUNK_SIZE: usize = 16 * 1024;

/// 在阻塞线程池上执行 SQLite 查询等同步操作
async fn run_blocking<T, F>(task: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| AppError::Message(format!("后台任务失败: {e}")))?
}

/// GET /v0/management/usage
pub async fn get_usage(State(state): State<ManagementState>) -> Result<Json<Value>, AppError> {
    let stats = state.stats.clone();
    let snapshot = run_blocking(move || stats.snapshot()).await?;
    let failed_requests = snapshot.failure_count;
    Ok(Json(json!({
        "usage": snapshot,
        "failed_requests": failed_requests,
    })))
}

/// 把阻塞写入转换为响应体分块
struct ChannelWriter {
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "导出连接已关闭")
            })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// GET /v0/management/usage/export
pub async fn export_usage(State(state): State<ManagementState>) -> Response {
    let filename = export_file_name(Local::now());
    let (tx, mut rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);

    let stats = state.stats.clone();
    let error_tx = tx.clone();
    tokio::task::spawn_blocking(move || {
        let mut writer = BufWriter::with_capacity(EXPORT_CHUNK_SIZE, ChannelWriter { tx });
        let result = usage_export::export_usage(&stats, &mut writer)
            .and_then(|_| writer.flush().map_err(AppError::from));
        if let Err(e) = result {
            log::warn!("[{}] 导出使用统计失败: {e}", exp::EXPORT_FAILED);
            let _ = error_tx.blocking_send(Err(std::io::Error::other(e.to_string())));
        }
    });

    let stream = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield chunk;
        }
    };

    let disposition = format!("attachment; filename={filename}");
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(Body::from_stream(stream))
    {
        Ok(resp) => resp,
        Err(e) => AppError::Message(format!("构建导出响应失败: {e}")).into_response(),
    }
}

/// POST /v0/management/usage/import
pub async fn import_usage(
    State(state): State<ManagementState>,
    body: Bytes,
) -> Result<Json<usage_export::ImportOutcome>, AppError> {
    let stats = state.stats.clone();
    match run_blocking(move || usage_export::import_usage(&stats, &body)).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e @ AppError::InvalidInput(_)) => Err(e),
        Err(e) => {
            log::error!("[{}] 导入使用统计失败: {e}", exp::IMPORT_FAILED);
            Err(AppError::Message("failed to import usage".to_string()))
        }
    }
}

/// 日志查询参数，非法数值回退为默认值
#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub page: Option<String>,
    pub size: Option<String>,
    pub model: Option<String>,
    pub status: Option<String>,
}

impl LogQuery {
    fn page(&self) -> u32 {
        self.page
            .as_deref()
            .and_then(|p| p.trim().parse::<u32>().ok())
            .filter(|p| *p > 0)
            .unwrap_or(1)
    }

    fn size(&self) -> u32 {
        self.size
            .as_deref()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .filter(|s| (1..=MAX_PAGE_SIZE).contains(s))
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }

    fn filters(&self) -> LogFilters {
        LogFilters {
            model: self.model.clone().filter(|m| !m.is_empty()),
            status_code: self
                .status
                .as_deref()
                .and_then(|s| s.trim().parse::<u16>().ok()),
        }
    }
}

/// GET /v0/management/logs
pub async fn get_logs(
    State(state): State<ManagementState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Value>, AppError> {
    let Some(db) = state.stats.database() else {
        return Ok(Json(json!({
            "logs": [],
            "total": 0,
            "page": 1,
            "size": DEFAULT_PAGE_SIZE,
            "error": "database not initialized",
        })));
    };

    let db = db.clone();
    let page = run_blocking(move || {
        db.get_request_logs(&query.filters(), query.page(), query.size())
    })
    .await?;
    Ok(Json(serde_json::to_value(page)?))
}
