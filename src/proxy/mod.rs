//! 代理使用量模块
//!
//! 上游响应的透传处理与使用量采集

pub mod log_codes;
pub mod response_processor;
pub mod usage;

pub use response_processor::{create_usage_stream, is_sse_response, process_body};
