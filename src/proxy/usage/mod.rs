//! Proxy Usage Tracking Module
//!
//! 提供 token 使用量解析、SSE 使用量过滤、单请求上报与请求日志持久化

pub mod identity;
pub mod logger;
pub mod parser;
pub mod publisher;
pub mod reporter;
pub mod stream_filter;

pub use identity::{anonymize, resolve_usage_source, AccountInfo, AuthInfo};
pub use logger::RequestLogWriter;
pub use parser::{parse_stream_usage, parse_usage, UsageDetail, WireFormat};
pub use publisher::{UsagePublisher, UsageRecord, UsageSink};
pub use reporter::{request_span, UsageReporter};
pub use stream_filter::{CorrelationMemory, UsageFilter};
