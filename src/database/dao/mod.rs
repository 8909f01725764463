//! 数据访问层
//!
//! 请求日志的读写与聚合查询

pub mod request_logs;
