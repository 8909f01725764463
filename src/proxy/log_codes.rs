//! 使用量管道日志码定义
//!
//! 格式: [模块-编号] 消息
//! - USG: Usage (使用量发布)
//! - FLT: Filter (SSE 使用量过滤)
//! - RSP: Response (响应处理)
//! - EXP: Export/Import (导出导入)
//! - CFG: Config (配置)

/// 使用量日志码
pub mod usg {
    pub const LOG_FAILED: &str = "USG-001";
    pub const PUBLISHED: &str = "USG-002";
    pub const DUPLICATE_PUBLISH: &str = "USG-003";
    pub const CANCELLED: &str = "USG-004";
}

/// 过滤器日志码
pub mod flt {
    pub const STOP_WITHOUT_USAGE: &str = "FLT-001";
    pub const USAGE_RENAMED: &str = "FLT-002";
    pub const CORRELATED_USAGE: &str = "FLT-003";
}

/// 响应处理日志码
pub mod rsp {
    pub const READ_BODY_ERROR: &str = "RSP-001";
    pub const BUILD_RESPONSE_ERROR: &str = "RSP-002";
    pub const STREAM_TIMEOUT: &str = "RSP-003";
    pub const STREAM_ERROR: &str = "RSP-004";
}

/// 导出导入日志码
pub mod exp {
    pub const EXPORT_FAILED: &str = "EXP-001";
    pub const IMPORT_FAILED: &str = "EXP-002";
    pub const IMPORTED: &str = "EXP-003";
    pub const EXPORTED: &str = "EXP-004";
}

/// 配置日志码
pub mod cfg {
    pub const INVALID_DRIVER: &str = "CFG-001";
    pub const DATABASE_OPENED: &str = "CFG-002";
}
