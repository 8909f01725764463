pub mod usage_export;
pub mod usage_stats;

pub use usage_export::{export_usage, import_usage, ExportEnvelope, ImportOutcome};
pub use usage_stats::{
    ApiSnapshot, MergeResult, ModelSnapshot, RequestDetail, StatisticsSnapshot, StatisticsStore,
};
