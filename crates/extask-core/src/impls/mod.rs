//! Impls - TaskApiPort の実装
//!
//! # 含まれる実装
//! - **HttpTaskApi**: engine への HTTP accessor（本番用）
//! - **InMemoryTaskApi**: 呼び出しを記録する fake engine（テスト・`--dry-run` 用）

pub mod http;
pub mod memory;

// 主要な型を再エクスポート
pub use self::http::HttpTaskApi;
pub use self::memory::{ApiCall, InMemoryTaskApi, Operation, RecordedCall};
