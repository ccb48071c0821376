//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてワーカーの振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **WorkerBuilder / ExternalTaskWorker / WorkerHandle**: 表層 API（構築・起動・停止）
//! - **PollLoop**: fetch → dispatch-all → wait-all の繰り返し
//! - **TaskDispatcher**: 1 タスク分の handler 実行と report
//! - **LockRenewer**: 処理中タスクの lock 延長
//! - **report**: TaskResult → report 呼び出しの対応付け（有限回リトライ付き）
//! - **WorkerConfig**: タイミング設定

pub mod builder;
pub mod config;
pub mod dispatcher;
pub mod lock_renewer;
pub mod poll_loop;
pub mod report;
pub mod worker;

// 主要な型を再エクスポート
pub use self::builder::WorkerBuilder;
pub use self::config::{RetryPolicy, WorkerConfig, WorkerConfigBuilder};
pub use self::dispatcher::TaskDispatcher;
pub use self::lock_renewer::{LockRenewer, RenewerState};
pub use self::poll_loop::PollLoop;
pub use self::report::{report_with_retry, send_report};
pub use self::worker::{ExternalTaskWorker, ShutdownHandle, WorkerHandle};
