//! Typed - 型付き Handler API
//!
//! payload と result を serde で型付けし、JSON との変換はこのモジュールに閉じ込めます。
//! app 層は `DynHandler`（JSON のまま）だけを扱います。

pub mod handler;

pub use self::handler::{DynHandler, FnHandler, Handler, TypedHandler, handler_fn};
