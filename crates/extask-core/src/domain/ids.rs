//! Domain identifiers (strongly-typed IDs).
//!
//! # Phantom Type パターン
//! `Id<T>` というジェネリック型で共通実装を提供しつつ、
//! `T` はマーカー型としてコンパイル時の型安全性だけを提供します。
//! WorkerId と ExternalTaskId はどちらも文字列ですが、混同できません。
//!
//! - **WorkerId**: ワーカー起動時に 1 回だけ生成（ULID）。lock の主体になる
//! - **ExternalTaskId**: engine 側が払い出す opaque な文字列。ワーカーは解釈しない

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// `generate()` で使うプレフィックス（"worker-", "task-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// 中身は engine とやり取りする文字列そのまま。
/// serialize すると `"worker-01H..."` のような素の文字列になります。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// 既存の文字列から Id を作成（engine から受け取った ID、注入された WorkerId など）
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    /// ULID ベースで新しい Id を生成
    pub fn generate() -> Self {
        Self::new(format!("{}{}", T::prefix(), Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<T: IdMarker> From<String> for Id<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Worker のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn prefix() -> &'static str {
        "worker-"
    }
}

/// ExternalTask のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Identifier of this worker instance; the locking principal for every request.
pub type WorkerId = Id<Worker>;

/// Identifier of an external task, owned by the engine.
pub type ExternalTaskId = Id<Task>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_worker_ids_are_unique_and_prefixed() {
        let a = WorkerId::generate();
        let b = WorkerId::generate();

        assert_ne!(a, b);
        assert!(a.as_str().starts_with("worker-"));
        assert!(b.to_string().starts_with("worker-"));
    }

    #[test]
    fn injected_ids_are_kept_verbatim() {
        let worker_id = WorkerId::new("5f1c3a0e-uuid-from-elsewhere");
        assert_eq!(worker_id.as_str(), "5f1c3a0e-uuid-from-elsewhere");

        let task_id: ExternalTaskId = "abc".into();
        assert_eq!(task_id.to_string(), "abc");
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let task_id = ExternalTaskId::new("task-1");
        let s = serde_json::to_string(&task_id).unwrap();
        assert_eq!(s, "\"task-1\"");

        let back: ExternalTaskId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, task_id);
    }
}
