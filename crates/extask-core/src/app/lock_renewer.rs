//! LockRenewer - 1 タスクの lock を定期的に延長する
//!
//! # 状態遷移
//! Scheduled → (Firing → Scheduled)* → Canceled
//!
//! - 生成と同時に Scheduled（`start()`）
//! - interval ごとに extend_lock を 1 回発行（Firing）
//! - `cancel()` 以降は新しい extend_lock を発行しない。in-flight の呼び出しは完了させ、結果は捨てる
//! - extend_lock の失敗は warn ログのみ（report 済みのタスクへの延長は失敗して当然なので）

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{ExternalTaskId, Identity, WorkerId};
use crate::ports::TaskApiPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewerState {
    Scheduled,
    Firing,
    Canceled,
}

impl RenewerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Scheduled,
            1 => Self::Firing,
            _ => Self::Canceled,
        }
    }
}

/// Periodic lock extension bound to exactly one in-flight task.
///
/// Dropping the renewer cancels it.
pub struct LockRenewer {
    task_id: ExternalTaskId,
    token: CancellationToken,
    state: Arc<AtomicU8>,
    join: Option<JoinHandle<()>>,
}

struct Renewal {
    api: Arc<dyn TaskApiPort>,
    identity: Identity,
    worker_id: WorkerId,
    task_id: ExternalTaskId,
    lock_duration: Duration,
}

impl LockRenewer {
    /// Schedule `extend_lock(task_id, lock_duration)` every `interval`.
    ///
    /// The first extension fires one full interval after start.
    pub fn start(
        api: Arc<dyn TaskApiPort>,
        identity: Identity,
        worker_id: WorkerId,
        task_id: ExternalTaskId,
        lock_duration: Duration,
        interval: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(RenewerState::Scheduled as u8));

        let renewal = Renewal {
            api,
            identity,
            worker_id,
            task_id: task_id.clone(),
            lock_duration,
        };
        // interval_at は 0 を受け付けない
        let interval = interval.max(Duration::from_millis(1));
        let join = tokio::spawn(renew_loop(renewal, interval, token.clone(), state.clone()));

        Self {
            task_id,
            token,
            state,
            join: Some(join),
        }
    }

    pub fn task_id(&self) -> &ExternalTaskId {
        &self.task_id
    }

    pub fn state(&self) -> RenewerState {
        RenewerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Stop issuing extensions. Idempotent.
    pub fn cancel(&self) {
        self.state
            .store(RenewerState::Canceled as u8, Ordering::Release);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel and wait until an in-flight extension (if any) has completed.
    ///
    /// After this returns, no extend_lock call for the task can be pending.
    pub async fn shutdown(mut self) {
        self.cancel();
        if let Some(join) = self.join.take()
            && let Err(err) = join.await
        {
            warn!(task_id = %self.task_id, error = %err, "lock renewer task ended abnormally");
        }
    }
}

impl Drop for LockRenewer {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn renew_loop(
    renewal: Renewal,
    interval: Duration,
    token: CancellationToken,
    state: Arc<AtomicU8>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Scheduled → Firing。cancel 済みなら Canceled のままなので発行しない
        if state
            .compare_exchange(
                RenewerState::Scheduled as u8,
                RenewerState::Firing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            break;
        }

        debug!(task_id = %renewal.task_id, "extending lock");
        let result = renewal
            .api
            .extend_lock(
                &renewal.identity,
                &renewal.worker_id,
                &renewal.task_id,
                renewal.lock_duration,
            )
            .await;

        // Firing → Scheduled。途中で cancel されていたら結果は無視する
        if state
            .compare_exchange(
                RenewerState::Firing as u8,
                RenewerState::Scheduled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(task_id = %renewal.task_id, "renewer cancelled during extension, result ignored");
            break;
        }

        if let Err(err) = result {
            warn!(
                task_id = %renewal.task_id,
                error = %err,
                "failed to extend lock"
            );
        }
    }
}
