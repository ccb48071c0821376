//! Domain model (ids, tasks, identity, results, errors).
//!
//! engine・HTTP・tokio に依存しない純粋なデータ型だけを置きます。

pub mod errors;
pub mod identity;
pub mod ids;
pub mod result;
pub mod task;

pub use self::errors::{BuildError, ConfigError, HandlerError, TaskApiError};
pub use self::identity::Identity;
pub use self::ids::{ExternalTaskId, Id, IdMarker, WorkerId};
pub use self::result::{ResultKind, TaskResult};
pub use self::task::ExternalTask;
