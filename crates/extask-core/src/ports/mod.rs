//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! engine との通信（TaskApiPort）と認証情報の供給（IdentityProvider）を
//! trait として切り出し、app 層はこれらにだけ依存します。

pub mod identity;
pub mod task_api;

pub use self::identity::{IdentityProvider, SharedIdentity};
pub use self::task_api::TaskApiPort;
