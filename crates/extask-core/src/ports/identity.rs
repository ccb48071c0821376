//! IdentityProvider port - 認証情報の供給
//!
//! PollLoop は fetch のたびに 1 回 `identity()` を呼び、
//! 得られた Identity をそのバッチの全呼び出しに値として渡します。
//! token が更新されても、次のバッチから反映されるだけで in-flight の呼び出しとは競合しません。

use std::sync::{Arc, RwLock};

use crate::domain::Identity;

pub trait IdentityProvider: Send + Sync {
    fn identity(&self) -> Identity;
}

/// A fixed identity is its own provider.
impl IdentityProvider for Identity {
    fn identity(&self) -> Identity {
        self.clone()
    }
}

impl<T: IdentityProvider + ?Sized> IdentityProvider for Arc<T> {
    fn identity(&self) -> Identity {
        (**self).identity()
    }
}

/// Identity that can be swapped while the worker runs (e.g. after a token refresh).
#[derive(Debug, Default)]
pub struct SharedIdentity {
    current: RwLock<Identity>,
}

impl SharedIdentity {
    pub fn new(identity: Identity) -> Self {
        Self {
            current: RwLock::new(identity),
        }
    }

    /// Replace the identity used from the next fetch cycle on.
    pub fn replace(&self, identity: Identity) {
        // poison されても中身は Identity 1 個なのでそのまま使う
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = identity;
    }
}

impl IdentityProvider for SharedIdentity {
    fn identity(&self) -> Identity {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
