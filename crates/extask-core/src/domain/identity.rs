//! Identity - リクエストごとに渡す認証情報
//!
//! 共有 HTTP client のデフォルトヘッダを書き換えるのではなく、
//! 呼び出しごとに `&Identity` を引数で渡します。
//! 並行する呼び出しが別の（あるいは更新された）token を使っても競合しません。

use std::fmt;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

/// Bearer credential plus an optional user id.
///
/// An identity without a token is anonymous: requests made with it carry no
/// `Authorization` header.
#[derive(Clone, Default)]
pub struct Identity {
    token: Option<Arc<SecretString>>,
    user_id: Option<String>,
}

impl Identity {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(Arc::new(SecretString::from(token.into()))),
            user_id: None,
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.token.is_none()
    }

    /// `Authorization` header value, or `None` for anonymous identities.
    pub fn bearer_header(&self) -> Option<String> {
        self.token
            .as_ref()
            .map(|token| format!("Bearer {}", token.expose_secret()))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("user_id", &self.user_id)
            .finish()
    }
}
