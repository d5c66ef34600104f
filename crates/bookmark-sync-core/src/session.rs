//! Session collaborator: who is signed in, if anyone.
//!
//! Login, logout and token refresh belong to the identity provider. The sync
//! engine only asks for the current user and treats "nobody" as a no-op.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl User {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
        }
    }
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// The active user, `None` when signed out
    async fn current_user(&self) -> Option<User>;
}

/// Session held in memory, switched explicitly.
#[derive(Default)]
pub struct StaticSession {
    user: RwLock<Option<User>>,
}

impl StaticSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(user: User) -> Self {
        Self {
            user: RwLock::new(Some(user)),
        }
    }

    pub fn login(&self, user: User) {
        *self.user.write().unwrap_or_else(|e| e.into_inner()) = Some(user);
    }

    pub fn logout(&self) {
        *self.user.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn current_user(&self) -> Option<User> {
        self.user.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_session_login_logout() {
        let session = StaticSession::new();
        assert!(session.current_user().await.is_none());

        session.login(User::new("uid-1"));
        assert_eq!(session.current_user().await.unwrap().uid, "uid-1");

        session.logout();
        assert!(session.current_user().await.is_none());
    }
}
