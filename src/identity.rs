/// Identity boundary
///
/// The chat core never issues or refreshes credentials. It reads the current
/// `{user_id, token}` pair from an `IdentityProvider` each time a connection is
/// opened and treats it as valid for the lifetime of that session.

use crate::error::{ChatError, Result};
use std::sync::{Arc, RwLock};

/// Authenticated user as seen by the chat core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub token: String,
}

impl Identity {
    pub fn new(user_id: &str, token: &str) -> Self {
        Identity {
            user_id: user_id.to_string(),
            token: token.to_string(),
        }
    }

    /// Reject identities that cannot open a session
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(ChatError::MissingIdentity("user id is empty".to_string()));
        }
        if self.token.trim().is_empty() {
            return Err(ChatError::MissingIdentity("auth token is empty".to_string()));
        }
        Ok(())
    }
}

/// Source of the current identity (the app's auth/session layer)
pub trait IdentityProvider: Send + Sync {
    /// `None` while nobody is signed in.
    fn identity(&self) -> Option<Identity>;
}

/// Identity held in memory; swapped by the host app on sign-in/sign-out.
#[derive(Debug, Default)]
pub struct SessionIdentity {
    current: RwLock<Option<Identity>>,
}

impl SessionIdentity {
    pub fn signed_in(identity: Identity) -> Arc<Self> {
        Arc::new(SessionIdentity {
            current: RwLock::new(Some(identity)),
        })
    }

    pub fn signed_out() -> Arc<Self> {
        Arc::new(SessionIdentity::default())
    }

    pub fn sign_in(&self, identity: Identity) {
        if let Ok(mut current) = self.current.write() {
            *current = Some(identity);
        }
    }

    pub fn sign_out(&self) {
        if let Ok(mut current) = self.current.write() {
            current.take();
        }
    }
}

impl IdentityProvider for SessionIdentity {
    fn identity(&self) -> Option<Identity> {
        self.current.read().ok().and_then(|current| current.clone())
    }
}

/// Resolve and validate the provider's identity
pub fn require_identity(provider: &dyn IdentityProvider) -> Result<Identity> {
    let identity = provider
        .identity()
        .ok_or_else(|| ChatError::MissingIdentity("no signed-in user".to_string()))?;
    identity.validate()?;
    Ok(identity)
}
