//! Handshake authentication.
//!
//! Encore does not issue tokens. Whatever identity provider the deployment
//! uses, the server only needs the token sent in the handshake turned into
//! a [`UserId`]. The [`Authenticator`] trait is that seam.

use std::sync::Arc;

use encore_protocol::UserId;
use encore_store::{Store, StoreError};

/// Why a handshake token was refused.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validates a client's token and returns the user it identifies.
///
/// `Send + Sync + 'static` because one authenticator is shared by every
/// connection task for the life of the server.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<UserId, AuthError>> + Send;
}

/// Treats the token as a user id and checks the user exists.
///
/// Suitable when a gateway in front of Encore has already verified the
/// caller and forwards the bare id.
pub struct UserIdAuthenticator {
    store: Arc<dyn Store>,
}

impl UserIdAuthenticator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

impl Authenticator for UserIdAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
        let user: UserId = token
            .trim()
            .parse()
            .map_err(|_| AuthError::Unauthorized("token is not a user id".into()))?;
        match self.store.get_user(user).await? {
            Some(_) => Ok(user),
            None => Err(AuthError::Unauthorized(format!("unknown user {user}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_store::{InMemoryStore, User};

    #[tokio::test]
    async fn test_known_user_is_accepted() {
        let store = Arc::new(InMemoryStore::new());
        let user = User::new(UserId::new(), "alice");
        store.insert_user(&user).await.unwrap();

        let auth = UserIdAuthenticator::new(store);
        let token = user.id.as_uuid().to_string();
        assert_eq!(auth.authenticate(&token).await.unwrap(), user.id);
    }

    #[tokio::test]
    async fn test_garbage_and_unknown_users_are_refused() {
        let auth = UserIdAuthenticator::new(Arc::new(InMemoryStore::new()));
        assert!(matches!(
            auth.authenticate("not-a-uuid").await,
            Err(AuthError::Unauthorized(_))
        ));
        let stranger = UserId::new().as_uuid().to_string();
        assert!(matches!(
            auth.authenticate(&stranger).await,
            Err(AuthError::Unauthorized(_))
        ));
    }
}
