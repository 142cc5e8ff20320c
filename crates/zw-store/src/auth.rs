use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::error::StoreError;
use crate::kv::KvStore;
use crate::USER_KEY;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The one accepted username/password pair.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self { username: "admin".to_string(), password: "1234".to_string() }
    }
}

pub struct Auth<K> {
    kv: K,
    accepted: Credentials,
}

impl<K: KvStore> Auth<K> {
    pub fn new(kv: K, accepted: Credentials) -> Self {
        Self { kv, accepted }
    }

    pub fn login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        if username != self.accepted.username || password != self.accepted.password {
            return Err(AuthError::InvalidCredentials);
        }
        self.kv.set(USER_KEY, username)?;
        info!(username, "auth: logged in");
        Ok(username.to_string())
    }

    pub fn current_user(&self) -> Result<Option<String>, StoreError> {
        self.kv.get(USER_KEY)
    }

    pub fn logout(&self) -> Result<(), StoreError> {
        self.kv.remove(USER_KEY)?;
        info!("auth: logged out");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[test]
    fn only_the_configured_pair_is_accepted() {
        let auth = Auth::new(MemoryKv::new(), Credentials::default());
        assert!(matches!(auth.login("admin", "nope"), Err(AuthError::InvalidCredentials)));
        assert!(matches!(auth.login("root", "1234"), Err(AuthError::InvalidCredentials)));
        assert_eq!(auth.current_user().unwrap(), None);

        assert_eq!(auth.login("admin", "1234").unwrap(), "admin");
        assert_eq!(auth.current_user().unwrap().as_deref(), Some("admin"));
    }

    #[test]
    fn logout_clears_user() {
        let kv = MemoryKv::new();
        let auth = Auth::new(kv.clone(), Credentials { username: "ana".into(), password: "pw".into() });
        auth.login("ana", "pw").unwrap();
        assert_eq!(kv.get("user").unwrap().as_deref(), Some("ana"));
        auth.logout().unwrap();
        assert_eq!(auth.current_user().unwrap(), None);
    }
}
