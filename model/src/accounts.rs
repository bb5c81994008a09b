//! The registry of logged-in accounts.

use crate::{
    instagram::{Credentials, Instagram, Session},
    session::{check_login, SessionError, SessionStore},
};
use anyhow::Error;
use async_std::sync::{Arc, RwLock};
use std::collections::HashMap;

/// Logged-in accounts, indexed by login.
///
/// Cloning an [`Accounts`] yields a handle to the same registry.
pub struct Accounts<I: Instagram> {
    backend: Arc<I>,
    store: SessionStore,
    sessions: Arc<RwLock<HashMap<String, Arc<I::Session>>>>,
}

impl<I: Instagram> Clone for Accounts<I> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            store: self.store.clone(),
            sessions: self.sessions.clone(),
        }
    }
}

impl<I: Instagram> Accounts<I> {
    pub fn new(backend: I, store: SessionStore) -> Self {
        Self {
            backend: Arc::new(backend),
            store,
            sessions: Default::default(),
        }
    }

    /// Log in and register the account.
    ///
    /// If a session was saved for this login, it is resumed and the password is not used.
    /// Otherwise the password is sent to Instagram and the new session is saved. Failures to
    /// resume a saved session are reported as [`SessionError`]; authentication failures keep
    /// their [`LoginError`](crate::instagram::LoginError). A login which is not a single path
    /// component is rejected with [`InvalidLogin`](crate::session::InvalidLogin) before anything
    /// is read or written.
    ///
    /// # Returns
    ///
    /// The login, which identifies the account in later requests.
    pub async fn login(&self, credentials: &Credentials) -> Result<String, Error> {
        let login = &credentials.login;
        check_login(login)?;
        let session = match self
            .store
            .load(login)
            .map_err(|err| SessionError(format!("{err:#}")))?
        {
            Some(settings) => {
                let session = self
                    .backend
                    .restore(settings)
                    .await
                    .map_err(|err| SessionError(format!("{err:#}")))?;
                tracing::debug!("resumed saved session for {login}");
                session
            }
            None => {
                let session = self.backend.login(credentials).await?;
                self.store.dump(&session.settings())?;
                tracing::debug!("logged in {login} with password");
                session
            }
        };

        let previous = self
            .sessions
            .write()
            .await
            .insert(login.clone(), Arc::new(session));
        if previous.is_some() {
            tracing::debug!("replaced existing session for {login}");
        }
        Ok(login.clone())
    }

    /// The session for `login`, if it is logged in.
    pub async fn get(&self, login: &str) -> Option<Arc<I::Session>> {
        self.sessions.read().await.get(login).cloned()
    }

    /// Forget the session for `login`. The session file is kept.
    ///
    /// Returns whether the account was logged in.
    pub async fn logout(&self, login: &str) -> bool {
        self.sessions.write().await.remove(login).is_some()
    }

    /// Logins of every registered account.
    pub async fn logins(&self) -> Vec<String> {
        let mut logins = self
            .sessions
            .read()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        logins.sort();
        logins
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::instagram::{LocalClient, LoginError};
    use crate::session::InvalidLogin;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn open_accounts(sessions: &Path) -> Accounts<LocalClient> {
        let testdata = Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .unwrap()
            .join("testdata");
        Accounts::new(
            LocalClient::open(testdata),
            SessionStore::new(sessions.into()),
        )
    }

    fn credentials(login: &str, password: &str) -> Credentials {
        Credentials {
            login: login.into(),
            password: password.into(),
        }
    }

    #[async_std::test]
    async fn test_login_saves_session() {
        let dir = tempdir().unwrap();
        let accounts = open_accounts(dir.path());

        let id = accounts
            .login(&credentials("alice", "alice-pass"))
            .await
            .unwrap();
        assert_eq!(id, "alice");
        assert!(dir.path().join("alice.json").exists());
        assert_eq!(accounts.get("alice").await.unwrap().user_id(), "1001");
        assert_eq!(accounts.logins().await, vec!["alice".to_string()]);

        // A saved session is resumed without checking the password.
        let fresh = open_accounts(dir.path());
        fresh
            .login(&credentials("alice", "not-the-password"))
            .await
            .unwrap();
        assert!(fresh.get("alice").await.is_some());
    }

    #[async_std::test]
    async fn test_bad_password() {
        let dir = tempdir().unwrap();
        let accounts = open_accounts(dir.path());
        let err = accounts
            .login(&credentials("bob", "nope"))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<LoginError>().is_some(), "{err}");
        assert!(!dir.path().join("bob.json").exists());
        assert!(accounts.get("bob").await.is_none());
    }

    #[async_std::test]
    async fn test_corrupt_session() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bob.json"), "{").unwrap();
        let accounts = open_accounts(dir.path());
        let err = accounts
            .login(&credentials("bob", "bob-pass"))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<SessionError>().is_some(), "{err}");
    }

    #[async_std::test]
    async fn test_logout() {
        let dir = tempdir().unwrap();
        let accounts = open_accounts(dir.path());
        accounts.login(&credentials("bob", "bob-pass")).await.unwrap();
        assert!(accounts.logout("bob").await);
        assert!(!accounts.logout("bob").await);
        assert!(accounts.get("bob").await.is_none());
        assert!(dir.path().join("bob.json").exists());
    }

    #[async_std::test]
    async fn test_login_outside_directories() {
        let dir = tempdir().unwrap();
        let sessions = dir.path().join("sessions");
        let accounts = open_accounts(&sessions);

        // `testdata/../testdata/alice` exists and has this password, but must not be reachable.
        let err = accounts
            .login(&credentials("../testdata/alice", "alice-pass"))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<InvalidLogin>(),
            Some(&InvalidLogin("../testdata/alice".into()))
        );
        let err = accounts
            .login(&credentials("/etc/passwd", "x"))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<InvalidLogin>().is_some(), "{err}");

        assert!(accounts.logins().await.is_empty());
        assert!(!sessions.exists());
    }
}
