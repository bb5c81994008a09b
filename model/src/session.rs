//! Session files, which let an account log in again without its password.

use crate::instagram::Settings;
use anyhow::Error;
use clap::Args;
use derive_more::Display;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::PathBuf;

/// Session storage options.
#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Directory where login sessions are saved.
    #[clap(long, env = "CLONNER_SESSIONS_DIR", default_value = "sessions")]
    pub sessions_dir: PathBuf,
}

impl Options {
    /// Open the session store.
    pub fn store(&self) -> SessionStore {
        SessionStore::new(self.sessions_dir.clone())
    }
}

/// A saved session exists but could not be resumed.
#[derive(Clone, Debug, Display, PartialEq, Eq)]
#[display(fmt = "failed to load session from file: {}", _0)]
pub struct SessionError(pub String);

impl std::error::Error for SessionError {}

/// A login which cannot name an account on disk.
#[derive(Clone, Debug, Display, PartialEq, Eq)]
#[display(fmt = "invalid login {:?}", _0)]
pub struct InvalidLogin(pub String);

impl std::error::Error for InvalidLogin {}

/// Check that `login` is a single normal path component.
pub fn check_login(login: &str) -> Result<(), InvalidLogin> {
    if login.is_empty()
        || login == "."
        || login == ".."
        || login.contains(['/', '\\', '\0'])
    {
        Err(InvalidLogin(login.into()))
    } else {
        Ok(())
    }
}

/// A directory of session files, one per login, named `<login>.json`.
#[derive(Clone, Debug)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// The path of the session file for `login`.
    pub fn path(&self, login: &str) -> Result<PathBuf, InvalidLogin> {
        check_login(login)?;
        Ok(self.dir.join(format!("{login}.json")))
    }

    /// Load the saved session for `login`, if there is one.
    pub fn load(&self, login: &str) -> Result<Option<Settings>, Error> {
        let path = self.path(login)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(Error::msg(format!(
                    "unable to open session file {}: {err}",
                    path.display()
                )))
            }
        };
        let settings = serde_json::from_reader(file).map_err(|err| {
            Error::msg(format!("session file {} is malformed: {err}", path.display()))
        })?;
        tracing::debug!("loaded session from {}", path.display());
        Ok(Some(settings))
    }

    /// Save a session so that later logins can skip the password.
    pub fn dump(&self, settings: &Settings) -> Result<(), Error> {
        let path = self.path(&settings.username)?;
        fs::create_dir_all(&self.dir)?;
        serde_json::to_writer_pretty(File::create(&path)?, settings)?;
        tracing::debug!("saved session to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::instagram::Uuids;
    use tempfile::tempdir;

    #[test]
    fn test_dump_and_load() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        assert_eq!(store.load("alice").unwrap(), None);

        let settings = Settings {
            username: "alice".into(),
            user_id: Some("1001".into()),
            uuids: Uuids::generate(),
            authorization: Some("Bearer IGT:2:abc".into()),
            last_login: Some(1_700_000_000),
            ..Default::default()
        };
        store.dump(&settings).unwrap();
        assert!(store.path("alice").unwrap().ends_with("sessions/alice.json"));
        assert_eq!(store.load("alice").unwrap(), Some(settings));
    }

    #[test]
    fn test_malformed_session() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().into());
        fs::write(store.path("bob").unwrap(), "not json").unwrap();
        let err = store.load("bob").unwrap_err();
        assert!(err.to_string().contains("malformed"), "{err}");
    }

    #[test]
    fn test_login_must_be_one_path_component() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        for login in ["", ".", "..", "../data/alice", "/tmp/x", "a\\b"] {
            assert_eq!(check_login(login), Err(InvalidLogin(login.into())));
            assert!(store.path(login).is_err(), "{login}");
            assert!(store.load(login).is_err(), "{login}");
        }
        assert!(check_login("alice.smith_99").is_ok());

        let settings = Settings {
            username: "../escaped".into(),
            ..Default::default()
        };
        store.dump(&settings).unwrap_err();
        assert!(!dir.path().join("escaped.json").exists());
        assert!(!dir.path().join("sessions").exists());
    }
}
