//! An Instagram backend which reads accounts from the local file system instead of the API.
//!
//! The directory has the structure
//!
//! ```text
//! DIR/
//!     <login>/
//!         account.json
//!         password
//!         following.json
//!         collections/
//!             <name>.json
//! ```
//!
//! where each collection file holds `{ "collection": Collection, "medias": [Media] }`. Changes
//! made through a session (follows, saves, new collections) live in memory only and are shared
//! by every session opened from the same [`LocalClient`].

use super::{
    Account, Collection, CollectionKind, Credentials, Instagram, LoginError, Media, Session,
    Settings, UserShort, ALL_MEDIA_COLLECTION,
};
use crate::session::check_login;
use anyhow::Error;
use async_std::sync::{Arc, RwLock};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// An Instagram backend which reads from the local file system.
#[derive(Clone)]
pub struct LocalClient {
    root: PathBuf,
    accounts: Arc<RwLock<HashMap<String, LocalAccount>>>,
}

impl LocalClient {
    /// Open a directory of local accounts.
    pub fn open(root: PathBuf) -> Self {
        Self {
            root,
            accounts: Default::default(),
        }
    }

    /// Make sure `login` is loaded into memory.
    async fn load(&self, login: &str) -> Result<(), Error> {
        if self.accounts.read().await.contains_key(login) {
            return Ok(());
        }
        check_login(login)?;
        let dir = self.root.join(login);
        if !dir.is_dir() {
            return Err(LoginError::LoginRequired(format!("no such account {login}")).into());
        }
        let account = LocalAccount::read(&dir)?;
        tracing::debug!(
            "loaded local account {login} with {} followings and {} collections",
            account.following.len(),
            account.collections.len()
        );
        self.accounts
            .write()
            .await
            .entry(login.to_string())
            .or_insert(account);
        Ok(())
    }

    /// Find a user by primary key among every account in the directory.
    async fn find_user(&self, pk: &str) -> Result<UserShort, Error> {
        for login in self.logins()? {
            self.load(&login).await?;
        }
        let accounts = self.accounts.read().await;
        accounts
            .values()
            .find_map(|account| {
                if account.account.pk == pk {
                    Some(UserShort::from(&account.account))
                } else {
                    account.following.get(pk).cloned()
                }
            })
            .ok_or_else(|| Error::msg(format!("user {pk} not found")))
    }

    /// Find a post by ID among every collection in the directory.
    async fn find_media(&self, id: &str) -> Result<Media, Error> {
        for login in self.logins()? {
            self.load(&login).await?;
        }
        let accounts = self.accounts.read().await;
        accounts
            .values()
            .flat_map(|account| account.collections.iter())
            .flat_map(|collection| collection.medias.iter())
            .find(|media| media.id == id || media.pk == id)
            .cloned()
            .ok_or_else(|| Error::msg(format!("media {id} not found")))
    }

    fn logins(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .root
            .read_dir()?
            .filter_map(|dirent| match dirent {
                Ok(de) if de.path().is_dir() => Some(de.file_name().to_string_lossy().into()),
                Ok(_) => None,
                Err(err) => {
                    tracing::error!("unable to read directory {}: {err}", self.root.display());
                    None
                }
            })
            .collect())
    }

    fn session(&self, login: String, user_id: String) -> LocalSession {
        LocalSession {
            client: self.clone(),
            login,
            user_id,
        }
    }
}

#[async_trait]
impl Instagram for LocalClient {
    type Session = LocalSession;

    async fn login(&self, credentials: &Credentials) -> Result<Self::Session, Error> {
        self.load(&credentials.login).await?;
        let accounts = self.accounts.read().await;
        let account = &accounts[&credentials.login];
        if account.password != credentials.password {
            return Err(LoginError::BadPassword(format!(
                "wrong password for {}",
                credentials.login
            ))
            .into());
        }
        Ok(self.session(credentials.login.clone(), account.account.pk.clone()))
    }

    async fn restore(&self, settings: Settings) -> Result<Self::Session, Error> {
        self.load(&settings.username).await?;
        let accounts = self.accounts.read().await;
        let pk = accounts[&settings.username].account.pk.clone();
        if let Some(user_id) = &settings.user_id {
            if *user_id != pk {
                return Err(Error::msg(format!(
                    "session for {} belongs to user {user_id}, expected {pk}",
                    settings.username
                )));
            }
        }
        Ok(self.session(settings.username, pk))
    }
}

/// A session with a local account.
pub struct LocalSession {
    client: LocalClient,
    login: String,
    user_id: String,
}

#[async_trait]
impl Session for LocalSession {
    fn settings(&self) -> Settings {
        Settings {
            username: self.login.clone(),
            user_id: Some(self.user_id.clone()),
            ..Default::default()
        }
    }

    fn user_id(&self) -> String {
        self.user_id.clone()
    }

    async fn account_info(&self) -> Result<Account, Error> {
        let accounts = self.client.accounts.read().await;
        Ok(accounts[&self.login].account.clone())
    }

    async fn user_following(
        &self,
        user_id: &str,
        amount: usize,
    ) -> Result<BTreeMap<String, UserShort>, Error> {
        let accounts = self.client.accounts.read().await;
        let account = accounts
            .values()
            .find(|account| account.account.pk == user_id)
            .ok_or_else(|| Error::msg(format!("user {user_id} not found")))?;
        let take = if amount == 0 { usize::MAX } else { amount };
        Ok(account
            .following
            .iter()
            .take(take)
            .map(|(pk, user)| (pk.clone(), user.clone()))
            .collect())
    }

    async fn collections(&self) -> Result<Vec<Collection>, Error> {
        let accounts = self.client.accounts.read().await;
        Ok(accounts[&self.login]
            .collections
            .iter()
            .map(LocalCollection::summary)
            .collect())
    }

    async fn collection_medias(
        &self,
        collection_id: &str,
        amount: usize,
    ) -> Result<Vec<Media>, Error> {
        let accounts = self.client.accounts.read().await;
        let collection = accounts[&self.login]
            .collections
            .iter()
            .find(|c| c.collection.id == collection_id)
            .ok_or_else(|| Error::msg(format!("collection {collection_id} not found")))?;
        let take = if amount == 0 { usize::MAX } else { amount };
        Ok(collection.medias.iter().take(take).cloned().collect())
    }

    async fn follow(&self, user_id: &str) -> Result<bool, Error> {
        let user = self.client.find_user(user_id).await?;
        let mut accounts = self.client.accounts.write().await;
        let account = accounts
            .get_mut(&self.login)
            .ok_or_else(|| Error::msg(format!("account {} is not loaded", self.login)))?;
        tracing::debug!("{} follows {}", self.login, user.username);
        account.following.insert(user.pk.clone(), user);
        Ok(true)
    }

    async fn save_media(
        &self,
        media_id: &str,
        collection_id: Option<&str>,
    ) -> Result<bool, Error> {
        let media = self.client.find_media(media_id).await?;
        let mut accounts = self.client.accounts.write().await;
        let account = accounts
            .get_mut(&self.login)
            .ok_or_else(|| Error::msg(format!("account {} is not loaded", self.login)))?;
        if let Some(collection_id) = collection_id {
            let collection = account
                .collections
                .iter_mut()
                .find(|c| c.collection.id == collection_id)
                .ok_or_else(|| Error::msg(format!("collection {collection_id} not found")))?;
            collection.add(media.clone());
        }
        // Saving into any collection also saves into "All posts".
        account.all_media().add(media);
        Ok(true)
    }

    async fn create_collection(&self, name: &str) -> Result<Collection, Error> {
        let mut accounts = self.client.accounts.write().await;
        let account = accounts
            .get_mut(&self.login)
            .ok_or_else(|| Error::msg(format!("account {} is not loaded", self.login)))?;
        let collection = LocalCollection {
            collection: Collection {
                id: format!("{}_{}", self.user_id, account.collections.len()),
                name: name.to_string(),
                media_count: 0,
                kind: CollectionKind::Media,
            },
            medias: vec![],
        };
        let summary = collection.summary();
        account.collections.push(collection);
        Ok(summary)
    }
}

/// An account loaded from disk.
struct LocalAccount {
    account: Account,
    password: String,
    following: BTreeMap<String, UserShort>,
    collections: Vec<LocalCollection>,
}

impl LocalAccount {
    fn read(dir: &Path) -> Result<Self, Error> {
        let account: Account = read_json(dir.join("account.json"))?;
        let password = fs::read_to_string(dir.join("password")).map_err(|err| {
            Error::msg(format!("unable to read password in {}: {err}", dir.display()))
        })?;
        let password = password.trim_end_matches(['\r', '\n']).to_string();

        let following_path = dir.join("following.json");
        let following: Vec<UserShort> = if following_path.exists() {
            read_json(following_path)?
        } else {
            vec![]
        };

        let mut collections = vec![];
        let collections_dir = dir.join("collections");
        if collections_dir.is_dir() {
            let mut paths = collections_dir
                .read_dir()?
                .filter_map(|dirent| match dirent {
                    Ok(de) => Some(de.path()),
                    Err(err) => {
                        tracing::error!(
                            "unable to read directory {}: {err}",
                            collections_dir.display()
                        );
                        None
                    }
                })
                .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
                .collect::<Vec<_>>();
            paths.sort();
            for path in paths {
                match read_json::<LocalCollection>(&path) {
                    Ok(collection) => collections.push(collection),
                    Err(err) => tracing::error!("file {} is malformed: {err}", path.display()),
                }
            }
        }

        let mut account = Self {
            account,
            password,
            following: following
                .into_iter()
                .map(|user| (user.pk.clone(), user))
                .collect(),
            collections,
        };
        account.all_media();
        Ok(account)
    }

    /// The "All posts" collection, created from the other collections if the fixtures lack one.
    fn all_media(&mut self) -> &mut LocalCollection {
        let index = match self
            .collections
            .iter()
            .position(|c| c.collection.kind == CollectionKind::AllMedia)
        {
            Some(index) => index,
            None => {
                let mut all = LocalCollection {
                    collection: Collection {
                        id: ALL_MEDIA_COLLECTION.into(),
                        name: "All posts".into(),
                        media_count: 0,
                        kind: CollectionKind::AllMedia,
                    },
                    medias: vec![],
                };
                for media in self.collections.iter().flat_map(|c| c.medias.iter()) {
                    all.add(media.clone());
                }
                self.collections.insert(0, all);
                0
            }
        };
        &mut self.collections[index]
    }
}

/// The contents of a collection file.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct LocalCollection {
    collection: Collection,
    #[serde(default)]
    medias: Vec<Media>,
}

impl LocalCollection {
    fn add(&mut self, media: Media) {
        if !self.medias.iter().any(|m| m.id == media.id) {
            self.medias.push(media);
        }
    }

    fn summary(&self) -> Collection {
        Collection {
            media_count: self.medias.len() as u64,
            ..self.collection.clone()
        }
    }
}

impl From<&Account> for UserShort {
    fn from(account: &Account) -> Self {
        Self {
            pk: account.pk.clone(),
            username: account.username.clone(),
            full_name: account.full_name.clone(),
            profile_pic_url: account.profile_pic_url.clone(),
            is_private: account.is_private,
            is_verified: account.is_verified,
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, Error> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|err| Error::msg(format!("unable to open file {}: {err}", path.display())))?;
    serde_json::from_reader(file)
        .map_err(|err| Error::msg(format!("file {} is malformed: {err}", path.display())))
}
