//! Facilities for talking to Instagram.

use anyhow::Error;
use async_trait::async_trait;
use derive_more::Display;
use serde::{
    de::{Deserializer, Error as _},
    Deserialize, Serialize,
};
use std::collections::{BTreeMap, HashMap};
use strum::{Display as StrumDisplay, EnumString};

mod client;
mod local;

pub use client::{Client, ClientSession};
pub use local::{LocalClient, LocalSession};

/// The identifier of the implicit collection holding every saved post.
pub const ALL_MEDIA_COLLECTION: &str = "ALL_MEDIA_AUTO_COLLECTION";

/// An Instagram backend, able to produce authenticated sessions.
#[async_trait]
pub trait Instagram: Send + Sync + 'static {
    /// A logged-in account.
    type Session: Session;

    /// Authenticate with a login and password.
    async fn login(&self, credentials: &Credentials) -> Result<Self::Session, Error>;

    /// Resume a session from previously dumped settings, without sending a password.
    async fn restore(&self, settings: Settings) -> Result<Self::Session, Error>;
}

/// An authenticated Instagram account.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// The state needed to resume this session later.
    fn settings(&self) -> Settings;

    /// The primary key of the logged-in user.
    fn user_id(&self) -> String;

    /// Profile information about the logged-in user.
    async fn account_info(&self) -> Result<Account, Error>;

    /// Accounts followed by `user_id`, indexed by primary key.
    ///
    /// An `amount` of 0 loads every page.
    async fn user_following(
        &self,
        user_id: &str,
        amount: usize,
    ) -> Result<BTreeMap<String, UserShort>, Error>;

    /// Every collection of saved posts, including the implicit "All posts" collection.
    async fn collections(&self) -> Result<Vec<Collection>, Error>;

    /// The posts saved in a collection.
    ///
    /// [`ALL_MEDIA_COLLECTION`] addresses every saved post. An `amount` of 0 loads every page.
    async fn collection_medias(
        &self,
        collection_id: &str,
        amount: usize,
    ) -> Result<Vec<Media>, Error>;

    /// Follow a user. Returns whether the user is now followed.
    async fn follow(&self, user_id: &str) -> Result<bool, Error>;

    /// Bookmark a post, optionally adding it to a collection.
    async fn save_media(&self, media_id: &str, collection_id: Option<&str>)
        -> Result<bool, Error>;

    /// Create an empty collection.
    async fn create_collection(&self, name: &str) -> Result<Collection, Error>;
}

/// Login and password for an Instagram account.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

/// Profile of a logged-in user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Account {
    #[serde(deserialize_with = "deserialize_pk")]
    pub pk: String,
    pub username: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub profile_pic_url: Option<String>,
    #[serde(default)]
    pub biography: String,
    #[serde(default)]
    pub external_url: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
}

/// Succinct information about a user, as listed among followings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserShort {
    #[serde(deserialize_with = "deserialize_pk")]
    pub pk: String,
    pub username: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub profile_pic_url: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_verified: bool,
}

/// The kinds of saved collection.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, StrumDisplay, EnumString, Deserialize, Serialize,
)]
pub enum CollectionKind {
    /// The implicit collection containing every saved post.
    #[strum(serialize = "ALL_MEDIA_AUTO_COLLECTION")]
    #[serde(rename = "ALL_MEDIA_AUTO_COLLECTION")]
    AllMedia,
    /// A collection created by the user.
    #[strum(serialize = "MEDIA")]
    #[serde(rename = "MEDIA")]
    Media,
    /// Saved shopping products.
    #[strum(serialize = "PRODUCT_AUTO_COLLECTION")]
    #[serde(rename = "PRODUCT_AUTO_COLLECTION")]
    Product,
}

/// A collection of saved posts.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub media_count: u64,
    pub kind: CollectionKind,
}

/// A post.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Media {
    #[serde(deserialize_with = "deserialize_pk")]
    pub pk: String,
    /// The full media ID, of the form `{pk}_{owner pk}`.
    pub id: String,
    /// The shortcode used in post URLs.
    pub code: String,
    pub media_type: u8,
    #[serde(default)]
    pub caption_text: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub taken_at: u64,
    pub user: UserShort,
}

/// Device identifiers sent with every request from a session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Uuids {
    pub uuid: String,
    pub phone_id: String,
    pub client_session_id: String,
    pub advertising_id: String,
    pub android_device_id: String,
}

/// Everything needed to resume a session without a password.
///
/// This is the format of session files.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    pub username: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub uuids: Uuids,
    /// The `Authorization` header issued at login.
    #[serde(default)]
    pub authorization: Option<String>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    #[serde(default)]
    pub user_agent: String,
    /// Unix time of the last password login.
    #[serde(default)]
    pub last_login: Option<u64>,
}

/// A failure to authenticate with Instagram.
#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum LoginError {
    #[display(fmt = "bad password: {}", _0)]
    BadPassword(String),
    #[display(fmt = "challenge required: {}", _0)]
    ChallengeRequired(String),
    #[display(fmt = "recaptcha challenge: {}", _0)]
    RecaptchaChallenge(String),
    #[display(fmt = "feedback required: {}", _0)]
    FeedbackRequired(String),
    #[display(fmt = "please wait a few minutes: {}", _0)]
    PleaseWaitFewMinutes(String),
    #[display(fmt = "login required: {}", _0)]
    LoginRequired(String),
    #[display(fmt = "proxy address is blocked: {}", _0)]
    ProxyAddressIsBlocked(String),
}

impl std::error::Error for LoginError {}

impl LoginError {
    /// Recognize an authentication failure from an API error body.
    ///
    /// Instagram reports some failures with a machine-readable `error_type` and others only
    /// through a human-readable `message`, so both are checked.
    pub fn classify(error_type: Option<&str>, message: &str) -> Option<Self> {
        let msg = message.to_string();
        match error_type {
            Some("bad_password") | Some("invalid_user") => return Some(Self::BadPassword(msg)),
            Some("challenge_required") | Some("checkpoint_challenge_required") => {
                return Some(Self::ChallengeRequired(msg))
            }
            Some("recaptcha_challenge_required") => return Some(Self::RecaptchaChallenge(msg)),
            Some("feedback_required") => return Some(Self::FeedbackRequired(msg)),
            Some("login_required") => return Some(Self::LoginRequired(msg)),
            _ => {}
        }

        let lower = message.to_lowercase();
        if lower.contains("please wait a few minutes") {
            Some(Self::PleaseWaitFewMinutes(msg))
        } else if lower.contains("proxy address is blocked") {
            Some(Self::ProxyAddressIsBlocked(msg))
        } else if lower.contains("challenge_required") {
            Some(Self::ChallengeRequired(msg))
        } else if lower.contains("feedback_required") {
            Some(Self::FeedbackRequired(msg))
        } else if lower.contains("login_required") {
            Some(Self::LoginRequired(msg))
        } else {
            None
        }
    }
}

/// Instagram sends primary keys as numbers in some payloads and strings in others.
fn deserialize_pk<'a, D: Deserializer<'a>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Pk {
        Num(u64),
        Str(String),
    }

    match Pk::deserialize(d)? {
        Pk::Num(pk) => Ok(pk.to_string()),
        Pk::Str(pk) if !pk.is_empty() => Ok(pk),
        Pk::Str(_) => Err(D::Error::custom("empty primary key")),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pk_accepts_numbers_and_strings() {
        let user: UserShort =
            serde_json::from_str(r#"{"pk": 1234, "username": "alice"}"#).unwrap();
        assert_eq!(user.pk, "1234");
        let user: UserShort =
            serde_json::from_str(r#"{"pk": "5678", "username": "bob"}"#).unwrap();
        assert_eq!(user.pk, "5678");
        assert!(serde_json::from_str::<UserShort>(r#"{"pk": "", "username": "eve"}"#).is_err());
    }

    #[test]
    fn collection_kind_wire_names() {
        assert_eq!(CollectionKind::AllMedia.to_string(), ALL_MEDIA_COLLECTION);
        assert_eq!(
            "MEDIA".parse::<CollectionKind>().unwrap(),
            CollectionKind::Media
        );
        let kind: CollectionKind = serde_json::from_str(r#""PRODUCT_AUTO_COLLECTION""#).unwrap();
        assert_eq!(kind, CollectionKind::Product);
    }

    #[test]
    fn classify_login_errors() {
        assert_eq!(
            LoginError::classify(Some("bad_password"), "The password you entered is incorrect."),
            Some(LoginError::BadPassword(
                "The password you entered is incorrect.".into()
            ))
        );
        assert!(matches!(
            LoginError::classify(None, "Please wait a few minutes before you try again."),
            Some(LoginError::PleaseWaitFewMinutes(_))
        ));
        assert!(matches!(
            LoginError::classify(Some("whatever"), "The proxy address is blocked"),
            Some(LoginError::ProxyAddressIsBlocked(_))
        ));
        assert_eq!(LoginError::classify(None, "media not found"), None);
    }
}
