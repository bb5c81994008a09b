//! A client for the Instagram private mobile API.

use super::{
    Account, Collection, CollectionKind, Credentials, Instagram, LoginError, Media, Session,
    Settings, UserShort, Uuids, ALL_MEDIA_COLLECTION,
};
use anyhow::Error;
use async_std::task::sleep;
use async_trait::async_trait;
use base64::prelude::*;
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use surf::Url;
use uuid::Uuid;

const API_URL: &str = "https://i.instagram.com/api/v1/";
const APP_ID: &str = "567067343352427";
const USER_AGENT: &str = "Instagram 269.0.0.18.75 Android (26/8.0.0; 480dpi; 1080x1920; \
    OnePlus; 6T Dev; devitron; qcom; en_US; 314665256)";
const TIMEOUT: Duration = Duration::from_secs(30);

/// Connection to the Instagram private API.
#[derive(Clone)]
pub struct Client {
    client: surf::Client,
    delay: (Duration, Duration),
}

impl Client {
    /// Connect to Instagram.
    pub fn new() -> Result<Self, Error> {
        Self::with_base_url(API_URL.parse()?)
    }

    /// Connect to an Instagram-compatible API at `base_url`.
    pub fn with_base_url(base_url: Url) -> Result<Self, Error> {
        let client: surf::Client = surf::Config::default()
            .set_base_url(base_url)
            .set_timeout(Some(TIMEOUT))
            .try_into()?;
        Ok(Self {
            client,
            delay: (Duration::from_secs(1), Duration::from_secs(3)),
        })
    }

    /// Wait a random duration between `min` and `max` before every request.
    pub fn with_delay_range(mut self, min: Duration, max: Duration) -> Self {
        self.delay = (min, max.max(min));
        self
    }

    fn session(&self, settings: Settings) -> ClientSession {
        ClientSession {
            client: self.client.clone(),
            delay: self.delay,
            settings,
        }
    }
}

#[async_trait]
impl Instagram for Client {
    type Session = ClientSession;

    async fn login(&self, credentials: &Credentials) -> Result<Self::Session, Error> {
        let mut session = self.session(Settings {
            username: credentials.login.clone(),
            uuids: Uuids::generate(),
            user_agent: USER_AGENT.into(),
            ..Default::default()
        });

        let now = unix_time();
        let uuids = &session.settings.uuids;
        let data = json!({
            "jazoest": jazoest(&uuids.phone_id),
            "country_codes": r#"[{"country_code":"1","source":["default"]}]"#,
            "phone_id": uuids.phone_id,
            "enc_password": format!("#PWD_INSTAGRAM:0:{now}:{}", credentials.password),
            "username": credentials.login,
            "adid": uuids.advertising_id,
            "guid": uuids.uuid,
            "device_id": uuids.android_device_id,
            "google_tokens": "[]",
            "login_attempt_count": "0",
        });
        let res = session
            .request(surf::http::Method::Post, "accounts/login/")
            .signed_body(&data)?
            .send::<LoginResponse>()
            .await?;

        let settings = &mut session.settings;
        settings.user_id = Some(res.body.logged_in_user.pk.clone());
        settings.authorization = res.authorization;
        settings.cookies = res.cookies;
        settings.last_login = Some(now);
        tracing::info!(
            "logged in as {} ({})",
            res.body.logged_in_user.username,
            res.body.logged_in_user.pk
        );
        Ok(session)
    }

    async fn restore(&self, mut settings: Settings) -> Result<Self::Session, Error> {
        if settings.user_id.is_none() {
            settings.user_id = settings
                .authorization
                .as_deref()
                .and_then(parse_authorization)
                .map(|auth| auth.ds_user_id);
        }
        if settings.user_id.is_none() {
            return Err(Error::msg(format!(
                "settings for {} contain no user ID",
                settings.username
            )));
        }
        if settings.user_agent.is_empty() {
            settings.user_agent = USER_AGENT.into();
        }
        Ok(self.session(settings))
    }
}

/// An authenticated session with the Instagram private API.
pub struct ClientSession {
    client: surf::Client,
    delay: (Duration, Duration),
    settings: Settings,
}

impl ClientSession {
    fn request(&self, method: surf::http::Method, path: impl AsRef<str>) -> Request {
        // Paths are relative to the base URL configured on the client.
        let mut builder = match method {
            surf::http::Method::Post => self.client.post(path.as_ref()),
            _ => self.client.get(path.as_ref()),
        };
        let uuids = &self.settings.uuids;
        builder = builder
            .header("User-Agent", self.settings.user_agent.as_str())
            .header("X-IG-App-ID", APP_ID)
            .header("X-IG-Device-ID", uuids.uuid.as_str())
            .header("X-IG-Android-ID", uuids.android_device_id.as_str())
            .header("Accept-Language", "en-US");
        if let Some(auth) = &self.settings.authorization {
            builder = builder.header("Authorization", auth.as_str());
        }
        if !self.settings.cookies.is_empty() {
            let cookies = self
                .settings
                .cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header("Cookie", cookies);
        }
        Request {
            builder,
            params: HashMap::default(),
            delay: self.delay,
        }
    }

    /// The common fields of every mutating request.
    fn signed_fields(&self, mut data: Value) -> Value {
        if let Some(obj) = data.as_object_mut() {
            obj.insert("_uid".into(), self.user_id().into());
            obj.insert("_uuid".into(), self.settings.uuids.uuid.clone().into());
        }
        data
    }
}

#[async_trait]
impl Session for ClientSession {
    fn settings(&self) -> Settings {
        self.settings.clone()
    }

    fn user_id(&self) -> String {
        self.settings.user_id.clone().unwrap_or_default()
    }

    async fn account_info(&self) -> Result<Account, Error> {
        let res = self
            .request(surf::http::Method::Get, "accounts/current_user/")
            .param("edit", "true")
            .send::<CurrentUserResponse>()
            .await?;
        Ok(res.body.user)
    }

    async fn user_following(
        &self,
        user_id: &str,
        amount: usize,
    ) -> Result<BTreeMap<String, UserShort>, Error> {
        let rank_token = format!("{}_{}", self.user_id(), self.settings.uuids.uuid);
        let mut users = BTreeMap::new();
        let mut max_id: Option<String> = None;
        loop {
            let mut req = self
                .request(surf::http::Method::Get, format!("friendships/{user_id}/following/"))
                .param("rank_token", &rank_token)
                .param("search_surface", "follow_list_page");
            if let Some(max_id) = &max_id {
                req = req.param("max_id", max_id);
            }
            let page = req.send::<FollowingPage>().await?.body;
            tracing::debug!("loaded {} followings of {user_id}", page.users.len());
            for user in page.users {
                users.insert(user.pk.clone(), user);
                if amount != 0 && users.len() >= amount {
                    return Ok(users);
                }
            }
            match page.next_max_id {
                Some(next) if !next.is_empty() => max_id = Some(next),
                _ => break,
            }
        }
        Ok(users)
    }

    async fn collections(&self) -> Result<Vec<Collection>, Error> {
        let mut collections = vec![];
        let mut max_id: Option<String> = None;
        loop {
            let mut req = self
                .request(surf::http::Method::Get, "collections/list/")
                .param(
                    "collection_types",
                    r#"["ALL_MEDIA_AUTO_COLLECTION","MEDIA","PRODUCT_AUTO_COLLECTION"]"#,
                );
            if let Some(max_id) = &max_id {
                req = req.param("max_id", max_id);
            }
            let page = req.send::<CollectionsPage>().await?.body;
            collections.extend(page.items.into_iter().map(Collection::from));
            match page.next_max_id {
                Some(next) if page.more_available && !next.is_empty() => max_id = Some(next),
                _ => break,
            }
        }
        Ok(collections)
    }

    async fn collection_medias(
        &self,
        collection_id: &str,
        amount: usize,
    ) -> Result<Vec<Media>, Error> {
        let path = if collection_id == ALL_MEDIA_COLLECTION {
            "feed/saved/posts/".to_string()
        } else {
            format!("feed/collection/{collection_id}/posts/")
        };

        let mut medias = vec![];
        let mut max_id: Option<String> = None;
        loop {
            let mut req = self
                .request(surf::http::Method::Get, &path)
                .param("include_igtv_preview", "false")
                .param("include_clips_subtab", "false");
            if let Some(max_id) = &max_id {
                req = req.param("max_id", max_id);
            }
            let page = req.send::<SavedPage>().await?.body;
            for item in page.items {
                medias.push(item.media.into());
                if amount != 0 && medias.len() >= amount {
                    return Ok(medias);
                }
            }
            match page.next_max_id {
                Some(next) if page.more_available && !next.is_empty() => max_id = Some(next),
                _ => break,
            }
        }
        Ok(medias)
    }

    async fn follow(&self, user_id: &str) -> Result<bool, Error> {
        let data = self.signed_fields(json!({ "user_id": user_id }));
        let res = self
            .request(surf::http::Method::Post, format!("friendships/create/{user_id}/"))
            .signed_body(&data)?
            .send::<FriendshipResponse>()
            .await?;
        let status = res.body.friendship_status;
        Ok(status.following || status.outgoing_request)
    }

    async fn save_media(
        &self,
        media_id: &str,
        collection_id: Option<&str>,
    ) -> Result<bool, Error> {
        let mut data = json!({ "media_id": media_id });
        if let Some(collection_id) = collection_id {
            data["added_collection_ids"] = json!([collection_id]).to_string().into();
        }
        let data = self.signed_fields(data);
        self.request(surf::http::Method::Post, format!("media/{media_id}/save/"))
            .signed_body(&data)?
            .send::<Value>()
            .await?;
        Ok(true)
    }

    async fn create_collection(&self, name: &str) -> Result<Collection, Error> {
        let data = self.signed_fields(json!({
            "name": name,
            "module_name": "collection_create",
            "added_media_ids": "[]",
        }));
        let res = self
            .request(surf::http::Method::Post, "collections/create/")
            .signed_body(&data)?
            .send::<WireCollection>()
            .await?;
        Ok(res.body.into())
    }
}

impl Uuids {
    /// Fresh device identifiers for a new login.
    pub fn generate() -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            phone_id: Uuid::new_v4().to_string(),
            client_session_id: Uuid::new_v4().to_string(),
            advertising_id: Uuid::new_v4().to_string(),
            android_device_id: format!("android-{}", &Uuid::new_v4().simple().to_string()[..16]),
        }
    }
}

/// An Instagram API response containing data of type `T`.
///
/// Every response carries a `"status"` of either `"ok"` or `"fail"`; the payload fields sit
/// alongside it at the top level.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "status")]
enum Response<T> {
    #[serde(rename = "ok")]
    Ok(T),
    #[serde(rename = "fail")]
    Fail {
        #[serde(default)]
        message: String,
        #[serde(default)]
        error_type: Option<String>,
    },
}

/// A decoded response, with the session state Instagram hands back in headers.
struct Received<T> {
    body: T,
    authorization: Option<String>,
    cookies: HashMap<String, String>,
}

/// Response from the `accounts/login/` endpoint.
#[derive(Clone, Debug, Deserialize)]
struct LoginResponse {
    logged_in_user: UserShort,
}

/// Response from the `accounts/current_user/` endpoint.
#[derive(Clone, Debug, Deserialize)]
struct CurrentUserResponse {
    user: Account,
}

/// A page of the `friendships/{pk}/following/` endpoint.
#[derive(Clone, Debug, Deserialize)]
struct FollowingPage {
    users: Vec<UserShort>,
    #[serde(default)]
    next_max_id: Option<String>,
}

/// A page of the `collections/list/` endpoint.
#[derive(Clone, Debug, Deserialize)]
struct CollectionsPage {
    items: Vec<WireCollection>,
    #[serde(default)]
    more_available: bool,
    #[serde(default)]
    next_max_id: Option<String>,
}

/// A collection as Instagram serializes it.
#[derive(Clone, Debug, Deserialize)]
struct WireCollection {
    collection_id: String,
    collection_name: String,
    collection_type: CollectionKind,
    #[serde(default)]
    collection_media_count: u64,
}

impl From<WireCollection> for Collection {
    fn from(c: WireCollection) -> Self {
        Self {
            id: c.collection_id,
            name: c.collection_name,
            media_count: c.collection_media_count,
            kind: c.collection_type,
        }
    }
}

/// A page of saved posts, from `feed/saved/posts/` or `feed/collection/{id}/posts/`.
#[derive(Clone, Debug, Deserialize)]
struct SavedPage {
    items: Vec<SavedItem>,
    #[serde(default)]
    more_available: bool,
    #[serde(default)]
    next_max_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct SavedItem {
    media: WireMedia,
}

/// A post as Instagram serializes it.
#[derive(Clone, Debug, Deserialize)]
struct WireMedia {
    #[serde(deserialize_with = "super::deserialize_pk")]
    pk: String,
    id: String,
    code: String,
    media_type: u8,
    #[serde(default)]
    caption: Option<Caption>,
    #[serde(default)]
    image_versions2: Option<ImageVersions>,
    #[serde(default)]
    carousel_media: Vec<CarouselItem>,
    #[serde(default)]
    taken_at: u64,
    user: UserShort,
}

#[derive(Clone, Debug, Deserialize)]
struct Caption {
    text: String,
}

#[derive(Clone, Debug, Deserialize)]
struct ImageVersions {
    candidates: Vec<ImageCandidate>,
}

#[derive(Clone, Debug, Deserialize)]
struct ImageCandidate {
    url: String,
}

#[derive(Clone, Debug, Deserialize)]
struct CarouselItem {
    #[serde(default)]
    image_versions2: Option<ImageVersions>,
}

impl From<WireMedia> for Media {
    fn from(m: WireMedia) -> Self {
        // Albums have no image of their own; use the first slide.
        let thumbnail_url = m
            .image_versions2
            .iter()
            .chain(m.carousel_media.iter().filter_map(|c| c.image_versions2.as_ref()))
            .find_map(|versions| versions.candidates.first())
            .map(|candidate| candidate.url.clone());
        Self {
            pk: m.pk,
            id: m.id,
            code: m.code,
            media_type: m.media_type,
            caption_text: m.caption.map(|c| c.text).unwrap_or_default(),
            thumbnail_url,
            taken_at: m.taken_at,
            user: m.user,
        }
    }
}

/// Response from the `friendships/create/{pk}/` endpoint.
#[derive(Clone, Debug, Deserialize)]
struct FriendshipResponse {
    friendship_status: FriendshipStatus,
}

#[derive(Clone, Debug, Deserialize)]
struct FriendshipStatus {
    #[serde(default)]
    following: bool,
    #[serde(default)]
    outgoing_request: bool,
}

/// Contents of the token in an `Authorization: Bearer IGT:2:...` header.
#[derive(Clone, Debug, Deserialize)]
struct Authorization {
    ds_user_id: String,
}

fn parse_authorization(header: &str) -> Option<Authorization> {
    let token = header.rsplit(':').next()?;
    let bytes = BASE64_STANDARD.decode(token).ok()?;
    serde_json::from_slice(&bytes).ok()
}

struct Request {
    builder: surf::RequestBuilder,
    params: HashMap<String, String>,
    delay: (Duration, Duration),
}

impl Request {
    fn param(mut self, param: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(param.into(), value.into());
        self
    }

    fn signed_body(mut self, data: &Value) -> Result<Self, Error> {
        let form = HashMap::from([("signed_body", format!("SIGNATURE.{data}"))]);
        self.builder = self
            .builder
            .body(surf::Body::from_form(&form).map_err(Error::msg)?);
        Ok(self)
    }

    async fn send<T: DeserializeOwned>(self) -> Result<Received<T>, Error> {
        let (min, max) = self.delay;
        if !max.is_zero() {
            let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
            sleep(Duration::from_millis(millis as u64)).await;
        }

        tracing::debug!(?self.builder, ?self.params, "Instagram request");
        let mut res = self
            .builder
            .query(&self.params)
            .map_err(Error::msg)?
            .send()
            .await
            .map_err(Error::msg)?;
        let status = res.status();
        let authorization = res
            .header("ig-set-authorization")
            .map(|value| value.last().as_str().to_string())
            .filter(|value| !value.is_empty());
        let cookies = res
            .header("set-cookie")
            .into_iter()
            .flat_map(|values| values.iter())
            .filter_map(|value| parse_cookie(value.as_str()))
            .collect();
        let body: Response<T> = res.body_json().await.map_err(|err| {
            Error::msg(format!("malformed Instagram response (HTTP {status}): {err}"))
        })?;

        match body {
            Response::Ok(body) => Ok(Received {
                body,
                authorization,
                cookies,
            }),
            Response::Fail {
                message,
                error_type,
            } => match LoginError::classify(error_type.as_deref(), &message) {
                Some(err) => Err(err.into()),
                None => Err(Error::msg(format!(
                    "Instagram API error (HTTP {status}): {message}"
                ))),
            },
        }
    }
}

/// Extract the name and value from a `Set-Cookie` header.
fn parse_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        None
    } else {
        Some((name.to_string(), value.trim().to_string()))
    }
}

/// The checksum Instagram expects alongside a phone ID.
fn jazoest(phone_id: &str) -> String {
    let sum: u32 = phone_id.chars().map(|c| c as u32).sum();
    format!("2{sum}")
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use async_std::task::spawn;
    use portpicker::pick_unused_port;
    use tide::{Body, Response as TideResponse, StatusCode};

    #[test]
    fn test_jazoest() {
        assert_eq!(jazoest("ab"), "2195");
        assert_eq!(jazoest(""), "20");
    }

    #[test]
    fn test_parse_cookie() {
        assert_eq!(
            parse_cookie("sessionid=abc%3A123; Domain=.instagram.com; HttpOnly"),
            Some(("sessionid".into(), "abc%3A123".into()))
        );
        assert_eq!(parse_cookie("garbage"), None);
    }

    #[test]
    fn test_parse_authorization() {
        let token = BASE64_STANDARD.encode(r#"{"ds_user_id":"42","sessionid":"42%3Axyz"}"#);
        let auth = parse_authorization(&format!("Bearer IGT:2:{token}")).unwrap();
        assert_eq!(auth.ds_user_id, "42");
        assert!(parse_authorization("Bearer IGT:2:!!!").is_none());
    }

    #[test]
    fn test_generated_uuids() {
        let uuids = Uuids::generate();
        assert!(uuids.android_device_id.starts_with("android-"));
        assert_eq!(uuids.android_device_id.len(), "android-".len() + 16);
        assert_ne!(uuids.uuid, uuids.phone_id);
    }

    #[test]
    fn test_media_thumbnail_falls_back_to_carousel() {
        let media: WireMedia = serde_json::from_value(json!({
            "pk": 1,
            "id": "1_2",
            "code": "abc",
            "media_type": 8,
            "carousel_media": [
                {"image_versions2": {"candidates": [{"url": "https://cdn/a.jpg"}]}}
            ],
            "user": {"pk": 2, "username": "owner"},
        }))
        .unwrap();
        let media = Media::from(media);
        assert_eq!(media.thumbnail_url.as_deref(), Some("https://cdn/a.jpg"));
        assert_eq!(media.caption_text, "");
    }

    /// Start a fake Instagram API and return a client connected to it.
    async fn mock_api() -> Client {
        let mut app = tide::new();
        app.at("/api/v1/accounts/login/").post(|_| async move {
            let auth = format!(
                "Bearer IGT:2:{}",
                BASE64_STANDARD.encode(r#"{"ds_user_id":"1","sessionid":"s"}"#)
            );
            let mut res = TideResponse::new(StatusCode::Ok);
            res.insert_header("ig-set-authorization", auth);
            res.set_body(json!({
                "status": "ok",
                "logged_in_user": {"pk": 1, "username": "alice"},
            }));
            Ok(res)
        });
        app.at("/api/v1/friendships/:pk/following/")
            .get(|req: tide::Request<()>| async move {
                #[derive(Deserialize)]
                struct Query {
                    max_id: Option<String>,
                }
                let query: Query = req.query()?;
                let body = match query.max_id.as_deref() {
                    None => json!({
                        "status": "ok",
                        "users": [{"pk": 10, "username": "bob"}],
                        "next_max_id": "page2",
                    }),
                    Some(_) => json!({
                        "status": "ok",
                        "users": [{"pk": "11", "username": "carol"}],
                        "next_max_id": null,
                    }),
                };
                Ok(Body::from_json(&body)?)
            });
        app.at("/api/v1/accounts/current_user/")
            .get(|_| async move {
                let mut res = TideResponse::new(StatusCode::BadRequest);
                res.set_body(json!({
                    "status": "fail",
                    "message": "login_required",
                    "error_type": "login_required",
                }));
                Ok(res)
            });

        let port = pick_unused_port().unwrap();
        spawn(app.listen(format!("127.0.0.1:{port}")));

        let base_url = format!("http://127.0.0.1:{port}/api/v1/").parse().unwrap();
        let client = Client::with_base_url(base_url)
            .unwrap()
            .with_delay_range(Duration::ZERO, Duration::ZERO);
        // Wait for the server to come up.
        for _ in 0..50 {
            if surf::get(format!("http://127.0.0.1:{port}/")).await.is_ok() {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        client
    }

    #[async_std::test]
    async fn test_login_and_paginate() {
        let client = mock_api().await;
        let session = client
            .login(&Credentials {
                login: "alice".into(),
                password: "hunter2".into(),
            })
            .await
            .unwrap();
        assert_eq!(session.user_id(), "1");
        let settings = session.settings();
        assert!(settings.authorization.unwrap().starts_with("Bearer IGT:2:"));
        assert!(settings.last_login.is_some());

        let following = session.user_following("1", 0).await.unwrap();
        assert_eq!(
            following.keys().cloned().collect::<Vec<_>>(),
            vec!["10".to_string(), "11".to_string()]
        );
        let first = session.user_following("1", 1).await.unwrap();
        assert_eq!(first.len(), 1);

        let err = session.account_info().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LoginError>(),
            Some(LoginError::LoginRequired(_))
        ));
    }

    #[async_std::test]
    async fn test_restore_from_authorization() {
        let client = Client::new().unwrap();
        let token = BASE64_STANDARD.encode(r#"{"ds_user_id":"77","sessionid":"x"}"#);
        let session = client
            .restore(Settings {
                username: "dave".into(),
                authorization: Some(format!("Bearer IGT:2:{token}")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(session.user_id(), "77");
        assert_eq!(session.settings().user_agent, USER_AGENT);

        assert!(client
            .restore(Settings {
                username: "nobody".into(),
                ..Default::default()
            })
            .await
            .is_err());
    }
}
