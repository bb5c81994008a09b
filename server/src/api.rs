//! HTTP endpoints.

use clonner_model::{
    accounts::Accounts,
    cache::CacheManager,
    instagram::{Collection, Credentials, Instagram, LoginError, Media, Session, UserShort},
    session::{InvalidLogin, SessionError},
    transfer::{clone_account, CloneOptions},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tide::{
    http::headers::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, ORIGIN, VARY},
    security::{CorsMiddleware, Origin},
    utils::{async_trait, After},
    Body, Middleware, Next, Request, Response, Server, StatusCode,
};

/// Shared state of the server.
pub struct State<I: Instagram> {
    accounts: Accounts<I>,
    cache: Option<CacheManager>,
}

impl<I: Instagram> Clone for State<I> {
    fn clone(&self) -> Self {
        Self {
            accounts: self.accounts.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<I: Instagram> State<I> {
    /// If `cache` is given, image URLs in responses are replaced with links to cached copies.
    pub fn new(accounts: Accounts<I>, cache: Option<CacheManager>) -> Self {
        Self { accounts, cache }
    }

    /// Replace a CDN URL with a link to a cached copy, if caching is enabled.
    async fn cached(&self, url: &mut Option<String>) {
        if let (Some(cache), Some(cdn)) = (&self.cache, url.as_ref()) {
            let name = cache.save(cdn, false).await;
            *url = Some(format!("/cache/{name}"));
        }
    }

    async fn cached_user(&self, user: &mut UserShort) {
        self.cached(&mut user.profile_pic_url).await;
    }

    async fn cached_media(&self, media: &mut Media) {
        self.cached(&mut media.thumbnail_url).await;
        self.cached_user(&mut media.user).await;
    }
}

/// Build the application.
pub fn app<I: Instagram>(state: State<I>) -> tide::Result<Server<State<I>>> {
    let cache_dir = state.cache.as_ref().map(|cache| cache.dir().to_path_buf());
    let mut app = tide::with_state(state);

    app.with(EchoOrigin);
    app.with(
        CorsMiddleware::new()
            .allow_methods("GET, POST, OPTIONS".parse::<HeaderValue>()?)
            .allow_headers("*".parse::<HeaderValue>()?)
            .allow_origin(Origin::from("*"))
            .allow_credentials(true),
    );
    // Render errors as `{"detail": "..."}`.
    app.with(After(|mut res: Response| async move {
        if let Some(detail) = res.error().map(|err| err.to_string()) {
            res.set_body(json!({ "detail": detail }));
        }
        Ok(res)
    }));

    app.at("/health").get(health);
    app.at("/login").post(login::<I>);
    app.at("/logout").post(logout::<I>);
    app.at("/account_info").get(account_info::<I>);
    app.at("/get_followings").get(get_followings::<I>);
    app.at("/get_collections").get(get_collections::<I>);
    app.at("/clone").post(clone_accounts::<I>);
    if let Some(dir) = cache_dir {
        app.at("/cache").serve_dir(dir)?;
    }
    Ok(app)
}

/// Allow credentialed requests from any origin.
///
/// Browsers reject `Access-Control-Allow-Origin: *` on credentialed requests, so the wildcard set
/// by [`CorsMiddleware`] is replaced with the request's own origin.
struct EchoOrigin;

#[async_trait]
impl<S: Clone + Send + Sync + 'static> Middleware<S> for EchoOrigin {
    async fn handle(&self, req: Request<S>, next: Next<'_, S>) -> tide::Result {
        let origin = req.header(ORIGIN).map(|values| values.last().clone());
        let mut res = next.run(req).await;
        if let Some(origin) = origin {
            res.insert_header(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
            res.append_header(VARY, "Origin");
        }
        Ok(res)
    }
}

/// Query string identifying a logged-in account.
#[derive(Clone, Debug, Deserialize)]
struct LoginQuery {
    login: String,
}

/// A collection together with its posts.
#[derive(Clone, Debug, Serialize)]
struct CollectionMedias {
    id: String,
    name: String,
    amount: u64,
    medias: Vec<Media>,
}

/// Body of a `/clone` request.
#[derive(Clone, Debug, Deserialize)]
struct CloneRequest {
    source: String,
    target: String,
    #[serde(flatten)]
    options: CloneOptions,
}

async fn health<S: Clone + Send + Sync + 'static>(req: Request<S>) -> tide::Result {
    tracing::debug!("user with ip {} checked health", client_ip(&req));
    json_response(&json!({ "status": "ok" }))
}

async fn login<I: Instagram>(mut req: Request<State<I>>) -> tide::Result {
    let credentials: Credentials = req.body_json().await?;
    let ip = client_ip(&req);
    tracing::debug!(
        "user with ip {ip} is trying to log in to instagram account {}",
        credentials.login
    );

    match req.state().accounts.login(&credentials).await {
        Ok(id) => {
            tracing::debug!("user with ip {ip} logged in to instagram account {id}");
            json_response(&json!({ "id": id }))
        }
        Err(err) => {
            tracing::debug!(
                "user with ip {ip} failed to log in to instagram account {}: {err:#}",
                credentials.login
            );
            if let Some(err) = err.downcast_ref::<InvalidLogin>() {
                Err(tide::Error::from_str(
                    StatusCode::BadRequest,
                    capitalize(&err.to_string()),
                ))
            } else if let Some(err) = err.downcast_ref::<LoginError>() {
                Err(tide::Error::from_str(
                    StatusCode::Unauthorized,
                    format!("Bad credentials or proxy: {err}"),
                ))
            } else if let Some(err) = err.downcast_ref::<SessionError>() {
                Err(tide::Error::from_str(
                    StatusCode::InternalServerError,
                    capitalize(&err.to_string()),
                ))
            } else {
                Err(tide::Error::from_str(
                    StatusCode::InternalServerError,
                    format!("Failed to log in: {err:#}"),
                ))
            }
        }
    }
}

async fn logout<I: Instagram>(req: Request<State<I>>) -> tide::Result {
    let LoginQuery { login } = req.query()?;
    let ip = client_ip(&req);
    tracing::debug!("user with ip {ip} is trying to log out {login}");
    if req.state().accounts.logout(&login).await {
        tracing::debug!("user with ip {ip} logged out {login}");
        json_response(&json!({ "id": login }))
    } else {
        tracing::debug!("user with ip {ip} failed to log out {login}: not logged in");
        Err(not_logged_in())
    }
}

async fn account_info<I: Instagram>(req: Request<State<I>>) -> tide::Result {
    let (login, session) = session(&req, "account info").await?;
    let mut account = session
        .account_info()
        .await
        .map_err(|err| api_failure(&req, "account info", &login, err))?;
    req.state().cached(&mut account.profile_pic_url).await;
    tracing::debug!("user with ip {} got account info for {login}", client_ip(&req));
    json_response(&account)
}

async fn get_followings<I: Instagram>(req: Request<State<I>>) -> tide::Result {
    let (login, session) = session(&req, "followings").await?;
    let mut followings = session
        .user_following(&session.user_id(), 0)
        .await
        .map_err(|err| api_failure(&req, "followings", &login, err))?;
    for user in followings.values_mut() {
        req.state().cached_user(user).await;
    }
    tracing::debug!("user with ip {} got followings for {login}", client_ip(&req));
    json_response(&followings)
}

async fn get_collections<I: Instagram>(req: Request<State<I>>) -> tide::Result {
    let (login, session) = session(&req, "collections").await?;
    let collections = session
        .collections()
        .await
        .map_err(|err| api_failure(&req, "collections", &login, err))?;

    let mut data = Vec::with_capacity(collections.len());
    for Collection {
        id,
        name,
        media_count,
        ..
    } in collections
    {
        let mut medias = session
            .collection_medias(&id, 0)
            .await
            .map_err(|err| api_failure(&req, "collections", &login, err))?;
        for media in &mut medias {
            req.state().cached_media(media).await;
        }
        data.push(CollectionMedias {
            id,
            name,
            amount: media_count,
            medias,
        });
    }
    tracing::debug!("user with ip {} got collections for {login}", client_ip(&req));
    json_response(&data)
}

async fn clone_accounts<I: Instagram>(mut req: Request<State<I>>) -> tide::Result {
    let body: CloneRequest = req.body_json().await?;
    let ip = client_ip(&req);
    tracing::debug!(
        "user with ip {ip} is trying to clone {} into {}",
        body.source,
        body.target
    );
    if body.source == body.target {
        return Err(tide::Error::from_str(
            StatusCode::BadRequest,
            "Source and target accounts must differ",
        ));
    }

    let accounts = &req.state().accounts;
    let (Some(source), Some(target)) = (
        accounts.get(&body.source).await,
        accounts.get(&body.target).await,
    ) else {
        tracing::debug!("user with ip {ip} failed to clone: both accounts must be logged in");
        return Err(not_logged_in());
    };

    let report = clone_account(&*source, &*target, body.options)
        .await
        .map_err(|err| api_failure(&req, "clone", &body.source, err))?;
    tracing::info!(
        "user with ip {ip} cloned {} into {}: {report:?}",
        body.source,
        body.target
    );
    json_response(&report)
}

/// Look up the session for the account named in the query string.
async fn session<I: Instagram>(
    req: &Request<State<I>>,
    what: &str,
) -> tide::Result<(String, Arc<I::Session>)> {
    let LoginQuery { login } = req.query()?;
    let ip = client_ip(req);
    tracing::debug!("user with ip {ip} is trying to get {what} for {login}");
    match req.state().accounts.get(&login).await {
        Some(session) => Ok((login, session)),
        None => {
            tracing::debug!("user with ip {ip} failed to get {what} for {login}: not logged in");
            Err(not_logged_in())
        }
    }
}

fn not_logged_in() -> tide::Error {
    tide::Error::from_str(
        StatusCode::Unauthorized,
        "You must be logged in first! Refer to /login!",
    )
}

fn api_failure<S>(
    req: &Request<S>,
    what: &str,
    login: &str,
    err: anyhow::Error,
) -> tide::Error {
    tracing::debug!(
        "user with ip {} failed to get {what} for {login}: {err:#}",
        client_ip(req)
    );
    tide::Error::from_str(
        StatusCode::InternalServerError,
        format!(
            "Failed to get info from API - contact the admin to overcome this problem: {err:#}"
        ),
    )
}

fn client_ip<S>(req: &Request<S>) -> String {
    req.remote().unwrap_or("unknown").to_string()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn json_response(value: &impl Serialize) -> tide::Result {
    let mut res = Response::new(StatusCode::Ok);
    res.set_body(Body::from_json(value)?);
    Ok(res)
}
