use crate::context::AppContext;
use crate::flash::{FlashRedirect, Notice, cookie_value};
use crate::listings::ListingError;
use crate::models::{User, UserId};
use crate::reviews::ReviewError;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{self, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "wanderlust_session";
/// Page a visitor was turned away from, revisited after logging in.
pub const RETURN_COOKIE: &str = "wanderlust_return";

/// Token-to-user table loaded once at startup.
#[derive(Clone, Default)]
pub struct CredentialStore {
    by_token: Arc<HashMap<String, User>>,
}

/// The authenticated user, inserted as a request extension by [`require_login`].
#[derive(Clone, Debug)]
pub struct CurrentUser(pub User);

impl CredentialStore {
    pub fn from_env() -> Self {
        Self::parse(&env::var("WANDERLUST_USERS").unwrap_or_default())
    }

    /// `username:token` pairs separated by commas.
    pub fn parse(raw: &str) -> Self {
        let mut by_token = HashMap::new();
        for token in raw.split(',') {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut parts = trimmed.splitn(2, ':');
            let username = parts.next().map(str::trim).filter(|s| !s.is_empty());
            let secret = parts.next().map(str::trim).filter(|s| !s.is_empty());
            match (username, secret) {
                (Some(username), Some(secret)) => {
                    let user = User {
                        id: user_id_for(username),
                        username: username.to_string(),
                    };
                    by_token.insert(secret.to_string(), user);
                }
                _ => warn!(
                    target = "wanderlust.api",
                    "ignored malformed WANDERLUST_USERS entry"
                ),
            }
        }

        if by_token.is_empty() {
            warn!(
                target = "wanderlust.api",
                "WANDERLUST_USERS produced no users; only signed-up accounts can log in"
            );
        } else {
            info!(
                target = "wanderlust.api",
                user_count = by_token.len(),
                "loaded users from env"
            );
        }

        Self {
            by_token: Arc::new(by_token),
        }
    }

    pub fn resolve(&self, headers: &http::HeaderMap) -> Option<User> {
        let presented = extract_token(headers)?;
        self.by_token.get(&presented).cloned()
    }

    /// Distinct users, ordered by username.
    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.by_token.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users.dedup_by(|a, b| a.id == b.id);
        users
    }

    pub fn find_by_username(&self, username: &str) -> Option<User> {
        self.by_token
            .values()
            .find(|user| user.username == username)
            .cloned()
    }
}

/// Stable across restarts so stored `owner`/`author` references keep resolving.
pub fn user_id_for(username: &str) -> UserId {
    UserId(Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("wanderlust:user:{username}").as_bytes(),
    ))
}

/// Bearer token if an `Authorization` header is present, else the session cookie.
pub fn extract_token(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && let Some((scheme, token)) = raw.split_once(' ')
        && scheme.eq_ignore_ascii_case("bearer")
    {
        return Some(token.trim().to_string()).filter(|token| !token.is_empty());
    }
    cookie_value(headers, SESSION_COOKIE)
}

pub fn session_cookie(token: &str) -> String {
    format!(
        "{SESSION_COOKIE}={token}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        crate::accounts::SESSION_TTL.as_secs()
    )
}

pub fn expired_cookie(name: &str) -> String {
    format!("{name}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax")
}

/// Where to go after logging in: the page saved by [`require_login`], if it
/// is a local path.
pub fn return_to(headers: &http::HeaderMap) -> String {
    cookie_value(headers, RETURN_COOKIE)
        .and_then(|raw| urlencoding::decode(&raw).ok().map(|path| path.into_owned()))
        .filter(|path| path.starts_with('/') && !path.starts_with("//") && !path.contains('\\'))
        .unwrap_or_else(|| "/listings".to_string())
}

pub async fn require_login(
    State(ctx): State<AppContext>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(user) = ctx.accounts.resolve(request.headers()).await else {
        let mut redirect = FlashRedirect::to("/login", Notice::error("You must be logged in"));
        if request.method() == http::Method::GET
            && let Some(path) = request.uri().path_and_query()
        {
            redirect = redirect.with_cookie(format!(
                "{RETURN_COOKIE}={}; Path=/; Max-Age=600; HttpOnly; SameSite=Lax",
                urlencoding::encode(path.as_str())
            ));
        }
        return Ok(redirect.into_response());
    };
    request.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(request).await)
}

/// Runs after [`require_login`]; only the listing owner passes.
pub async fn require_listing_owner(
    State(ctx): State<AppContext>,
    Path(params): Path<HashMap<String, String>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(CurrentUser(user)) = request.extensions().get::<CurrentUser>().cloned() else {
        return Ok(login_redirect());
    };
    let id = params.get("id").cloned().unwrap_or_default();
    match ctx.listings.owner_of(&id).await {
        Ok(Some(owner)) if owner == user.id => Ok(next.run(request).await),
        Ok(_) => Ok(FlashRedirect::to(
            format!("/listings/{id}"),
            Notice::error("You are not the owner of this listing"),
        )
        .into_response()),
        Err(ListingError::NotFound) => Ok(FlashRedirect::to(
            "/listings",
            Notice::error("Listing you requested for does not exist!"),
        )
        .into_response()),
        Err(err) => Ok(crate::routes::AppError::from(err).into_response()),
    }
}

/// Runs after [`require_login`]; only the review author passes.
pub async fn require_review_author(
    State(ctx): State<AppContext>,
    Path(params): Path<HashMap<String, String>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(CurrentUser(user)) = request.extensions().get::<CurrentUser>().cloned() else {
        return Ok(login_redirect());
    };
    let id = params.get("id").cloned().unwrap_or_default();
    let review_id = params.get("review_id").cloned().unwrap_or_default();
    match ctx.reviews.author_of(&review_id).await {
        Ok(Some(author)) if author == user.id => Ok(next.run(request).await),
        Ok(_) => Ok(FlashRedirect::to(
            format!("/listings/{id}"),
            Notice::error("You are not the author of this review"),
        )
        .into_response()),
        Err(ReviewError::NotFound) => Ok(FlashRedirect::to(
            format!("/listings/{id}"),
            Notice::error("Review not found"),
        )
        .into_response()),
        Err(err) => Ok(crate::routes::AppError::from(err).into_response()),
    }
}

fn login_redirect() -> Response {
    FlashRedirect::to("/login", Notice::error("You must be logged in")).into_response()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCheck {
    NotConfigured,
    Mismatch,
    Granted,
}

/// Fails closed: without a configured secret nothing is granted.
pub fn check_admin_secret(configured: Option<&str>, presented: &str) -> AdminCheck {
    let Some(secret) = configured.filter(|secret| !secret.is_empty()) else {
        return AdminCheck::NotConfigured;
    };
    if Sha256::digest(presented.as_bytes()) == Sha256::digest(secret.as_bytes()) {
        AdminCheck::Granted
    } else {
        AdminCheck::Mismatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue, header};

    #[test]
    fn parses_users_and_skips_malformed_entries() {
        let store = CredentialStore::parse("alice:tok-a, bob:tok-b,broken,:nouser,carol:");
        let users = store.users();
        assert_eq!(
            users.iter().map(|u| u.username.as_str()).collect::<Vec<_>>(),
            vec!["alice", "bob"]
        );
        assert_eq!(store.find_by_username("bob").unwrap().id, user_id_for("bob"));
    }

    #[test]
    fn ids_are_stable_per_username() {
        assert_eq!(user_id_for("alice"), user_id_for("alice"));
        assert_ne!(user_id_for("alice"), user_id_for("bob"));
    }

    #[test]
    fn resolves_bearer_and_cookie() {
        let store = CredentialStore::parse("alice:tok-a");
        let mut bearer = HeaderMap::new();
        bearer.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok-a"));
        assert_eq!(store.resolve(&bearer).unwrap().username, "alice");

        let mut cookie = HeaderMap::new();
        cookie.insert(
            header::COOKIE,
            HeaderValue::from_static("wanderlust_flash=x; wanderlust_session=tok-a"),
        );
        assert_eq!(store.resolve(&cookie).unwrap().username, "alice");

        let mut wrong = HeaderMap::new();
        wrong.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert!(store.resolve(&wrong).is_none());
        assert!(store.resolve(&HeaderMap::new()).is_none());
    }

    #[test]
    fn bearer_scheme_needs_a_separating_space() {
        let store = CredentialStore::parse("alice:XYZ");
        let mut glued = HeaderMap::new();
        glued.insert(header::AUTHORIZATION, HeaderValue::from_static("BearerXYZ"));
        assert!(extract_token(&glued).is_none());
        assert!(store.resolve(&glued).is_none());

        let mut lowercase = HeaderMap::new();
        lowercase.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer  XYZ"));
        assert_eq!(extract_token(&lowercase).as_deref(), Some("XYZ"));

        let mut basic = HeaderMap::new();
        basic.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic XYZ"));
        basic.insert(header::COOKIE, HeaderValue::from_static("wanderlust_session=abc"));
        assert_eq!(extract_token(&basic).as_deref(), Some("abc"));
    }

    #[test]
    fn return_to_only_follows_local_paths() {
        let mut headers = HeaderMap::new();
        assert_eq!(return_to(&headers), "/listings");
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("wanderlust_return=%2Flistings%2Fnew"),
        );
        assert_eq!(return_to(&headers), "/listings/new");
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("wanderlust_return=%2F%2Fevil.example"),
        );
        assert_eq!(return_to(&headers), "/listings");
    }

    #[test]
    fn admin_secret_fails_closed() {
        assert_eq!(check_admin_secret(None, "x"), AdminCheck::NotConfigured);
        assert_eq!(check_admin_secret(Some(""), ""), AdminCheck::NotConfigured);
        assert_eq!(check_admin_secret(Some("s3"), "nope"), AdminCheck::Mismatch);
        assert_eq!(check_admin_secret(Some("s3"), "s3"), AdminCheck::Granted);
    }
}
