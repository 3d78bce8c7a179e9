use crate::accounts::AccountError;
use crate::context::AppContext;
use crate::flash::{self, FlashRedirect, Notice};
use crate::images::Upload;
use crate::listings::{ListingError, ListingErrorKind, MISSING_IMAGE};
use crate::maintenance;
use crate::models::{
    ApiError, Category, ListingQuery, ListingSubmission, LoginForm, ReviewForm, SignupForm, User,
};
use crate::reviews::ReviewError;
use crate::security::{
    AdminCheck, CurrentUser, RETURN_COOKIE, SESSION_COOKIE, check_admin_secret, expired_cookie,
    require_listing_owner, require_login, require_review_author, return_to, session_cookie,
};
use axum::{
    Extension, Form, Json, Router,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower::{Layer, util::MapRequestLayer};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{error, warn};

/// The router behind the `_method` override, ready to serve.
pub type App = tower::util::MapRequest<Router, fn(Request) -> Request>;

pub fn app(ctx: AppContext) -> App {
    MapRequestLayer::new(override_method as fn(Request) -> Request).layer(build_router(ctx))
}

pub fn build_router(ctx: AppContext) -> Router {
    let login = || middleware::from_fn_with_state(ctx.clone(), require_login);
    let owner = || middleware::from_fn_with_state(ctx.clone(), require_listing_owner);
    let author = || middleware::from_fn_with_state(ctx.clone(), require_review_author);

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/signup", get(signup_page).post(signup))
        .route("/login", get(login_page).post(self::login))
        .route("/logout", get(logout))
        .route(
            "/listings",
            get(index).merge(post(create_listing).route_layer(login())),
        )
        .route("/listings/new", get(new_form).route_layer(login()))
        .route(
            "/listings/{id}",
            get(show_listing).merge(
                put(update_listing)
                    .delete(delete_listing)
                    .route_layer(owner())
                    .route_layer(login()),
            ),
        )
        .route(
            "/listings/{id}/edit",
            get(edit_form).route_layer(owner()).route_layer(login()),
        )
        .route(
            "/listings/{id}/reviews",
            post(create_review).route_layer(login()),
        )
        .route(
            "/listings/{id}/reviews/{review_id}",
            delete(delete_review)
                .route_layer(author())
                .route_layer(login()),
        )
        .route("/admin/fix-missing-uploads", post(fix_missing_uploads))
        .fallback_service(ServeDir::new(ctx.config.public_dir.clone()))
        .layer(DefaultBodyLimit::max(ctx.config.request_max_bytes))
        .with_state(ctx)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// HTML forms can only POST; `?_method=PUT|DELETE|PATCH` picks the real verb.
fn override_method(mut request: Request) -> Request {
    if request.method() != Method::POST {
        return request;
    }
    let target = request.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "_method")
            .map(|(_, value)| value.to_ascii_uppercase())
    });
    match target.as_deref() {
        Some("PUT") => *request.method_mut() = Method::PUT,
        Some("DELETE") => *request.method_mut() = Method::DELETE,
        Some("PATCH") => *request.method_mut() = Method::PATCH,
        _ => {}
    }
    request
}

#[derive(Debug, Serialize)]
struct Page<T> {
    flash: Option<Notice>,
    current_user: Option<User>,
    #[serde(flatten)]
    body: T,
}

/// JSON view model with the pending notice and the current user attached.
/// Displaying a notice consumes it.
async fn render<T: Serialize>(ctx: &AppContext, headers: &HeaderMap, body: T) -> Response {
    let (notice, clear) = flash::take(headers);
    let page = Page {
        flash: notice,
        current_user: ctx.accounts.resolve(headers).await,
        body,
    };
    let mut response = Json(page).into_response();
    if let Some(clear) = clear {
        response.headers_mut().insert(header::SET_COOKIE, clear);
    }
    response
}

fn not_found_redirect() -> Response {
    FlashRedirect::to(
        "/listings",
        Notice::error("Listing you requested for does not exist!"),
    )
    .into_response()
}

async fn root() -> Response {
    FlashRedirect::plain("/listings").into_response()
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "wanderlust-rs",
        "store": ctx.store.backend(),
    }))
}

async fn metrics_endpoint(State(ctx): State<AppContext>, headers: HeaderMap) -> Response {
    if let Some(secret) = ctx.config.metrics_key.as_deref() {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    let Some(handle) = &ctx.prometheus else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response();
    };
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response()
}

#[derive(Serialize)]
struct AuthForm {
    fields: &'static [&'static str],
    accepted_credentials: [&'static str; 2],
}

const SIGNUP_FIELDS: &[&str] = &["username", "email", "password"];
const LOGIN_FIELDS: &[&str] = &["username", "password"];
const API_CREDENTIALS: [&str; 2] = [
    "Authorization: Bearer <token>",
    "Cookie: wanderlust_session=<token>",
];

async fn signup_page(State(ctx): State<AppContext>, headers: HeaderMap) -> Response {
    let form = AuthForm {
        fields: SIGNUP_FIELDS,
        accepted_credentials: API_CREDENTIALS,
    };
    render(&ctx, &headers, form).await
}

/// Register and log in.
///
/// - Method: `POST`
/// - Path: `/signup`
/// - Body: form with `username`, `email`, `password`
async fn signup(State(ctx): State<AppContext>, Form(form): Form<SignupForm>) -> Response {
    crate::metrics::inc_requests("POST /signup");
    match ctx.accounts.signup(form).await {
        Ok(session) => FlashRedirect::to("/listings", Notice::success("Welcome to Wanderlust!"))
            .with_cookie(session_cookie(&session.token))
            .into_response(),
        Err(AccountError::Persistence(message)) => {
            error!(target = "wanderlust.auth", error = %message, "signup failed");
            FlashRedirect::to("/signup", Notice::error(format!("Error: {message}"))).into_response()
        }
        Err(err) => FlashRedirect::to("/signup", Notice::error(err.to_string())).into_response(),
    }
}

async fn login_page(State(ctx): State<AppContext>, headers: HeaderMap) -> Response {
    let form = AuthForm {
        fields: LOGIN_FIELDS,
        accepted_credentials: API_CREDENTIALS,
    };
    render(&ctx, &headers, form).await
}

/// Log in and return to the page that asked for it.
///
/// - Method: `POST`
/// - Path: `/login`
/// - Body: form with `username`, `password`
async fn login(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    crate::metrics::inc_requests("POST /login");
    match ctx.accounts.login(form).await {
        Ok(session) => FlashRedirect::to(
            return_to(&headers),
            Notice::success("Welcome back to Wanderlust!"),
        )
        .with_cookie(session_cookie(&session.token))
        .with_cookie(expired_cookie(RETURN_COOKIE))
        .into_response(),
        Err(AccountError::Persistence(message)) => {
            error!(target = "wanderlust.auth", error = %message, "login failed");
            FlashRedirect::to("/login", Notice::error(format!("Error: {message}"))).into_response()
        }
        Err(err) => FlashRedirect::to("/login", Notice::error(err.to_string())).into_response(),
    }
}

async fn logout(State(ctx): State<AppContext>, headers: HeaderMap) -> Response {
    if let Err(err) = ctx.accounts.logout(&headers).await {
        warn!(target = "wanderlust.auth", error = %err, "session could not be removed");
    }
    FlashRedirect::to("/listings", Notice::success("You are logged out!"))
        .with_cookie(expired_cookie(SESSION_COOKIE))
        .into_response()
}

/// List listings.
///
/// - Method: `GET`
/// - Path: `/listings?category=<name>|country=<text>`
async fn index(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Query(query): Query<ListingQuery>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/listings");
    let listings = ctx.listings.list(query).await?;
    Ok(render(&ctx, &headers, listings).await)
}

#[derive(Serialize)]
struct NewListingForm {
    categories: Vec<&'static str>,
}

async fn new_form(State(ctx): State<AppContext>, headers: HeaderMap) -> Response {
    let form = NewListingForm {
        categories: Category::ALL.iter().map(Category::as_str).collect(),
    };
    render(&ctx, &headers, form).await
}

async fn show_listing(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    crate::metrics::inc_requests("/listings/{id}");
    match ctx.listings.show(&id).await {
        Ok(listing) => render(&ctx, &headers, listing).await,
        Err(ListingError::NotFound) => not_found_redirect(),
        Err(err) => {
            error!(target = "wanderlust.api", listing = %id, error = %err, "show failed");
            FlashRedirect::to("/listings", Notice::error("Unable to load the listing."))
                .into_response()
        }
    }
}

/// Create a listing.
///
/// - Method: `POST`
/// - Path: `/listings`
/// - Auth: logged in
/// - Body: multipart form with `listing[...]` fields and an `listing[image]` file
async fn create_listing(
    State(ctx): State<AppContext>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    ListingPayload { submission, upload }: ListingPayload,
) -> Response {
    crate::metrics::inc_requests("POST /listings");
    let form = "/listings/new";
    let redirect = match ctx.listings.create(&user, submission, upload).await {
        Ok(_) => FlashRedirect::to("/listings", Notice::success("New Listing Created!")),
        Err(ListingError::Validation(message)) if message == MISSING_IMAGE => {
            FlashRedirect::to(form, Notice::error("Please upload an image!"))
        }
        Err(err) => match err.kind() {
            ListingErrorKind::Geocode => {
                warn!(target = "wanderlust.api", error = %err, "create rejected by geocoder");
                FlashRedirect::to(
                    form,
                    Notice::error("Location not found. Please enter a valid location!"),
                )
            }
            _ => FlashRedirect::to(form, Notice::error(format!("Error: {err}"))),
        },
    };
    redirect.into_response()
}

async fn edit_form(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    match ctx.listings.edit_form(&id).await {
        Ok(form) => Ok(render(&ctx, &headers, form).await),
        Err(ListingError::NotFound) => Ok(not_found_redirect()),
        Err(err) => Err(err.into()),
    }
}

async fn update_listing(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    ListingPayload { submission, upload }: ListingPayload,
) -> Response {
    crate::metrics::inc_requests("PUT /listings/{id}");
    match ctx.listings.update(&id, submission, upload).await {
        Ok(listing) => FlashRedirect::to(
            format!("/listings/{}", listing.id),
            Notice::success("Listing Updated!"),
        )
        .into_response(),
        Err(ListingError::NotFound) => not_found_redirect(),
        Err(err) => FlashRedirect::to(
            format!("/listings/{id}/edit"),
            Notice::error(format!("Error: {err}")),
        )
        .into_response(),
    }
}

async fn delete_listing(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("DELETE /listings/{id}");
    match ctx.listings.delete(&id).await {
        Ok(_) => Ok(FlashRedirect::to("/listings", Notice::success("Listing Deleted!")).into_response()),
        Err(ListingError::NotFound) => Ok(not_found_redirect()),
        Err(err) => Err(err.into()),
    }
}

async fn create_review(
    State(ctx): State<AppContext>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    Form(form): Form<ReviewForm>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("POST /listings/{id}/reviews");
    let page = format!("/listings/{id}");
    match ctx.reviews.create(&id, &user, form).await {
        Ok(_) => Ok(FlashRedirect::to(page, Notice::success("New Review Created!")).into_response()),
        Err(ReviewError::Validation(message)) => {
            Ok(FlashRedirect::to(page, Notice::error(format!("Error: {message}"))).into_response())
        }
        Err(ReviewError::ListingNotFound) => Ok(not_found_redirect()),
        Err(err) => Err(err.into()),
    }
}

async fn delete_review(
    State(ctx): State<AppContext>,
    Path((id, review_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("DELETE /listings/{id}/reviews/{review_id}");
    let page = format!("/listings/{id}");
    match ctx.reviews.delete(&id, &review_id).await {
        Ok(_) => Ok(FlashRedirect::to(page, Notice::success("Review Deleted!")).into_response()),
        Err(ReviewError::NotFound) => {
            Ok(FlashRedirect::to(page, Notice::error("Review not found")).into_response())
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct AdminRequest {
    #[serde(default)]
    secret: String,
}

/// Persist placeholder substitutions for missing local uploads.
///
/// - Method: `POST`
/// - Path: `/admin/fix-missing-uploads`
/// - Body: JSON or form `{ "secret": "..." }` matched against `ADMIN_SECRET`
async fn fix_missing_uploads(State(ctx): State<AppContext>, request: Request) -> Response {
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    let body = if is_json {
        Json::<AdminRequest>::from_request(request, &())
            .await
            .map(|Json(body)| body)
            .unwrap_or_default()
    } else {
        Form::<AdminRequest>::from_request(request, &())
            .await
            .map(|Form(body)| body)
            .unwrap_or_default()
    };

    match check_admin_secret(ctx.config.admin_secret.as_deref(), &body.secret) {
        AdminCheck::NotConfigured => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"ok": false, "error": "ADMIN_SECRET not configured on server"})),
        )
            .into_response(),
        AdminCheck::Mismatch => {
            warn!(target = "wanderlust.api", "admin secret mismatch");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"ok": false, "error": "Unauthorized"})),
            )
                .into_response()
        }
        AdminCheck::Granted => {
            match maintenance::fix_missing_uploads(ctx.store.as_ref(), &ctx.guard).await {
                Ok(report) => Json(json!({
                    "ok": true,
                    "scanned": report.scanned,
                    "updated": report.updated,
                }))
                .into_response(),
                Err(err) => {
                    error!(target = "wanderlust.api", error = %err, "upload reconciliation failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"ok": false, "error": err.to_string()})),
                    )
                        .into_response()
                }
            }
        }
    }
}

/// Listing form fields plus the optional image file. Accepts multipart and
/// urlencoded bodies; an empty file part counts as no upload.
struct ListingPayload {
    submission: ListingSubmission,
    upload: Option<Upload>,
}

const IMAGE_FIELDS: [&str; 2] = ["listing[image]", "image"];

impl<S> FromRequest<S> for ListingPayload
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_multipart = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("multipart/form-data"));

        let mut submission = ListingSubmission::default();
        let mut upload = None;

        if !is_multipart {
            let Form(pairs) = Form::<Vec<(String, String)>>::from_request(request, state)
                .await
                .map_err(|err| AppError::BadRequest(err.body_text()))?;
            for (name, value) in pairs {
                submission.assign(&name, value);
            }
            return Ok(Self { submission, upload });
        }

        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|err| AppError::BadRequest(err.body_text()))?;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| AppError::BadRequest(err.body_text()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if IMAGE_FIELDS.contains(&name.as_str()) {
                let original_name = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::BadRequest(err.body_text()))?;
                if !bytes.is_empty() {
                    upload = Some(Upload {
                        original_name,
                        content_type,
                        bytes: bytes.to_vec(),
                    });
                }
            } else {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::BadRequest(err.body_text()))?;
                submission.assign(&name, value);
            }
        }
        Ok(Self { submission, upload })
    }
}

/// Generic responder for everything not recovered with a redirect.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Listing(#[from] ListingError),
    #[error(transparent)]
    Review(#[from] ReviewError),
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::Listing(err) => match err.kind() {
                ListingErrorKind::Validation => (StatusCode::BAD_REQUEST, "validation"),
                ListingErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
                ListingErrorKind::Geocode => (StatusCode::BAD_GATEWAY, "geocode"),
                ListingErrorKind::Storage => (StatusCode::BAD_GATEWAY, "image_storage"),
                ListingErrorKind::Persistence => (StatusCode::INTERNAL_SERVER_ERROR, "persistence"),
            },
            AppError::Review(ReviewError::Validation(_)) => (StatusCode::BAD_REQUEST, "validation"),
            AppError::Review(ReviewError::NotFound | ReviewError::ListingNotFound) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            AppError::Review(ReviewError::Persistence(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "persistence")
            }
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        };
        if status.is_server_error() {
            error!(target = "wanderlust.api", error = %self, "request failed");
        }
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(self.to_string()),
        };
        let mut response = (status, Json(payload)).into_response();
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::images::{ImageStore, StorageStrategy};
    use crate::listings::tests::{StubGeocoder, submission, upload};
    use crate::security::{CredentialStore, user_id_for};
    use crate::store::{ListingRepository, MemoryStore, UserRepository};
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "wanderlust-test-boundary";

    struct Harness {
        _dir: TempDir,
        store: MemoryStore,
        ctx: AppContext,
    }

    async fn harness(admin_secret: Option<&str>) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::local(dir.path().to_path_buf());
        config.admin_secret = admin_secret.map(str::to_string);
        let store = MemoryStore::new();
        let credentials = CredentialStore::parse("alice:tok-a,bob:tok-b");
        for user in credentials.users() {
            store.upsert_user(user).await.unwrap();
        }
        let images = Arc::new(ImageStore::new(StorageStrategy::LocalDisk {
            public_dir: dir.path().to_path_buf(),
        }));
        let ctx = AppContext::assemble(
            config,
            Arc::new(store.clone()),
            Arc::new(StubGeocoder::found()),
            images,
            credentials,
            None,
        );
        Harness {
            _dir: dir,
            store,
            ctx,
        }
    }

    fn alice() -> User {
        User {
            id: user_id_for("alice"),
            username: "alice".into(),
        }
    }

    async fn send(ctx: &AppContext, request: axum::http::Request<Body>) -> Response {
        app(ctx.clone()).oneshot(request).await.unwrap()
    }

    fn get(uri: &str, token: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::get(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_form(uri: &str, token: &str, body: &str) -> axum::http::Request<Body> {
        axum::http::Request::post(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart(fields: &[(&str, &str)], image: Option<&[u8]>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some(bytes) = image {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"listing[image]\"; filename=\"room.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn post_multipart(uri: &str, token: &str, body: Vec<u8>) -> axum::http::Request<Body> {
        axum::http::Request::post(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn location(response: &Response) -> &str {
        response.headers()[header::LOCATION].to_str().unwrap()
    }

    fn flash_of(response: &Response) -> Option<Notice> {
        let raw = response.headers().get(header::SET_COOKIE)?.to_str().ok()?;
        let pair = raw.split(';').next()?;
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(pair).ok()?);
        flash::take(&headers).0
    }

    /// `name=value` of the cookie the response sets under `name`.
    fn set_cookie(response: &Response, name: &str) -> Option<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|raw| raw.split(';').next())
            .find(|pair| pair.starts_with(&format!("{name}=")))
            .map(str::to_string)
    }

    fn post_anonymous(uri: &str, cookie: Option<&str>, body: &str) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::post(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_with_cookie(uri: &str, cookie: &str) -> axum::http::Request<Body> {
        axum::http::Request::get(uri)
            .header(header::COOKIE, cookie)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn root_redirects_to_listings() {
        let h = harness(None).await;
        let response = send(&h.ctx, get("/", None)).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/listings");
    }

    #[tokio::test]
    async fn anonymous_write_is_sent_to_login() {
        let h = harness(None).await;
        let request = axum::http::Request::post("/listings")
            .body(Body::empty())
            .unwrap();
        let response = send(&h.ctx, request).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/login");
        assert_eq!(flash_of(&response), Some(Notice::error("You must be logged in")));
    }

    #[tokio::test]
    async fn multipart_create_then_index() {
        let h = harness(None).await;
        let body = multipart(
            &[
                ("listing[title]", "Sea-facing flat"),
                ("listing[price]", "2500"),
                ("listing[location]", "Mumbai"),
                ("listing[country]", "India"),
                ("listing[category]", "Rooms"),
            ],
            Some(b"jpeg-bytes".as_slice()),
        );
        let response = send(&h.ctx, post_multipart("/listings", "tok-a", body)).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/listings");
        assert_eq!(flash_of(&response), Some(Notice::success("New Listing Created!")));

        let page = json_body(send(&h.ctx, get("/listings?country=ind", Some("tok-a"))).await).await;
        assert_eq!(page["listings"].as_array().unwrap().len(), 1);
        assert_eq!(page["listings"][0]["title"], "Sea-facing flat");
        assert_eq!(page["country"], "ind");
        assert_eq!(page["current_user"]["username"], "alice");

        let stored = h.store.find_listings(&crate::models::ListingFilter::All).await.unwrap();
        assert_eq!(stored[0].owner, Some(user_id_for("alice")));
    }

    #[tokio::test]
    async fn create_without_image_asks_for_one() {
        let h = harness(None).await;
        let body = multipart(&[("listing[title]", "Flat"), ("listing[category]", "Rooms")], Some(b"".as_slice()));
        let response = send(&h.ctx, post_multipart("/listings", "tok-a", body)).await;
        assert_eq!(location(&response), "/listings/new");
        assert_eq!(flash_of(&response), Some(Notice::error("Please upload an image!")));
        assert_eq!(h.store.count_listings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_with_bad_category_reports_store_error() {
        let h = harness(None).await;
        let body = multipart(
            &[("listing[title]", "Castle"), ("listing[category]", "Castles")],
            Some(b"jpeg".as_slice()),
        );
        let response = send(&h.ctx, post_multipart("/listings", "tok-a", body)).await;
        assert_eq!(location(&response), "/listings/new");
        let notice = flash_of(&response).unwrap();
        assert!(notice.message.starts_with("Error: "), "{}", notice.message);
        assert!(notice.message.contains("Castles"));
    }

    #[tokio::test]
    async fn page_displays_and_clears_pending_notice() {
        let h = harness(None).await;
        let request = axum::http::Request::get("/listings")
            .header(header::COOKIE, "wanderlust_flash=success%3AHello")
            .body(Body::empty())
            .unwrap();
        let response = send(&h.ctx, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let cleared = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cleared.contains("Max-Age=0"));
        let page = json_body(response).await;
        assert_eq!(page["flash"]["message"], "Hello");
        assert_eq!(page["flash"]["kind"], "success");
        assert!(page["current_user"].is_null());
    }

    #[tokio::test]
    async fn show_unknown_or_malformed_id_redirects() {
        let h = harness(None).await;
        for uri in ["/listings/not-a-uuid", "/listings/3f1e8a2c-0f3c-4f0e-9a3c-7d2b1c0e9f11"] {
            let response = send(&h.ctx, get(uri, None)).await;
            assert_eq!(location(&response), "/listings");
            assert_eq!(
                flash_of(&response),
                Some(Notice::error("Listing you requested for does not exist!"))
            );
        }
    }

    #[tokio::test]
    async fn only_owner_may_delete_via_method_override() {
        let h = harness(None).await;
        let listing = h
            .ctx
            .listings
            .create(&alice(), submission("Flat", "Rooms"), Some(upload()))
            .await
            .unwrap();
        let uri = format!("/listings/{}?_method=DELETE", listing.id);

        let denied = send(&h.ctx, post_form(&uri, "tok-b", "")).await;
        assert_eq!(location(&denied), format!("/listings/{}", listing.id));
        assert_eq!(
            flash_of(&denied),
            Some(Notice::error("You are not the owner of this listing"))
        );
        assert_eq!(h.store.count_listings().await.unwrap(), 1);

        let deleted = send(&h.ctx, post_form(&uri, "tok-a", "")).await;
        assert_eq!(location(&deleted), "/listings");
        assert_eq!(flash_of(&deleted), Some(Notice::success("Listing Deleted!")));
        assert_eq!(h.store.count_listings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn urlencoded_update_and_edit_form() {
        let h = harness(None).await;
        let listing = h
            .ctx
            .listings
            .create(&alice(), submission("Flat", "Rooms"), Some(upload()))
            .await
            .unwrap();
        let uri = format!("/listings/{}?_method=PUT", listing.id);
        let response = send(
            &h.ctx,
            post_form(&uri, "tok-a", "listing%5Btitle%5D=Penthouse&listing%5Bprice%5D=4000"),
        )
        .await;
        assert_eq!(location(&response), format!("/listings/{}", listing.id));
        assert_eq!(flash_of(&response), Some(Notice::success("Listing Updated!")));

        let edit = send(&h.ctx, get(&format!("/listings/{}/edit", listing.id), Some("tok-a"))).await;
        assert_eq!(edit.status(), StatusCode::OK);
        let page = json_body(edit).await;
        assert_eq!(page["listing"]["title"], "Penthouse");
        assert_eq!(page["listing"]["price"], 4000.0);
        assert_eq!(page["listing"]["location"], "Mumbai");
        assert_eq!(page["categories"].as_array().unwrap().len(), 11);
        assert!(page["original_image_url"].as_str().unwrap().starts_with("/uploads/"));
    }

    #[tokio::test]
    async fn update_with_invalid_fields_returns_to_edit_form() {
        let h = harness(None).await;
        let listing = h
            .ctx
            .listings
            .create(&alice(), submission("Flat", "Rooms"), Some(upload()))
            .await
            .unwrap();
        let uri = format!("/listings/{}?_method=PUT", listing.id);
        for body in ["listing%5Bcategory%5D=Castles", "listing%5Btitle%5D=+"] {
            let response = send(&h.ctx, post_form(&uri, "tok-a", body)).await;
            assert_eq!(location(&response), format!("/listings/{}/edit", listing.id));
            let notice = flash_of(&response).unwrap();
            assert_eq!(notice.kind, flash::NoticeKind::Error);
            assert!(notice.message.starts_with("Error: "), "{}", notice.message);
        }
        assert_eq!(h.store.find_listing(listing.id).await.unwrap().title, "Flat");
    }

    #[tokio::test]
    async fn new_form_offers_every_category() {
        let h = harness(None).await;
        let response = send(&h.ctx, get("/listings/new", Some("tok-a"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let page = json_body(response).await;
        assert_eq!(page["categories"].as_array().unwrap().len(), 11);
        assert_eq!(page["categories"][0], "Trending");
    }

    #[tokio::test]
    async fn signup_then_logout() {
        let h = harness(None).await;
        let response = send(
            &h.ctx,
            post_anonymous("/signup", None, "username=dana&email=dana%40example.com&password=pw"),
        )
        .await;
        assert_eq!(location(&response), "/listings");
        assert_eq!(flash_of(&response), Some(Notice::success("Welcome to Wanderlust!")));
        let session = set_cookie(&response, SESSION_COOKIE).unwrap();

        let page = json_body(send(&h.ctx, get_with_cookie("/listings/new", &session)).await).await;
        assert_eq!(page["current_user"]["username"], "dana");

        let again = send(
            &h.ctx,
            post_anonymous("/signup", None, "username=dana&email=d%40example.com&password=x"),
        )
        .await;
        assert_eq!(location(&again), "/signup");
        assert_eq!(
            flash_of(&again),
            Some(Notice::error("A user with the given username is already registered"))
        );

        let out = send(&h.ctx, get_with_cookie("/logout", &session)).await;
        assert_eq!(location(&out), "/listings");
        assert_eq!(set_cookie(&out, SESSION_COOKIE).as_deref(), Some("wanderlust_session="));
        let after = send(&h.ctx, get_with_cookie("/listings/new", &session)).await;
        assert_eq!(location(&after), "/login");
    }

    #[tokio::test]
    async fn login_returns_to_the_page_that_required_it() {
        let h = harness(None).await;
        h.ctx
            .accounts
            .signup(SignupForm {
                username: "dana".into(),
                email: "dana@example.com".into(),
                password: "pw".into(),
            })
            .await
            .unwrap();

        let turned_away = send(&h.ctx, get("/listings/new", None)).await;
        assert_eq!(location(&turned_away), "/login");
        let saved = set_cookie(&turned_away, RETURN_COOKIE).unwrap();

        let wrong = send(
            &h.ctx,
            post_anonymous("/login", Some(&saved), "username=dana&password=nope"),
        )
        .await;
        assert_eq!(location(&wrong), "/login");
        assert_eq!(
            flash_of(&wrong),
            Some(Notice::error("Password or username is incorrect"))
        );

        let right = send(
            &h.ctx,
            post_anonymous("/login", Some(&saved), "username=dana&password=pw"),
        )
        .await;
        assert_eq!(location(&right), "/listings/new");
        assert!(set_cookie(&right, SESSION_COOKIE).is_some());
        assert_eq!(set_cookie(&right, RETURN_COOKIE).as_deref(), Some("wanderlust_return="));
    }

    #[tokio::test]
    async fn review_lifecycle_with_author_gate() {
        let h = harness(None).await;
        let listing = h
            .ctx
            .listings
            .create(&alice(), submission("Flat", "Rooms"), Some(upload()))
            .await
            .unwrap();
        let reviews_uri = format!("/listings/{}/reviews", listing.id);

        let invalid = send(
            &h.ctx,
            post_form(&reviews_uri, "tok-b", "review%5Brating%5D=9&review%5Bcomment%5D=hm"),
        )
        .await;
        assert_eq!(flash_of(&invalid).unwrap().kind, flash::NoticeKind::Error);

        let created = send(
            &h.ctx,
            post_form(&reviews_uri, "tok-b", "review%5Brating%5D=4&review%5Bcomment%5D=Nice"),
        )
        .await;
        assert_eq!(flash_of(&created), Some(Notice::success("New Review Created!")));
        let review = h.store.find_listing(listing.id).await.unwrap().reviews[0];

        let page = json_body(send(&h.ctx, get(&format!("/listings/{}", listing.id), None)).await).await;
        assert_eq!(page["reviews"][0]["author"]["username"], "bob");
        assert_eq!(page["owner"]["username"], "alice");

        let delete_uri = format!("{reviews_uri}/{review}?_method=DELETE");
        let denied = send(&h.ctx, post_form(&delete_uri, "tok-a", "")).await;
        assert_eq!(
            flash_of(&denied),
            Some(Notice::error("You are not the author of this review"))
        );

        let deleted = send(&h.ctx, post_form(&delete_uri, "tok-b", "")).await;
        assert_eq!(flash_of(&deleted), Some(Notice::success("Review Deleted!")));
        assert!(h.store.find_listing(listing.id).await.unwrap().reviews.is_empty());
    }

    #[tokio::test]
    async fn admin_endpoint_fails_closed() {
        let h = harness(None).await;
        let request = axum::http::Request::post("/admin/fix-missing-uploads")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"secret":""}"#))
            .unwrap();
        let response = send(&h.ctx, request).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "ADMIN_SECRET not configured on server");
    }

    #[tokio::test]
    async fn admin_endpoint_checks_secret_and_reconciles() {
        let h = harness(Some("s3cret")).await;
        let listing = h
            .ctx
            .listings
            .create(&alice(), submission("Flat", "Rooms"), Some(upload()))
            .await
            .unwrap();
        let url = listing.image.unwrap().url;
        let path = crate::images::local_path(&h.ctx.config.public_dir, &url).unwrap();
        std::fs::remove_file(path).unwrap();

        let wrong = axum::http::Request::post("/admin/fix-missing-uploads")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("secret=nope"))
            .unwrap();
        assert_eq!(send(&h.ctx, wrong).await.status(), StatusCode::UNAUTHORIZED);

        let right = axum::http::Request::post("/admin/fix-missing-uploads")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"secret":"s3cret"}"#))
            .unwrap();
        let response = send(&h.ctx, right).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body, json!({"ok": true, "scanned": 1, "updated": 1}));
        let stored = h.store.find_listing(listing.id).await.unwrap();
        assert_eq!(stored.image.unwrap().url, crate::guard::PLACEHOLDER_IMAGE);
    }

    #[tokio::test]
    async fn serves_uploaded_files_from_public_dir() {
        let h = harness(None).await;
        let listing = h
            .ctx
            .listings
            .create(&alice(), submission("Flat", "Rooms"), Some(upload()))
            .await
            .unwrap();
        let url = listing.image.unwrap().url;
        let response = send(&h.ctx, get(&url, None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"jpeg-bytes");
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_unavailable() {
        let h = harness(None).await;
        let response = send(&h.ctx, get("/metrics", None)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn method_override_only_applies_to_post() {
        let request = axum::http::Request::post("/listings/x?_method=put")
            .body(Body::empty())
            .unwrap();
        assert_eq!(override_method(request).method(), Method::PUT);
        let request = axum::http::Request::get("/listings/x?_method=DELETE")
            .body(Body::empty())
            .unwrap();
        assert_eq!(override_method(request).method(), Method::GET);
    }
}
