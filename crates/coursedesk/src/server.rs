use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use notify_debouncer_mini::{new_debouncer, notify::RecursiveMode, DebounceEventResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admin::AdminError;
use crate::auth::{AuthOp, OAuthProvider, PasswordStrength, ProviderError, SignUpError};
use crate::downloads::DownloadLink;
use crate::error::SyncError;
use crate::html::{self, PageModel};
use crate::library::{self, Catalog, LibraryView, CATALOG_FILE};
use crate::notify::FATAL_MESSAGE;
use crate::relay::{ContactForm, RelayError};
use crate::session::{PageSession, Services};
use crate::store::now_millis;
use crate::timer::{self, PomodoroTimer, MAX_MINUTES};

/// Application state shared across requests
pub struct AppState {
    pub catalog: RwLock<Catalog>,
    pub sessions: RwLock<HashMap<Uuid, Arc<PageSession>>>,
    pub services: Services,
    pub data_dir: PathBuf,
}

fn bearer(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?
        .trim()
        .parse()
        .ok()
}

impl AppState {
    pub fn new(services: Services, catalog: Catalog, data_dir: PathBuf) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            sessions: RwLock::new(HashMap::new()),
            services,
            data_dir,
        }
    }

    async fn registered(&self, headers: &HeaderMap) -> Option<(Uuid, Arc<PageSession>)> {
        let id = bearer(headers)?;
        let sessions = self.sessions.read().await;
        sessions.get(&id).map(|session| (id, session.clone()))
    }

    /// The caller's session, or a signed-out one that lives for this request only.
    async fn session(&self, headers: &HeaderMap) -> Arc<PageSession> {
        match self.registered(headers).await {
            Some((_, session)) => session,
            None => Arc::new(PageSession::new(self.services.clone())),
        }
    }

    /// The caller's session, or a fresh one not yet registered.
    async fn session_for_sign_in(&self, headers: &HeaderMap) -> (Uuid, Arc<PageSession>) {
        match self.registered(headers).await {
            Some(found) => found,
            None => (
                Uuid::new_v4(),
                Arc::new(PageSession::new(self.services.clone())),
            ),
        }
    }

    async fn register(&self, id: Uuid, session: Arc<PageSession>) {
        let mut sessions = self.sessions.write().await;
        sessions.entry(id).or_insert(session);
        info!(sessions = sessions.len(), "session registered");
    }

    pub async fn reload_catalog(&self) -> anyhow::Result<()> {
        let new_catalog = library::load_catalog(&self.data_dir)?;
        let mut catalog = self.catalog.write().await;
        let old_books = catalog.books.len();
        *catalog = new_catalog;
        info!(
            courses = catalog.courses.len(),
            books = catalog.books.len(),
            change = catalog.books.len() as i64 - old_books as i64,
            "Catalog reloaded"
        );
        Ok(())
    }
}

// ========== errors ==========

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("{op:?} failed: {error}")]
    Provider { op: AuthOp, error: ProviderError },

    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn provider(op: AuthOp, error: ProviderError) -> Self {
        AppError::Provider { op, error }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Sync(e) => match e {
                SyncError::Unauthenticated => StatusCode::UNAUTHORIZED,
                SyncError::InFlight { .. } => StatusCode::CONFLICT,
                SyncError::RemoteWriteFailed(_) | SyncError::RemoteReadFailed(_) => {
                    StatusCode::BAD_GATEWAY
                }
                SyncError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            },
            AppError::Provider { error, .. } => match error {
                ProviderError::UserNotFound | ProviderError::WrongPassword => {
                    StatusCode::UNAUTHORIZED
                }
                ProviderError::UserDisabled => StatusCode::FORBIDDEN,
                ProviderError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
                ProviderError::EmailAlreadyInUse
                | ProviderError::CancelledPopupRequest
                | ProviderError::AccountExistsWithDifferentCredential => StatusCode::CONFLICT,
                ProviderError::InvalidEmail
                | ProviderError::WeakPassword
                | ProviderError::PopupClosedByUser
                | ProviderError::PopupBlocked
                | ProviderError::OperationNotAllowed => StatusCode::BAD_REQUEST,
                ProviderError::NetworkRequestFailed
                | ProviderError::Internal(_)
                | ProviderError::Unknown(_) => StatusCode::BAD_GATEWAY,
            },
            AppError::Admin(e) => match e {
                AdminError::Unauthenticated => StatusCode::UNAUTHORIZED,
                AdminError::NotAdmin => StatusCode::FORBIDDEN,
                AdminError::Store(_) => StatusCode::BAD_GATEWAY,
            },
            AppError::Relay(e) => match e {
                RelayError::MissingField(_) | RelayError::InvalidEmail(_) => {
                    StatusCode::BAD_REQUEST
                }
                RelayError::Unavailable(_) => StatusCode::BAD_GATEWAY,
            },
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> String {
        match self {
            AppError::Provider { op, error } => error.message(*op).to_string(),
            AppError::Internal(_) => FATAL_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }
}

impl From<SignUpError> for AppError {
    fn from(e: SignUpError) -> Self {
        match e {
            SignUpError::PasswordMismatch => {
                AppError::BadRequest(SignUpError::PasswordMismatch.to_string())
            }
            SignUpError::Provider(error) => AppError::provider(AuthOp::SignUp, error),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "unhandled error");
        } else {
            warn!(status = %status, error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, AppError>;

// ========== server ==========

pub fn router(state: Arc<AppState>) -> Router {
    let static_dir = state.data_dir.join("static");
    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/refresh", post(refresh_handler))
        .route("/api/auth/signup", post(signup_handler))
        .route("/api/auth/signin", post(signin_handler))
        .route("/api/auth/oauth", post(oauth_handler))
        .route("/api/auth/reset", post(reset_handler))
        .route("/api/auth/signout", post(signout_handler))
        .route("/api/auth/strength", post(strength_handler))
        .route("/api/me", get(me_handler))
        .route("/api/favorites", get(favorites_handler))
        .route("/api/favorites/{course}/toggle", post(toggle_favorite_handler))
        .route("/api/timer/stats", get(timer_stats_handler))
        .route("/api/timer/complete", post(timer_complete_handler))
        .route("/api/downloads", post(download_handler))
        .route("/api/library", get(library_handler))
        .route("/api/admin/stats", get(admin_stats_handler))
        .route("/api/contact", post(contact_handler))
        .route("/api/newsletter", post(newsletter_handler))
        .route("/api/toasts", get(toasts_handler))
        .nest_service("/static", ServeDir::new(static_dir))
        .with_state(state)
}

/// Start the web server with catalog watching
pub async fn serve(port: u16, data_dir: PathBuf, services: Services) -> anyhow::Result<()> {
    info!(dir = %data_dir.display(), "Loading catalog");
    let catalog = library::load_catalog(&data_dir)?;

    let state = Arc::new(AppState::new(services, catalog, data_dir));
    start_catalog_watcher(state.clone())?;

    let app = router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!(address = %addr, "Server running");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Reload the catalog whenever `catalog.json` in the data directory changes
fn start_catalog_watcher(state: Arc<AppState>) -> anyhow::Result<()> {
    let data_dir = state.data_dir.clone();

    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)?;
        info!(dir = %data_dir.display(), "Created data directory");
    }

    let (tx, mut rx) = tokio::sync::mpsc::channel(10);

    let watch_dir = data_dir.clone();
    std::thread::spawn(move || {
        let debouncer = new_debouncer(
            Duration::from_secs(2),
            move |result: DebounceEventResult| {
                if let Ok(events) = result {
                    let touched = events.iter().any(|e| {
                        e.path
                            .file_name()
                            .and_then(|n| n.to_str())
                            .map(|n| n == CATALOG_FILE)
                            .unwrap_or(false)
                    });

                    if touched {
                        let _ = tx.blocking_send(());
                    }
                }
            },
        );
        let mut debouncer = match debouncer {
            Ok(debouncer) => debouncer,
            Err(e) => {
                error!(error = %e, "Failed to create file watcher");
                return;
            }
        };

        if let Err(e) = debouncer
            .watcher()
            .watch(&watch_dir, RecursiveMode::NonRecursive)
        {
            error!(dir = %watch_dir.display(), error = %e, "Failed to watch directory");
            return;
        }

        // Keep the watcher alive
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    });

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            info!("Detected catalog change");
            if let Err(e) = state.reload_catalog().await {
                warn!(error = %e, "Failed to reload catalog");
            }
        }
    });

    Ok(())
}

// ========== page ==========

async fn index_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(view): Query<LibraryView>,
) -> Html<String> {
    let session = state.session(&headers).await;
    let catalog = state.catalog.read().await;
    let user = session.current_user();
    let favorites = session.favorites().list();
    let timer = PomodoroTimer::default();

    let markup = html::render_page(&PageModel {
        catalog: &catalog,
        view: &view,
        user: user.as_ref(),
        favorites: &favorites,
        stats: session.timer_stats().get(),
        timer: &timer,
    });
    Html(markup.into_string())
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let online = *state.services.store.connectivity().borrow();
    let catalog = state.catalog.read().await;
    let sessions = state.sessions.read().await.len();
    Json(json!({
        "online": online,
        "courses": catalog.courses.len(),
        "books": catalog.books.len(),
        "sessions": sessions,
    }))
}

/// Reload the catalog from disk (manual trigger)
async fn refresh_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    info!("Manual catalog refresh");
    state.reload_catalog().await?;
    let catalog = state.catalog.read().await;
    Ok(Json(json!({
        "courses": catalog.courses.len(),
        "books": catalog.books.len(),
    })))
}

// ========== auth ==========

#[derive(Debug, Deserialize)]
struct SignInRequest {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignUpRequest {
    name: Option<String>,
    email: String,
    password: String,
    confirm_password: String,
}

#[derive(Debug, Deserialize)]
struct OAuthRequest {
    provider: String,
}

#[derive(Debug, Deserialize)]
struct EmailRequest {
    email: String,
}

async fn signup_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SignUpRequest>,
) -> ApiResult {
    let (id, session) = state.session_for_sign_in(&headers).await;
    let user = session
        .sign_up(
            req.name.as_deref(),
            &req.email,
            &req.password,
            &req.confirm_password,
        )
        .await?;
    state.register(id, session).await;
    Ok(Json(json!({ "token": id, "user": user })))
}

async fn signin_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SignInRequest>,
) -> ApiResult {
    let (id, session) = state.session_for_sign_in(&headers).await;
    let user = session
        .sign_in(&req.email, &req.password)
        .await
        .map_err(|e| AppError::provider(AuthOp::SignIn, e))?;
    state.register(id, session).await;
    Ok(Json(json!({ "token": id, "user": user })))
}

async fn oauth_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<OAuthRequest>,
) -> ApiResult {
    let provider = OAuthProvider::parse(&req.provider)
        .ok_or_else(|| AppError::BadRequest(format!("Unknown provider: {}", req.provider)))?;
    let (id, session) = state.session_for_sign_in(&headers).await;
    let user = session
        .sign_in_with_provider(provider)
        .await
        .map_err(|e| AppError::provider(AuthOp::OAuth, e))?;
    state.register(id, session).await;
    Ok(Json(json!({ "token": id, "user": user })))
}

async fn reset_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<EmailRequest>,
) -> ApiResult {
    let session = state.session(&headers).await;
    session
        .send_password_reset(&req.email)
        .await
        .map_err(|e| AppError::provider(AuthOp::PasswordReset, e))?;
    Ok(Json(json!({ "ok": true })))
}

async fn signout_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let Some((id, session)) = state.registered(&headers).await else {
        return Ok(Json(json!({ "ok": true })));
    };
    session
        .sign_out()
        .await
        .map_err(|e| AppError::provider(AuthOp::SignOut, e))?;
    state.sessions.write().await.remove(&id);
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct PasswordRequest {
    password: String,
}

async fn strength_handler(Json(req): Json<PasswordRequest>) -> Json<Value> {
    let strength = PasswordStrength::of(&req.password);
    Json(json!({
        "score": PasswordStrength::score(&req.password),
        "label": strength.label(),
    }))
}

async fn me_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<Value> {
    let session = state.session(&headers).await;
    Json(json!({ "user": session.current_user() }))
}

// ========== features ==========

async fn favorites_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<Value> {
    let session = state.session(&headers).await;
    Json(json!({
        "favorites": session.favorites().list(),
        "busy": session.favorites_busy(),
    }))
}

async fn toggle_favorite_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(course): Path<String>,
) -> ApiResult {
    let session = state.session(&headers).await;
    let change = session.toggle_favorite(&course).await?;
    Ok(Json(json!({
        "change": change,
        "favorites": session.favorites().list(),
    })))
}

async fn timer_stats_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<Value> {
    let session = state.session(&headers).await;
    Json(json!({ "stats": session.timer_stats().get() }))
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    minutes: u64,
}

async fn timer_complete_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CompleteRequest>,
) -> ApiResult {
    if !timer::is_valid_length(req.minutes) {
        return Err(AppError::BadRequest(format!(
            "minutes must be between 1 and {MAX_MINUTES}"
        )));
    }
    let session = state.session(&headers).await;
    let stats = session.complete_timer(req.minutes).await?;
    Ok(Json(json!({ "stats": stats })))
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(link): Json<DownloadLink>,
) -> Json<Value> {
    let session = state.session(&headers).await;
    let tracked = session.track_download(&link);
    Json(json!({
        "courseName": tracked.course_name,
        "tracked": tracked.pending.is_some(),
    }))
}

async fn library_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<LibraryView>,
) -> Response {
    let catalog = state.catalog.read().await;
    let response = Json(view.snapshot(&catalog)).into_response();
    response
}

async fn admin_stats_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let session = state.session(&headers).await;
    let stats = session.admin_stats().await?;
    let new_users = session.check_new_users(now_millis()).await?;
    Ok(Json(json!({
        "users": stats.users,
        "downloads": stats.downloads,
        "newUsers": new_users,
    })))
}

// ========== forms ==========

async fn contact_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(form): Json<ContactForm>,
) -> ApiResult {
    let session = state.session(&headers).await;
    session.send_contact(form).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn newsletter_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<EmailRequest>,
) -> ApiResult {
    let session = state.session(&headers).await;
    session.subscribe_newsletter(&req.email).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn toasts_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<Value> {
    let session = state.session(&headers).await;
    Json(json!(session.notifier().drain()))
}
