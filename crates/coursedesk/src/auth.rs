//! Authentication: identity provider seam, provider errors and the
//! signed-in state machine.

use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{self, Account};
use crate::types::{name_from_email, AuthUser, Stamp, UserRecord};

/// Consecutive failed sign-ins before an account is locked out
pub const MAX_FAILED_ATTEMPTS: u32 = 5;

pub const MIN_PASSWORD_LEN: usize = 6;

/// Which user action a provider call belongs to. Error messages depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOp {
    SignIn,
    SignUp,
    OAuth,
    PasswordReset,
    SignOut,
}

impl AuthOp {
    /// Message shown when the provider error has no specific wording for this action
    pub fn fallback_message(self) -> &'static str {
        match self {
            AuthOp::SignIn => "Login failed. Please try again.",
            AuthOp::SignUp => "Signup failed. Please try again.",
            AuthOp::OAuth => "Sign-in failed. Please try again.",
            AuthOp::PasswordReset => "Failed to send reset email.",
            AuthOp::SignOut => "Logout failed. Please try again.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthProvider {
    Google,
}

impl OAuthProvider {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "google" => Some(OAuthProvider::Google),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            OAuthProvider::Google => "Google",
        }
    }
}

/// Errors reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("user not found")]
    UserNotFound,
    #[error("wrong password")]
    WrongPassword,
    #[error("invalid email")]
    InvalidEmail,
    #[error("user disabled")]
    UserDisabled,
    #[error("too many requests")]
    TooManyRequests,
    #[error("network request failed")]
    NetworkRequestFailed,
    #[error("email already in use")]
    EmailAlreadyInUse,
    #[error("weak password")]
    WeakPassword,
    #[error("popup closed by user")]
    PopupClosedByUser,
    #[error("popup blocked")]
    PopupBlocked,
    #[error("cancelled popup request")]
    CancelledPopupRequest,
    #[error("account exists with different credential")]
    AccountExistsWithDifferentCredential,
    #[error("operation not allowed")]
    OperationNotAllowed,
    /// The provider failed for a reason of its own
    #[error("internal provider error: {0}")]
    Internal(String),
    /// A code this client does not know
    #[error("unknown provider error: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// Map a provider error code such as `auth/user-not-found`.
    pub fn from_code(code: &str) -> Self {
        let bare = code.strip_prefix("auth/").unwrap_or(code);
        match bare {
            "user-not-found" => ProviderError::UserNotFound,
            "wrong-password" => ProviderError::WrongPassword,
            "invalid-email" => ProviderError::InvalidEmail,
            "user-disabled" => ProviderError::UserDisabled,
            "too-many-requests" => ProviderError::TooManyRequests,
            "network-request-failed" => ProviderError::NetworkRequestFailed,
            "email-already-in-use" => ProviderError::EmailAlreadyInUse,
            "weak-password" => ProviderError::WeakPassword,
            "popup-closed-by-user" => ProviderError::PopupClosedByUser,
            "popup-blocked" => ProviderError::PopupBlocked,
            "cancelled-popup-request" => ProviderError::CancelledPopupRequest,
            "account-exists-with-different-credential" => {
                ProviderError::AccountExistsWithDifferentCredential
            }
            "operation-not-allowed" => ProviderError::OperationNotAllowed,
            "internal-error" => ProviderError::Internal(String::new()),
            _ => ProviderError::Unknown(code.to_string()),
        }
    }

    /// User-facing message for this error during `op`.
    pub fn message(&self, op: AuthOp) -> &'static str {
        use AuthOp::*;
        use ProviderError::*;

        match (op, self) {
            (SignIn | PasswordReset, UserNotFound) => "No account found with this email.",
            (SignIn, WrongPassword) => "Incorrect password.",
            (SignIn | SignUp | PasswordReset, InvalidEmail) => "Invalid email address.",
            (SignIn, UserDisabled) => "This account has been disabled.",
            (SignIn, TooManyRequests) => "Too many failed attempts. Try again later.",
            (SignIn | OAuth | PasswordReset, NetworkRequestFailed) => {
                "Network error. Check your connection."
            }
            (SignUp, EmailAlreadyInUse) => "This email is already registered.",
            (SignUp, WeakPassword) => "Password is too weak. Use at least 6 characters.",
            (OAuth, PopupClosedByUser) => "Sign-in cancelled.",
            (OAuth, PopupBlocked) => "Popup blocked! Please allow popups.",
            (OAuth, CancelledPopupRequest) => "Another sign-in is in progress.",
            (OAuth, AccountExistsWithDifferentCredential) => {
                "Email already registered with different method."
            }
            _ => op.fallback_message(),
        }
    }
}

/// External identity provider.
///
/// Sign-in state is not reported by the provider; callers feed results into
/// an [`AuthStateMachine`].
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser, ProviderError>;

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, ProviderError>;

    async fn sign_in_with_popup(&self, provider: OAuthProvider) -> Result<AuthUser, ProviderError>;

    async fn update_display_name(&self, uid: &str, display_name: &str) -> Result<(), ProviderError>;

    async fn send_email_verification(&self, uid: &str) -> Result<(), ProviderError>;

    async fn send_password_reset(&self, email: &str) -> Result<(), ProviderError>;

    async fn sign_out(&self, uid: &str) -> Result<(), ProviderError>;
}

#[async_trait]
impl<P: IdentityProvider + ?Sized> IdentityProvider for Arc<P> {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser, ProviderError> {
        (**self).sign_in(email, password).await
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, ProviderError> {
        (**self).sign_up(email, password).await
    }

    async fn sign_in_with_popup(&self, provider: OAuthProvider) -> Result<AuthUser, ProviderError> {
        (**self).sign_in_with_popup(provider).await
    }

    async fn update_display_name(
        &self,
        uid: &str,
        display_name: &str,
    ) -> Result<(), ProviderError> {
        (**self).update_display_name(uid, display_name).await
    }

    async fn send_email_verification(&self, uid: &str) -> Result<(), ProviderError> {
        (**self).send_email_verification(uid).await
    }

    async fn send_password_reset(&self, email: &str) -> Result<(), ProviderError> {
        (**self).send_password_reset(email).await
    }

    async fn sign_out(&self, uid: &str) -> Result<(), ProviderError> {
        (**self).sign_out(uid).await
    }
}

#[derive(Debug, Error)]
pub enum SignUpError {
    #[error("Passwords do not match!")]
    PasswordMismatch,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

// ========== state machine ==========

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    SignedOut,
    SigningIn,
    SignedIn(AuthUser),
}

impl AuthState {
    pub fn user(&self) -> Option<&AuthUser> {
        match self {
            AuthState::SignedIn(user) => Some(user),
            _ => None,
        }
    }
}

/// Single source of the session's sign-in state. Feature modules observe
/// transitions through [`AuthStateMachine::subscribe`].
#[derive(Debug)]
pub struct AuthStateMachine {
    state: watch::Sender<AuthState>,
}

impl AuthStateMachine {
    pub fn new() -> Self {
        let (state, _) = watch::channel(AuthState::SignedOut);
        Self { state }
    }

    pub fn current(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn current_user(&self) -> Option<AuthUser> {
        self.state.borrow().user().cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Enter `SigningIn`, returning the state to restore if the attempt fails.
    ///
    /// Only one attempt may run at a time.
    pub fn begin_sign_in(&self) -> Result<AuthState, ProviderError> {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if *state == AuthState::SigningIn {
                return false;
            }
            previous = Some(std::mem::replace(state, AuthState::SigningIn));
            true
        });
        previous.ok_or(ProviderError::CancelledPopupRequest)
    }

    pub fn complete_sign_in(&self, user: AuthUser) {
        debug!(uid = %user.uid, "signed in");
        self.state.send_replace(AuthState::SignedIn(user));
    }

    pub fn abort_sign_in(&self, previous: AuthState) {
        self.state.send_replace(previous);
    }

    pub fn sign_out(&self) {
        self.state.send_replace(AuthState::SignedOut);
    }
}

impl Default for AuthStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ========== profile records ==========

/// Full user record written when an account is created.
pub fn new_profile(user: &AuthUser, name: &str) -> Value {
    json!({
        "name": name,
        "displayName": user.display_name.as_deref().unwrap_or(name),
        "email": user.email,
        "photoURL": user.photo_url,
        "createdAt": Stamp::server(),
        "lastLogin": Stamp::server(),
        "emailVerified": user.email_verified,
        "isAdmin": false,
        "favorites": [],
        "sessionsCompleted": 0,
        "totalMinutes": 0,
    })
}

/// Fields to merge into an existing record after an OAuth sign-in.
///
/// Repairs a missing, blank or literally `"undefined"` name and refreshes
/// the photo when the provider supplies one.
pub fn oauth_profile_updates(existing: &UserRecord, user: &AuthUser) -> Map<String, Value> {
    let mut updates = Map::new();
    updates.insert("lastLogin".into(), json!(Stamp::server()));
    updates.insert("emailVerified".into(), json!(user.email_verified));

    let name_missing = match existing.name.as_deref().map(str::trim) {
        None | Some("") | Some("undefined") => true,
        Some(_) => false,
    };
    if name_missing {
        updates.insert("name".into(), json!(user.fallback_name()));
    }

    if let Some(photo) = user.photo_url.as_deref().filter(|p| !p.is_empty()) {
        updates.insert("photoURL".into(), json!(photo));
    }
    updates
}

pub fn last_login_update() -> Map<String, Value> {
    let mut updates = Map::new();
    updates.insert("lastLogin".into(), json!(Stamp::server()));
    updates
}

/// Name to greet the user with: record name, then display name, then the
/// email local part.
pub fn greeting_name(record: Option<&UserRecord>, user: &AuthUser) -> String {
    let from_record = record
        .and_then(|r| r.name.as_deref())
        .map(str::trim)
        .filter(|n| !n.is_empty());
    let from_provider = user
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());

    match from_record.or(from_provider) {
        Some(name) => name.to_string(),
        None => user.email.split('@').next().unwrap_or_default().to_string(),
    }
}

// ========== password strength ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PasswordStrength {
    Weak,
    Medium,
    Strong,
}

impl PasswordStrength {
    const SYMBOLS: &'static str = "!@#$%^&*(),.?\":{}|<>";

    /// One point each for length >= 8, uppercase, lowercase, digit and symbol.
    pub fn score(password: &str) -> u8 {
        let checks = [
            password.chars().count() >= 8,
            password.chars().any(|c| c.is_uppercase()),
            password.chars().any(|c| c.is_lowercase()),
            password.chars().any(|c| c.is_ascii_digit()),
            password.chars().any(|c| Self::SYMBOLS.contains(c)),
        ];
        checks.iter().filter(|&&passed| passed).count() as u8
    }

    pub fn of(password: &str) -> Self {
        match Self::score(password) {
            0 | 1 => PasswordStrength::Weak,
            2 | 3 => PasswordStrength::Medium,
            _ => PasswordStrength::Strong,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PasswordStrength::Weak => "Weak",
            PasswordStrength::Medium => "Medium",
            PasswordStrength::Strong => "Strong",
        }
    }
}

// ========== local provider ==========

fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

fn internal(e: impl std::fmt::Display) -> ProviderError {
    ProviderError::Internal(e.to_string())
}

impl From<Account> for AuthUser {
    fn from(account: Account) -> Self {
        Self {
            uid: account.uid,
            email: account.email,
            display_name: account.display_name,
            photo_url: account.photo_url,
            email_verified: account.email_verified,
        }
    }
}

/// Identity provider backed by the `accounts` table.
///
/// Passwords are bcrypt hashed. Popup sign-in is not available.
#[derive(Debug, Clone)]
pub struct LocalIdentityProvider {
    conn: Arc<Mutex<Connection>>,
    bcrypt_cost: u32,
}

impl LocalIdentityProvider {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self::with_cost(conn, bcrypt::DEFAULT_COST)
    }

    pub fn with_cost(conn: Arc<Mutex<Connection>>, bcrypt_cost: u32) -> Self {
        Self { conn, bcrypt_cost }
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, ProviderError>
    where
        F: FnOnce(&Connection) -> Result<R, ProviderError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| internal("connection mutex poisoned"))?;
            f(&guard)
        })
        .await
        .map_err(internal)?
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser, ProviderError> {
        if !is_valid_email(email) {
            return Err(ProviderError::InvalidEmail);
        }
        let email = email.to_string();
        let password = password.to_string();

        self.blocking(move |conn| {
            let account = db::get_account_by_email(conn, &email)
                .map_err(internal)?
                .ok_or(ProviderError::UserNotFound)?;

            if account.disabled {
                return Err(ProviderError::UserDisabled);
            }
            if account.failed_attempts >= MAX_FAILED_ATTEMPTS {
                return Err(ProviderError::TooManyRequests);
            }

            let verified = match account.password_hash.as_deref() {
                Some(hash) => bcrypt::verify(&password, hash).map_err(internal)?,
                None => false,
            };
            if !verified {
                let attempts = db::record_failed_attempt(conn, &account.uid).map_err(internal)?;
                warn!(uid = %account.uid, attempts = attempts, "failed sign-in");
                return Err(ProviderError::WrongPassword);
            }

            db::reset_failed_attempts(conn, &account.uid).map_err(internal)?;
            Ok(AuthUser::from(account))
        })
        .await
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, ProviderError> {
        if !is_valid_email(email) {
            return Err(ProviderError::InvalidEmail);
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ProviderError::WeakPassword);
        }
        let email = email.to_string();
        let password = password.to_string();
        let cost = self.bcrypt_cost;

        self.blocking(move |conn| {
            if db::get_account_by_email(conn, &email)
                .map_err(internal)?
                .is_some()
            {
                return Err(ProviderError::EmailAlreadyInUse);
            }

            let account = Account {
                uid: Uuid::new_v4().simple().to_string(),
                email,
                password_hash: Some(bcrypt::hash(&password, cost).map_err(internal)?),
                display_name: None,
                photo_url: None,
                email_verified: false,
                disabled: false,
                failed_attempts: 0,
            };
            db::insert_account(conn, &account).map_err(internal)?;
            info!(uid = %account.uid, "account created");
            Ok(AuthUser::from(account))
        })
        .await
    }

    async fn sign_in_with_popup(&self, provider: OAuthProvider) -> Result<AuthUser, ProviderError> {
        debug!(provider = ?provider, "popup sign-in unavailable for local accounts");
        Err(ProviderError::OperationNotAllowed)
    }

    async fn update_display_name(
        &self,
        uid: &str,
        display_name: &str,
    ) -> Result<(), ProviderError> {
        let uid = uid.to_string();
        let display_name = display_name.to_string();
        self.blocking(move |conn| {
            if db::set_display_name(conn, &uid, &display_name).map_err(internal)? {
                Ok(())
            } else {
                Err(ProviderError::UserNotFound)
            }
        })
        .await
    }

    async fn send_email_verification(&self, uid: &str) -> Result<(), ProviderError> {
        let uid = uid.to_string();
        self.blocking(move |conn| {
            let account = db::get_account(conn, &uid)
                .map_err(internal)?
                .ok_or(ProviderError::UserNotFound)?;
            info!(uid = %account.uid, email = %account.email, "verification email requested");
            Ok(())
        })
        .await
    }

    async fn send_password_reset(&self, email: &str) -> Result<(), ProviderError> {
        if !is_valid_email(email) {
            return Err(ProviderError::InvalidEmail);
        }
        let email = email.to_string();
        self.blocking(move |conn| {
            let account = db::get_account_by_email(conn, &email)
                .map_err(internal)?
                .ok_or(ProviderError::UserNotFound)?;
            let token = Uuid::new_v4().to_string();
            db::insert_password_reset(conn, &token, &account.uid).map_err(internal)?;
            info!(uid = %account.uid, "password reset requested");
            Ok(())
        })
        .await
    }

    async fn sign_out(&self, uid: &str) -> Result<(), ProviderError> {
        debug!(uid = %uid, "signed out");
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted identity provider for session tests.

    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Default)]
    pub struct ScriptedIdentity {
        accounts: Mutex<HashMap<String, (String, AuthUser)>>,
        popup: Mutex<Option<Result<AuthUser, ProviderError>>>,
        fail_next: Mutex<Option<ProviderError>>,
        verifications: Mutex<Vec<String>>,
    }

    impl ScriptedIdentity {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_account(self, email: &str, password: &str, uid: &str) -> Self {
            let user = AuthUser {
                uid: uid.to_string(),
                email: email.to_string(),
                display_name: None,
                photo_url: None,
                email_verified: true,
            };
            self.accounts
                .lock()
                .unwrap()
                .insert(email.to_string(), (password.to_string(), user));
            self
        }

        /// Result of the next popup sign-in
        pub fn script_popup(&self, result: Result<AuthUser, ProviderError>) {
            *self.popup.lock().unwrap() = Some(result);
        }

        /// Make the next call of any kind fail with `error`
        pub fn fail_next(&self, error: ProviderError) {
            *self.fail_next.lock().unwrap() = Some(error);
        }

        pub fn verifications(&self) -> Vec<String> {
            self.verifications.lock().unwrap().clone()
        }

        pub fn display_name(&self, email: &str) -> Option<String> {
            self.accounts
                .lock()
                .unwrap()
                .get(email)
                .and_then(|(_, user)| user.display_name.clone())
        }

        fn take_failure(&self) -> Result<(), ProviderError> {
            match self.fail_next.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl IdentityProvider for ScriptedIdentity {
        async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser, ProviderError> {
            self.take_failure()?;
            let accounts = self.accounts.lock().unwrap();
            let (expected, user) = accounts.get(email).ok_or(ProviderError::UserNotFound)?;
            if expected != password {
                return Err(ProviderError::WrongPassword);
            }
            Ok(user.clone())
        }

        async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, ProviderError> {
            self.take_failure()?;
            let mut accounts = self.accounts.lock().unwrap();
            if accounts.contains_key(email) {
                return Err(ProviderError::EmailAlreadyInUse);
            }
            let user = AuthUser {
                uid: format!("uid-{}", accounts.len() + 1),
                email: email.to_string(),
                display_name: None,
                photo_url: None,
                email_verified: false,
            };
            accounts.insert(email.to_string(), (password.to_string(), user.clone()));
            Ok(user)
        }

        async fn sign_in_with_popup(
            &self,
            _provider: OAuthProvider,
        ) -> Result<AuthUser, ProviderError> {
            self.take_failure()?;
            self.popup
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(ProviderError::PopupClosedByUser))
        }

        async fn update_display_name(
            &self,
            uid: &str,
            display_name: &str,
        ) -> Result<(), ProviderError> {
            self.take_failure()?;
            let mut accounts = self.accounts.lock().unwrap();
            let (_, user) = accounts
                .values_mut()
                .find(|(_, u)| u.uid == uid)
                .ok_or(ProviderError::UserNotFound)?;
            user.display_name = Some(display_name.to_string());
            Ok(())
        }

        async fn send_email_verification(&self, uid: &str) -> Result<(), ProviderError> {
            self.take_failure()?;
            self.verifications.lock().unwrap().push(uid.to_string());
            Ok(())
        }

        async fn send_password_reset(&self, email: &str) -> Result<(), ProviderError> {
            self.take_failure()?;
            if self.accounts.lock().unwrap().contains_key(email) {
                Ok(())
            } else {
                Err(ProviderError::UserNotFound)
            }
        }

        async fn sign_out(&self, _uid: &str) -> Result<(), ProviderError> {
            self.take_failure()
        }
    }
}
