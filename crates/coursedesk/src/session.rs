//! Per-page session context.
//!
//! A [`PageSession`] owns everything one open page needs: sign-in state, the
//! synchronized fields, the toast queue and handles to the shared services.
//! Every user action of the page is a method here.

use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::admin::{self, AdminError, QuickStats, NEW_USER_WINDOW_MS};
use crate::auth::{
    greeting_name, last_login_update, new_profile, oauth_profile_updates, AuthOp, AuthState,
    AuthStateMachine, IdentityProvider, OAuthProvider, ProviderError, SignUpError,
};
use crate::downloads::{DownloadLink, DownloadTracker, Tracked};
use crate::error::SyncError;
use crate::favorites::{self, FavoriteChange, Favorites};
use crate::notify::Notifier;
use crate::relay::{ContactForm, OutboundMessage, Relay, RelayError};
use crate::store::RemoteStore;
use crate::sync::Synchronizer;
use crate::timer::TimerStatsFeature;
use crate::types::{name_from_email, AuthUser, DocPath, Stamp, TimerStats, UserRecord};

/// Process-wide collaborators shared by every session
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn RemoteStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub relay: Arc<dyn Relay>,
    pub contact_to: String,
    pub lookup_timeout: Duration,
}

pub struct PageSession {
    services: Services,
    notifier: Arc<Notifier>,
    sync: Arc<Synchronizer>,
    auth: AuthStateMachine,
    favorites: Favorites,
    timer_stats: TimerStatsFeature,
    downloads: DownloadTracker,
}

impl PageSession {
    pub fn new(services: Services) -> Self {
        let notifier = Arc::new(Notifier::new());
        let sync = Arc::new(Synchronizer::new(services.store.clone(), notifier.clone()));
        let downloads = DownloadTracker::new(services.lookup_timeout);
        Self {
            services,
            notifier,
            sync,
            auth: AuthStateMachine::new(),
            favorites: Favorites::new(),
            timer_stats: TimerStatsFeature::new(),
            downloads,
        }
    }

    pub fn current_user(&self) -> Option<AuthUser> {
        self.auth.current_user()
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth.current()
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn favorites(&self) -> &Favorites {
        &self.favorites
    }

    pub fn timer_stats(&self) -> &TimerStatsFeature {
        &self.timer_stats
    }

    /// Whether the favorite buttons are disabled by an outstanding write
    pub fn favorites_busy(&self) -> bool {
        self.current_user()
            .map(|u| self.sync.is_in_flight(&u.uid, favorites::FIELD))
            .unwrap_or(false)
    }

    // ========== authentication ==========

    /// Drive one sign-in attempt through the state machine.
    async fn run_sign_in<F, Fut>(
        &self,
        op: AuthOp,
        success: &str,
        attempt: F,
    ) -> Result<AuthUser, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AuthUser, ProviderError>>,
    {
        let previous = match self.auth.begin_sign_in() {
            Ok(previous) => previous,
            Err(e) => {
                self.notifier.error(e.message(op));
                return Err(e);
            }
        };

        match attempt().await {
            Ok(user) => {
                self.notifier.success(success);
                self.signed_in(user.clone()).await;
                Ok(user)
            }
            Err(e) => {
                warn!(op = ?op, error = %e, "authentication failed");
                self.auth.abort_sign_in(previous);
                self.notifier.error(e.message(op));
                Err(e)
            }
        }
    }

    /// Hydrate the synchronized fields and greet the user.
    async fn signed_in(&self, user: AuthUser) {
        self.auth.complete_sign_in(user.clone());
        info!(uid = %user.uid, "session signed in");

        let record_path = DocPath::user(&user.uid);
        let (_, _, record) = tokio::join!(
            self.favorites.load(&self.sync, &user),
            self.timer_stats.load(&self.sync, &user),
            self.services.store.once(&record_path),
        );

        let mut activity = Map::new();
        activity.insert("lastActivity".into(), json!(Stamp::server()));
        self.update_profile(&user.uid, activity).await;

        match record {
            Ok(raw) => {
                let record = raw.and_then(|v| serde_json::from_value::<UserRecord>(v).ok());
                let name = greeting_name(record.as_ref(), &user);
                self.notifier.info(format!("Welcome back, {}!", name));
            }
            Err(e) => warn!(uid = %user.uid, error = %e, "could not load user record"),
        }
    }

    async fn update_profile(&self, uid: &str, fields: Map<String, Value>) {
        if let Err(e) = self.services.store.update(&DocPath::user(uid), fields).await {
            warn!(uid = %uid, error = %e, "profile update failed");
        }
    }

    async fn set_profile(&self, uid: &str, profile: Value) {
        if let Err(e) = self.services.store.set(&DocPath::user(uid), profile).await {
            warn!(uid = %uid, error = %e, "profile write failed");
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser, ProviderError> {
        let email = email.trim();
        self.run_sign_in(AuthOp::SignIn, "Login successful!", || async {
            let user = self.services.identity.sign_in(email, password).await?;
            self.update_profile(&user.uid, last_login_update()).await;
            Ok(user)
        })
        .await
    }

    /// Create an account. `name` defaults to one derived from the email.
    pub async fn sign_up(
        &self,
        name: Option<&str>,
        email: &str,
        password: &str,
        confirm_password: &str,
    ) -> Result<AuthUser, SignUpError> {
        if password != confirm_password {
            self.notifier.error(SignUpError::PasswordMismatch.to_string());
            return Err(SignUpError::PasswordMismatch);
        }

        let email = email.trim();
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| name_from_email(email));

        let identity = &self.services.identity;
        let user = self
            .run_sign_in(
                AuthOp::SignUp,
                "Account created! Please verify your email.",
                || async {
                    let mut user = identity.sign_up(email, password).await?;
                    match identity.update_display_name(&user.uid, &name).await {
                        Ok(()) => user.display_name = Some(name.clone()),
                        Err(e) => warn!(uid = %user.uid, error = %e, "could not set display name"),
                    }
                    if let Err(e) = identity.send_email_verification(&user.uid).await {
                        warn!(uid = %user.uid, error = %e, "could not send verification email");
                    }
                    self.set_profile(&user.uid, new_profile(&user, &name)).await;
                    Ok(user)
                },
            )
            .await?;
        Ok(user)
    }

    /// Sign in through an OAuth provider, creating or repairing the profile.
    pub async fn sign_in_with_provider(
        &self,
        provider: OAuthProvider,
    ) -> Result<AuthUser, ProviderError> {
        let success = format!("{} sign-in successful!", provider.label());
        self.run_sign_in(AuthOp::OAuth, &success, || async {
            let user = self.services.identity.sign_in_with_popup(provider).await?;
            match self.services.store.once(&DocPath::user(&user.uid)).await {
                Ok(None) => {
                    self.set_profile(&user.uid, new_profile(&user, &user.fallback_name()))
                        .await
                }
                Ok(Some(raw)) => {
                    let existing: UserRecord = serde_json::from_value(raw).unwrap_or_default();
                    self.update_profile(&user.uid, oauth_profile_updates(&existing, &user))
                        .await
                }
                Err(e) => warn!(uid = %user.uid, error = %e, "could not read profile"),
            }
            Ok(user)
        })
        .await
    }

    pub async fn send_password_reset(&self, email: &str) -> Result<(), ProviderError> {
        match self.services.identity.send_password_reset(email.trim()).await {
            Ok(()) => {
                self.notifier.success("Password reset link sent to your email!");
                Ok(())
            }
            Err(e) => {
                self.notifier.error(e.message(AuthOp::PasswordReset));
                Err(e)
            }
        }
    }

    /// Sign out and drop the synchronized values.
    pub async fn sign_out(&self) -> Result<(), ProviderError> {
        let Some(user) = self.current_user() else {
            self.auth.sign_out();
            return Ok(());
        };

        if let Err(e) = self.services.identity.sign_out(&user.uid).await {
            warn!(uid = %user.uid, error = %e, "sign-out failed");
            self.notifier.error(e.message(AuthOp::SignOut));
            return Err(e);
        }

        self.auth.sign_out();
        self.favorites.reset();
        self.timer_stats.reset();
        info!(uid = %user.uid, "session signed out");
        self.notifier.success("Logged out successfully!");
        Ok(())
    }

    // ========== features ==========

    pub async fn toggle_favorite(&self, course: &str) -> Result<FavoriteChange, SyncError> {
        let user = self.current_user();
        self.favorites.toggle(&self.sync, user.as_ref(), course).await
    }

    /// A countdown of `minutes` finished. Signed-out users get the toast only.
    pub async fn complete_timer(&self, minutes: u64) -> Result<Option<TimerStats>, SyncError> {
        self.notifier.success("Timer completed! Great work!");
        match self.current_user() {
            Some(user) => self
                .timer_stats
                .record_completion(&self.sync, Some(&user), minutes)
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    pub fn track_download(&self, link: &DownloadLink) -> Tracked {
        self.downloads.track(&self.sync, self.current_user(), link)
    }

    pub async fn admin_stats(&self) -> Result<QuickStats, AdminError> {
        let user = self.current_user();
        admin::quick_stats(self.services.store.as_ref(), user.as_ref()).await
    }

    /// Notify an admin about users registered in the last 24 hours before `now_ms`.
    pub async fn check_new_users(&self, now_ms: i64) -> Result<usize, AdminError> {
        let user = self.current_user();
        let count = admin::new_users_since(
            self.services.store.as_ref(),
            user.as_ref(),
            now_ms - NEW_USER_WINDOW_MS,
        )
        .await?;
        if let Some(message) = admin::new_users_message(count) {
            self.notifier.info(message);
        }
        Ok(count)
    }

    // ========== forms ==========

    pub async fn send_contact(&self, form: ContactForm) -> Result<(), RelayError> {
        let result = match form.into_message(&self.services.contact_to) {
            Ok(message) => self.services.relay.send(message).await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(()) => self.notifier.success("Message sent successfully!"),
            Err(e) => {
                warn!(error = %e, "contact message not sent");
                self.notifier.error("Failed to send message. Please try again.");
            }
        }
        result
    }

    pub async fn subscribe_newsletter(&self, email: &str) -> Result<(), RelayError> {
        let result = match OutboundMessage::newsletter(email) {
            Ok(message) => self.services.relay.send(message).await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(()) => self.notifier.success("Successfully subscribed to newsletter!"),
            Err(e) => {
                warn!(error = %e, "newsletter signup failed");
                self.notifier.error("Failed to subscribe. Please try again.");
            }
        }
        result
    }

    /// Last resort for errors no feature handled.
    pub fn report_unexpected(&self, err: &dyn std::fmt::Display) {
        error!(error = %err, "unexpected error");
        self.notifier.fatal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::ScriptedIdentity;
    use crate::notify::FATAL_MESSAGE;
    use crate::relay::LogRelay;
    use crate::store::MemoryStore;

    struct Harness {
        store: Arc<MemoryStore>,
        identity: Arc<ScriptedIdentity>,
        relay: Arc<LogRelay>,
        session: PageSession,
    }

    fn harness_with(store: MemoryStore, identity: ScriptedIdentity) -> Harness {
        let store = Arc::new(store);
        let identity = Arc::new(identity);
        let relay = Arc::new(LogRelay::new());
        let session = PageSession::new(Services {
            store: store.clone(),
            identity: identity.clone(),
            relay: relay.clone(),
            contact_to: "desk@uni.edu".to_string(),
            lookup_timeout: Duration::from_secs(5),
        });
        Harness {
            store,
            identity,
            relay,
            session,
        }
    }

    fn harness() -> Harness {
        harness_with(
            MemoryStore::with_data(json!({
                "users": { "u1": {
                    "name": "Ada",
                    "favorites": ["EENG 101"],
                    "sessionsCompleted": 3,
                    "totalMinutes": 75
                } }
            })),
            ScriptedIdentity::new().with_account("ada@uni.edu", "secret1", "u1"),
        )
    }

    fn messages(session: &PageSession) -> Vec<String> {
        session.notifier().drain().into_iter().map(|t| t.message).collect()
    }

    #[tokio::test]
    async fn test_sign_in_hydrates_fields_and_greets() {
        let h = harness();

        let user = h.session.sign_in(" ada@uni.edu ", "secret1").await.unwrap();

        assert_eq!(user.uid, "u1");
        assert_eq!(h.session.auth_state(), AuthState::SignedIn(user));
        assert_eq!(h.session.favorites().list(), vec!["EENG 101"]);
        assert_eq!(h.session.timer_stats().get(), TimerStats::new(3, 75));
        assert_eq!(messages(&h.session), vec!["Login successful!", "Welcome back, Ada!"]);

        let record = h.store.value_at(&DocPath::user("u1")).unwrap();
        assert!(record["lastLogin"].as_i64().is_some());
        assert!(record["lastActivity"].as_i64().is_some());
    }

    #[tokio::test]
    async fn test_failed_sign_in_stays_signed_out() {
        let h = harness();

        let result = h.session.sign_in("ada@uni.edu", "nope").await;

        assert_eq!(result, Err(ProviderError::WrongPassword));
        assert_eq!(h.session.auth_state(), AuthState::SignedOut);
        assert_eq!(messages(&h.session), vec!["Incorrect password."]);
    }

    #[tokio::test]
    async fn test_unreadable_store_keeps_page_usable() {
        let h = harness();
        h.store.reject_reads(true);

        h.session.sign_in("ada@uni.edu", "secret1").await.unwrap();

        assert!(h.session.current_user().is_some());
        assert!(h.session.favorites().list().is_empty());
        assert_eq!(h.session.timer_stats().get(), TimerStats::default());
        assert!(messages(&h.session).contains(&"Failed to load favorites".to_string()));
    }

    #[tokio::test]
    async fn test_sign_up_password_mismatch() {
        let h = harness();

        let result = h
            .session
            .sign_up(None, "new@uni.edu", "secret1", "secret2")
            .await;

        assert!(matches!(result, Err(SignUpError::PasswordMismatch)));
        assert_eq!(messages(&h.session), vec!["Passwords do not match!"]);
        assert_eq!(h.store.write_count(), 0);
        assert_eq!(h.session.auth_state(), AuthState::SignedOut);
    }

    #[tokio::test]
    async fn test_sign_up_writes_full_profile() {
        let h = harness();

        let user = h
            .session
            .sign_up(None, "grace.hopper@uni.edu", "secret1", "secret1")
            .await
            .unwrap();

        assert_eq!(user.display_name.as_deref(), Some("Grace hopper"));
        assert_eq!(h.identity.verifications(), vec![user.uid.clone()]);
        assert_eq!(
            h.identity.display_name("grace.hopper@uni.edu").as_deref(),
            Some("Grace hopper")
        );

        let record = h.store.value_at(&DocPath::user(&user.uid)).unwrap();
        assert_eq!(record["name"], "Grace hopper");
        assert_eq!(record["email"], "grace.hopper@uni.edu");
        assert_eq!(record["isAdmin"], false);
        assert_eq!(record["sessionsCompleted"], 0);
        assert!(record["createdAt"].as_i64().is_some());

        assert_eq!(
            messages(&h.session),
            vec![
                "Account created! Please verify your email.",
                "Welcome back, Grace hopper!"
            ]
        );
    }

    #[tokio::test]
    async fn test_sign_up_provider_error_message() {
        let h = harness();
        let result = h
            .session
            .sign_up(Some("Ada"), "ada@uni.edu", "secret1", "secret1")
            .await;

        assert!(matches!(
            result,
            Err(SignUpError::Provider(ProviderError::EmailAlreadyInUse))
        ));
        assert_eq!(messages(&h.session), vec!["This email is already registered."]);
    }

    #[tokio::test]
    async fn test_oauth_creates_missing_profile() {
        let h = harness();
        h.identity.script_popup(Ok(AuthUser {
            uid: "g1".to_string(),
            email: "alan.t@gmail.com".to_string(),
            display_name: None,
            photo_url: Some("https://img/a.png".to_string()),
            email_verified: true,
        }));

        h.session
            .sign_in_with_provider(OAuthProvider::Google)
            .await
            .unwrap();

        let record = h.store.value_at(&DocPath::user("g1")).unwrap();
        assert_eq!(record["name"], "Alan t");
        assert_eq!(record["photoURL"], "https://img/a.png");
        assert_eq!(record["emailVerified"], true);
        assert_eq!(messages(&h.session)[0], "Google sign-in successful!");
    }

    #[tokio::test]
    async fn test_oauth_repairs_existing_profile() {
        let h = harness_with(
            MemoryStore::with_data(json!({
                "users": { "g1": { "name": "undefined", "favorites": ["EENG 202"] } }
            })),
            ScriptedIdentity::new(),
        );
        h.identity.script_popup(Ok(AuthUser {
            uid: "g1".to_string(),
            email: "alan@gmail.com".to_string(),
            display_name: Some("Alan Turing".to_string()),
            photo_url: None,
            email_verified: true,
        }));

        h.session
            .sign_in_with_provider(OAuthProvider::Google)
            .await
            .unwrap();

        let record = h.store.value_at(&DocPath::user("g1")).unwrap();
        assert_eq!(record["name"], "Alan Turing");
        assert_eq!(record["favorites"], json!(["EENG 202"]));
        assert_eq!(h.session.favorites().list(), vec!["EENG 202"]);
    }

    #[tokio::test]
    async fn test_oauth_cancelled() {
        let h = harness();
        let result = h.session.sign_in_with_provider(OAuthProvider::Google).await;

        assert_eq!(result, Err(ProviderError::PopupClosedByUser));
        assert_eq!(messages(&h.session), vec!["Sign-in cancelled."]);
        assert_eq!(h.session.auth_state(), AuthState::SignedOut);
    }

    #[tokio::test]
    async fn test_password_reset_messages() {
        let h = harness();
        h.session.send_password_reset("ada@uni.edu").await.unwrap();
        assert!(h.session.send_password_reset("who@uni.edu").await.is_err());
        assert_eq!(
            messages(&h.session),
            vec![
                "Password reset link sent to your email!",
                "No account found with this email."
            ]
        );
    }

    #[tokio::test]
    async fn test_sign_out_clears_fields() {
        let h = harness();
        h.session.sign_in("ada@uni.edu", "secret1").await.unwrap();
        h.session.notifier().drain();

        h.session.sign_out().await.unwrap();

        assert_eq!(h.session.auth_state(), AuthState::SignedOut);
        assert!(h.session.favorites().list().is_empty());
        assert_eq!(h.session.timer_stats().get(), TimerStats::default());
        assert_eq!(messages(&h.session), vec!["Logged out successfully!"]);

        let writes = h.store.write_count();
        let result = h.session.toggle_favorite("EENG 101").await;
        assert!(matches!(result, Err(SyncError::Unauthenticated)));
        assert_eq!(h.store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_sign_out_failure_keeps_session() {
        let h = harness();
        h.session.sign_in("ada@uni.edu", "secret1").await.unwrap();
        h.session.notifier().drain();
        h.identity.fail_next(ProviderError::NetworkRequestFailed);

        assert!(h.session.sign_out().await.is_err());
        assert!(h.session.current_user().is_some());
        assert_eq!(messages(&h.session), vec!["Logout failed. Please try again."]);
    }

    #[tokio::test]
    async fn test_favorites_and_timer_through_session() {
        let h = harness();
        h.session.sign_in("ada@uni.edu", "secret1").await.unwrap();

        let change = h.session.toggle_favorite("EENG 202").await.unwrap();
        assert_eq!(change, FavoriteChange::Added);
        assert!(!h.session.favorites_busy());

        let stats = h.session.complete_timer(25).await.unwrap();
        assert_eq!(stats, Some(TimerStats::new(4, 100)));

        let record = h.store.value_at(&DocPath::user("u1")).unwrap();
        assert_eq!(record["favorites"], json!(["EENG 101", "EENG 202"]));
        assert_eq!(record["totalMinutes"], 100);
    }

    #[tokio::test]
    async fn test_timer_signed_out_only_toasts() {
        let h = harness();
        assert_eq!(h.session.complete_timer(25).await.unwrap(), None);
        assert_eq!(h.store.write_count(), 0);
        assert_eq!(messages(&h.session), vec!["Timer completed! Great work!"]);
    }

    #[tokio::test]
    async fn test_download_through_session() {
        let h = harness();
        h.session.sign_in("ada@uni.edu", "secret1").await.unwrap();

        let tracked = h.session.track_download(&DownloadLink {
            url: "https://drive.google.com/file/d/x".to_string(),
            caption: Some("Signals and Systems".to_string()),
            ..Default::default()
        });
        let key = tracked.pending.unwrap().await.unwrap().unwrap();

        let event = h.store.value_at(&DocPath::downloads().child(&key)).unwrap();
        assert_eq!(event["courseName"], "Signals and Systems");
        assert_eq!(event["userName"], "Ada");
    }

    #[tokio::test]
    async fn test_admin_new_user_notice() {
        let now = 10 * NEW_USER_WINDOW_MS;
        let h = harness_with(
            MemoryStore::with_data(json!({
                "users": {
                    "u1": { "name": "Ada", "isAdmin": true, "createdAt": 0 },
                    "u2": { "createdAt": now - 1_000 }
                }
            })),
            ScriptedIdentity::new().with_account("ada@uni.edu", "secret1", "u1"),
        );
        assert!(matches!(
            h.session.check_new_users(now).await,
            Err(AdminError::Unauthenticated)
        ));

        h.session.sign_in("ada@uni.edu", "secret1").await.unwrap();
        h.session.notifier().drain();

        assert_eq!(h.session.check_new_users(now).await.unwrap(), 1);
        assert_eq!(
            messages(&h.session),
            vec!["1 new user(s) registered in last 24 hours!"]
        );
        assert_eq!(h.session.admin_stats().await.unwrap().users, 2);
    }

    #[tokio::test]
    async fn test_contact_and_newsletter() {
        let h = harness();
        h.session
            .send_contact(ContactForm {
                from_name: "Ada".to_string(),
                from_email: "ada@uni.edu".to_string(),
                subject: "Hi".to_string(),
                message: "Hello".to_string(),
            })
            .await
            .unwrap();
        assert!(h.session.send_contact(ContactForm::default()).await.is_err());
        h.session.subscribe_newsletter("ada@uni.edu").await.unwrap();

        assert_eq!(
            messages(&h.session),
            vec![
                "Message sent successfully!",
                "Failed to send message. Please try again.",
                "Successfully subscribed to newsletter!"
            ]
        );
        assert_eq!(h.relay.sent().len(), 2);
    }

    #[test]
    fn test_report_unexpected_shows_fatal_toast() {
        let h = harness();
        h.session.report_unexpected(&"boom");
        assert_eq!(messages(&h.session), vec![FATAL_MESSAGE]);
    }
}
