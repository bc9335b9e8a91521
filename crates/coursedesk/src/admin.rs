//! Admin-only views: quick stats and the new-user notice.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::error::StoreError;
use crate::store::RemoteStore;
use crate::types::{AuthUser, DocPath, UserRecord};

pub const NEW_USER_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("not signed in")]
    Unauthenticated,
    #[error("admin access required")]
    NotAdmin,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuickStats {
    pub users: usize,
    pub downloads: usize,
}

fn child_count(value: Option<Value>) -> usize {
    match value {
        Some(Value::Object(map)) => map.len(),
        Some(Value::Array(items)) => items.len(),
        _ => 0,
    }
}

pub async fn is_admin(store: &dyn RemoteStore, uid: &str) -> Result<bool, StoreError> {
    let record = store
        .once(&DocPath::user(uid))
        .await?
        .and_then(|v| serde_json::from_value::<UserRecord>(v).ok());
    Ok(record.map(|r| r.is_admin).unwrap_or(false))
}

async fn require_admin(store: &dyn RemoteStore, user: Option<&AuthUser>) -> Result<(), AdminError> {
    let user = user.ok_or(AdminError::Unauthenticated)?;
    if !is_admin(store, &user.uid).await? {
        debug!(uid = %user.uid, "admin view refused");
        return Err(AdminError::NotAdmin);
    }
    Ok(())
}

pub async fn quick_stats(
    store: &dyn RemoteStore,
    user: Option<&AuthUser>,
) -> Result<QuickStats, AdminError> {
    require_admin(store, user).await?;
    let users = child_count(store.once(&DocPath::users()).await?);
    let downloads = child_count(store.once(&DocPath::downloads()).await?);
    Ok(QuickStats { users, downloads })
}

/// Users whose `createdAt` is at or after `since_ms`.
pub async fn new_users_since(
    store: &dyn RemoteStore,
    user: Option<&AuthUser>,
    since_ms: i64,
) -> Result<usize, AdminError> {
    require_admin(store, user).await?;
    let count = match store.once(&DocPath::users()).await? {
        Some(Value::Object(users)) => users
            .values()
            .filter_map(|u| u.get("createdAt").and_then(Value::as_i64))
            .filter(|created| *created >= since_ms)
            .count(),
        _ => 0,
    };
    Ok(count)
}

pub fn new_users_message(count: usize) -> Option<String> {
    (count > 0).then(|| format!("{} new user(s) registered in last 24 hours!", count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn user(uid: &str) -> AuthUser {
        AuthUser {
            uid: uid.to_string(),
            email: format!("{}@uni.edu", uid),
            display_name: None,
            photo_url: None,
            email_verified: true,
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::with_data(json!({
            "users": {
                "admin": { "isAdmin": true, "createdAt": 1_000 },
                "u1": { "createdAt": 5_000 },
                "u2": { "createdAt": 9_000 },
                "u3": { "name": "no timestamp" }
            },
            "downloads": { "k1": { "courseName": "B" }, "k2": { "courseName": "A" } }
        }))
    }

    #[tokio::test]
    async fn test_is_admin() {
        let store = store();
        assert!(is_admin(&store, "admin").await.unwrap());
        assert!(!is_admin(&store, "u1").await.unwrap());
        assert!(!is_admin(&store, "missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_quick_stats() {
        let store = store();
        let stats = quick_stats(&store, Some(&user("admin"))).await.unwrap();
        assert_eq!(stats, QuickStats { users: 4, downloads: 2 });
    }

    #[tokio::test]
    async fn test_non_admin_refused() {
        let store = store();
        assert!(matches!(
            quick_stats(&store, Some(&user("u1"))).await,
            Err(AdminError::NotAdmin)
        ));
        assert!(matches!(
            quick_stats(&store, None).await,
            Err(AdminError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_new_users_since() {
        let store = store();
        let count = new_users_since(&store, Some(&user("admin")), 5_000).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            new_users_message(count).unwrap(),
            "2 new user(s) registered in last 24 hours!"
        );
        assert!(new_users_message(0).is_none());
    }
}
