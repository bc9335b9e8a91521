//! Favorite courses, synchronized to `users/{uid}/favorites`.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::SyncError;
use crate::sync::{Persist, SyncedField, Synchronizer};
use crate::types::{AuthUser, DocPath};

pub const FIELD: &str = "favorites";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FavoriteChange {
    Added,
    Removed,
}

/// Read a stored favorites value.
///
/// Anything other than a list of strings is treated as no favorites; the
/// store may also hand back a list as an object keyed by index.
pub fn decode(raw: Option<Value>) -> Vec<String> {
    let items = match raw {
        Some(Value::Array(items)) => items,
        Some(Value::Object(map)) if map.keys().all(|k| k.parse::<usize>().is_ok()) => {
            let mut entries: Vec<(usize, Value)> = map
                .into_iter()
                .filter_map(|(k, v)| k.parse().ok().map(|i| (i, v)))
                .collect();
            entries.sort_by_key(|(i, _)| *i);
            entries.into_iter().map(|(_, v)| v).collect()
        }
        _ => return Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s),
            _ => None,
        })
        .collect()
}

/// Membership toggle of `course`, computed from `current`.
pub fn toggled(current: &[String], course: &str) -> (Vec<String>, FavoriteChange) {
    if current.iter().any(|c| c == course) {
        let next = current.iter().filter(|c| *c != course).cloned().collect();
        (next, FavoriteChange::Removed)
    } else {
        let mut next = current.to_vec();
        next.push(course.to_string());
        (next, FavoriteChange::Added)
    }
}

#[derive(Debug)]
pub struct Favorites {
    field: SyncedField<Vec<String>>,
}

impl Favorites {
    pub fn new() -> Self {
        Self {
            field: SyncedField::new(FIELD),
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.field.get()
    }

    pub fn contains(&self, course: &str) -> bool {
        self.field.get().iter().any(|c| c == course)
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.field.subscribe()
    }

    pub fn reset(&self) {
        self.field.reset();
    }

    /// Load the user's favorites. On failure nothing is marked.
    pub async fn load(
        &self,
        sync: &Synchronizer,
        user: &AuthUser,
    ) -> Result<Vec<String>, SyncError> {
        let path = DocPath::user_field(&user.uid, FIELD);
        let result = sync.hydrate(&self.field, &path, decode).await;
        if result.is_err() {
            sync.notifier().error("Failed to load favorites");
        }
        result
    }

    /// Add or remove `course`.
    pub async fn toggle(
        &self,
        sync: &Synchronizer,
        user: Option<&AuthUser>,
        course: &str,
    ) -> Result<FavoriteChange, SyncError> {
        let Some(user) = user else {
            sync.notifier().info("Please login to save favorites");
            return Err(SyncError::Unauthenticated);
        };

        let mut change = FavoriteChange::Added;
        sync.apply_and_persist(
            Some(user),
            &self.field,
            Persist::Set(DocPath::user_field(&user.uid, FIELD)),
            |current| {
                let (next, c) = toggled(current, course);
                change = c;
                next
            },
            "Failed to update favorites",
        )
        .await?;

        let message = match change {
            FavoriteChange::Added => format!("{} added to favorites", course),
            FavoriteChange::Removed => format!("{} removed from favorites", course),
        };
        sync.notifier().success(message);
        Ok(change)
    }
}

impl Default for Favorites {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn user() -> AuthUser {
        AuthUser {
            uid: "u1".to_string(),
            email: "ada@uni.edu".to_string(),
            display_name: None,
            photo_url: None,
            email_verified: true,
        }
    }

    fn setup(store: Arc<MemoryStore>) -> (Synchronizer, Arc<Notifier>) {
        let notifier = Arc::new(Notifier::new());
        (Synchronizer::new(store, notifier.clone()), notifier)
    }

    fn stored(store: &MemoryStore) -> Vec<String> {
        decode(store.value_at(&DocPath::user_field("u1", FIELD)))
    }

    #[test]
    fn test_decode_is_lenient() {
        assert_eq!(decode(Some(json!(["A", 3, "B"]))), vec!["A", "B"]);
        assert_eq!(decode(Some(json!({ "1": "B", "0": "A" }))), vec!["A", "B"]);
        assert!(decode(Some(json!("A"))).is_empty());
        assert!(decode(Some(json!({ "x": "A" }))).is_empty());
        assert!(decode(None).is_empty());
    }

    #[test]
    fn test_toggled() {
        let (added, change) = toggled(&["A".to_string()], "B");
        assert_eq!(added, vec!["A", "B"]);
        assert_eq!(change, FavoriteChange::Added);

        let (removed, change) = toggled(&added, "A");
        assert_eq!(removed, vec!["B"]);
        assert_eq!(change, FavoriteChange::Removed);
    }

    #[tokio::test]
    async fn test_sequential_toggles_match_local_and_remote() {
        let store = Arc::new(MemoryStore::new());
        let (sync, _notifier) = setup(store.clone());
        let favorites = Favorites::new();
        let u = user();

        let sequence = ["EENG 101", "EENG 202", "EENG 101", "EENG 303", "EENG 101"];
        let mut expected: Vec<String> = Vec::new();
        for course in sequence {
            favorites.toggle(&sync, Some(&u), course).await.unwrap();
            expected = toggled(&expected, course).0;

            assert_eq!(favorites.list(), expected);
            assert_eq!(stored(&store), expected);
        }
        assert_eq!(expected, vec!["EENG 202", "EENG 303", "EENG 101"]);
    }

    #[tokio::test]
    async fn test_toggle_toasts() {
        let store = Arc::new(MemoryStore::new());
        let (sync, notifier) = setup(store);
        let favorites = Favorites::new();
        let u = user();

        favorites.toggle(&sync, Some(&u), "EENG 101").await.unwrap();
        favorites.toggle(&sync, Some(&u), "EENG 101").await.unwrap();

        let messages: Vec<String> = notifier.drain().into_iter().map(|t| t.message).collect();
        assert_eq!(
            messages,
            vec!["EENG 101 added to favorites", "EENG 101 removed from favorites"]
        );
    }

    #[tokio::test]
    async fn test_failed_toggle_reverts() {
        let store = Arc::new(MemoryStore::with_data(json!({
            "users": { "u1": { "favorites": ["EENG 101"] } }
        })));
        let (sync, notifier) = setup(store.clone());
        let favorites = Favorites::new();
        let u = user();
        favorites.load(&sync, &u).await.unwrap();

        store.reject_writes(true);
        let result = favorites.toggle(&sync, Some(&u), "EENG 202").await;

        assert!(matches!(result, Err(SyncError::RemoteWriteFailed(_))));
        assert_eq!(favorites.list(), vec!["EENG 101"]);
        assert_eq!(stored(&store), vec!["EENG 101"]);
        assert!(!sync.is_in_flight("u1", FIELD));
        assert_eq!(notifier.drain()[0].message, "Failed to update favorites");
    }

    #[tokio::test]
    async fn test_toggle_signed_out() {
        let store = Arc::new(MemoryStore::new());
        let (sync, notifier) = setup(store.clone());
        let favorites = Favorites::new();

        let result = favorites.toggle(&sync, None, "EENG 101").await;

        assert!(matches!(result, Err(SyncError::Unauthenticated)));
        assert!(favorites.list().is_empty());
        assert_eq!(store.write_count(), 0);
        assert_eq!(notifier.drain()[0].message, "Please login to save favorites");
    }

    #[tokio::test]
    async fn test_load_failure_shows_no_favorites() {
        let store = Arc::new(MemoryStore::with_data(json!({
            "users": { "u1": { "favorites": ["EENG 101"] } }
        })));
        store.reject_reads(true);
        let (sync, notifier) = setup(store);
        let favorites = Favorites::new();

        assert!(favorites.load(&sync, &user()).await.is_err());
        assert!(!favorites.contains("EENG 101"));
        assert_eq!(notifier.drain()[0].message, "Failed to load favorites");
    }

    #[tokio::test]
    async fn test_double_submit_refused() {
        let store = Arc::new(MemoryStore::new());
        let (sync, _notifier) = setup(store.clone());
        let sync = Arc::new(sync);
        let favorites = Arc::new(Favorites::new());
        store.hold_writes();

        let first = {
            let sync = sync.clone();
            let favorites = favorites.clone();
            tokio::spawn(async move { favorites.toggle(&sync, Some(&user()), "EENG 101").await })
        };
        while !sync.is_in_flight("u1", FIELD) {
            tokio::task::yield_now().await;
        }

        let second = favorites.toggle(&sync, Some(&user()), "EENG 101").await;
        assert!(matches!(second, Err(SyncError::InFlight { .. })));
        assert!(favorites.contains("EENG 101"));

        store.release_writes();
        assert_eq!(first.await.unwrap().unwrap(), FavoriteChange::Added);
        assert_eq!(stored(&store), vec!["EENG 101"]);
        assert_eq!(store.write_count(), 1);
    }
}
