use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StoreError;

/// Minimum preset length (minutes) that counts as a focus session.
pub const FOCUS_THRESHOLD_MINUTES: u64 = 20;

/// The signed-in user as reported by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub uid: String,
    pub email: String,
    pub display_name: Option<String>,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
    pub email_verified: bool,
}

impl AuthUser {
    /// Best local guess at a human name: the provider display name if it is
    /// set, otherwise one derived from the email address.
    pub fn fallback_name(&self) -> String {
        match self.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => name_from_email(&self.email),
        }
    }
}

/// Derive a display name from an email address.
///
/// Takes the local part, uppercases the first character and turns `.` and
/// `_` into spaces, so `jane.doe@uni.edu` becomes `Jane doe`.
pub fn name_from_email(email: &str) -> String {
    let local = email.split('@').next().unwrap_or_default();
    let mut chars = local.chars();
    let capitalized = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => String::new(),
    };
    capitalized.replace(['.', '_'], " ")
}

/// A user document as stored under `users/{uid}`.
///
/// Every field is optional on read; records written by older clients may be
/// missing any of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserRecord {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
    pub created_at: Option<i64>,
    pub last_login: Option<i64>,
    pub last_activity: Option<i64>,
    pub email_verified: bool,
    pub is_admin: bool,
    pub favorites: Vec<String>,
    pub sessions_completed: u64,
    pub total_minutes: u64,
}

/// Study timer counters kept on the user record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimerStats {
    pub sessions_completed: u64,
    pub total_minutes: u64,
}

impl TimerStats {
    pub fn new(sessions_completed: u64, total_minutes: u64) -> Self {
        Self {
            sessions_completed,
            total_minutes,
        }
    }

    /// Counters after a finished countdown of `minutes`.
    ///
    /// Every countdown adds its minutes; only focus-length presets count as a
    /// completed session.
    pub fn after_completion(&self, minutes: u64) -> Self {
        let sessions_completed = if minutes >= FOCUS_THRESHOLD_MINUTES {
            self.sessions_completed.saturating_add(1)
        } else {
            self.sessions_completed
        };
        Self {
            sessions_completed,
            total_minutes: self.total_minutes.saturating_add(minutes),
        }
    }
}

/// Placeholder values the store fills in at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerValue {
    Timestamp,
}

/// A timestamp that is either already known or resolved by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stamp {
    Server {
        #[serde(rename = ".sv")]
        sv: ServerValue,
    },
    Millis(i64),
}

impl Stamp {
    pub fn server() -> Self {
        Stamp::Server {
            sv: ServerValue::Timestamp,
        }
    }
}

/// Append-only record of a tracked download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadEvent {
    pub user_id: String,
    pub user_email: String,
    pub user_name: String,
    pub course_name: String,
    pub course_code: Option<String>,
    pub timestamp: Stamp,
    pub url: String,
}

/// Identifies one synchronized field of one user; the unit of the in-flight guard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldKey {
    pub uid: String,
    pub field: &'static str,
}

impl FieldKey {
    pub fn new(uid: &str, field: &'static str) -> Self {
        Self {
            uid: uid.to_string(),
            field,
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.uid, self.field)
    }
}

/// A `/`-separated location in the document store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DocPath {
    segments: Vec<String>,
}

impl DocPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse and validate a path such as `users/abc/favorites`.
    ///
    /// Empty segments (leading, trailing or doubled slashes) are ignored.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let path = Self {
            segments: raw
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        };
        path.validate()?;
        Ok(path)
    }

    /// `users/{uid}`
    pub fn user(uid: &str) -> Self {
        Self::root().child("users").child(uid)
    }

    /// `users/{uid}/{field}`
    pub fn user_field(uid: &str, field: &str) -> Self {
        Self::user(uid).child(field)
    }

    pub fn downloads() -> Self {
        Self::root().child("downloads")
    }

    pub fn users() -> Self {
        Self::root().child("users")
    }

    pub fn child(mut self, segment: &str) -> Self {
        self.segments.push(segment.to_string());
        self
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Reject keys the document store cannot address.
    pub fn validate(&self) -> Result<(), StoreError> {
        const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']'];
        for segment in &self.segments {
            if segment.is_empty() || segment.contains(FORBIDDEN) {
                return Err(StoreError::InvalidPath(self.to_string()));
            }
        }
        Ok(())
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}
