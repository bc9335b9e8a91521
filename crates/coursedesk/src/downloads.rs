//! Download tracking.
//!
//! Opening a course or book link always goes ahead. For signed-in users a
//! [`DownloadEvent`] is appended to `downloads` in the background; a failed
//! append is only logged.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::SyncError;
use crate::sync::Synchronizer;
use crate::types::{AuthUser, DocPath, DownloadEvent, Stamp};

pub const UNKNOWN_COURSE: &str = "Unknown";

const TRACKED_HOST: &str = "drive.google.com";

/// A clicked download link and what the page knows about its surroundings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadLink {
    pub url: String,
    /// Code and name of the course row the link sits in
    pub course_code: Option<String>,
    pub course_name: Option<String>,
    /// Caption title of the book the link belongs to
    pub caption: Option<String>,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// `"CODE - Name"` for a course row, else the caption title, else `"Unknown"`.
pub fn resolve_course_name(link: &DownloadLink) -> String {
    let code = non_blank(link.course_code.as_deref());
    let name = non_blank(link.course_name.as_deref());
    if let (Some(code), Some(name)) = (code, name) {
        return format!("{} - {}", code, name);
    }
    match non_blank(link.caption.as_deref()) {
        Some(caption) => caption.to_string(),
        None => UNKNOWN_COURSE.to_string(),
    }
}

pub fn is_tracked_url(url: &str) -> bool {
    url.contains(TRACKED_HOST)
}

/// Name recorded with a download: the stored profile name, else the
/// provider display name, else the email local part.
pub fn resolve_user_name(stored: Option<Value>, user: &AuthUser) -> String {
    let stored = match stored {
        Some(Value::String(name)) if !name.trim().is_empty() && name != "undefined" => {
            Some(name.trim().to_string())
        }
        _ => None,
    };
    stored
        .or_else(|| non_blank(user.display_name.as_deref()).map(str::to_string))
        .unwrap_or_else(|| user.email.split('@').next().unwrap_or_default().to_string())
}

/// Result of a click: what to show now, and the background append if any.
#[derive(Debug)]
pub struct Tracked {
    pub course_name: String,
    pub pending: Option<JoinHandle<Result<String, SyncError>>>,
}

#[derive(Debug, Clone)]
pub struct DownloadTracker {
    lookup_timeout: Duration,
}

impl DownloadTracker {
    pub fn new(lookup_timeout: Duration) -> Self {
        Self { lookup_timeout }
    }

    /// Handle a click on `link`. Never waits on the store.
    pub fn track(
        &self,
        sync: &Arc<Synchronizer>,
        user: Option<AuthUser>,
        link: &DownloadLink,
    ) -> Tracked {
        let course_name = resolve_course_name(link);
        sync.notifier().info(format!("Opening {}...", course_name));

        let pending = match user {
            Some(user) if is_tracked_url(&link.url) => {
                let sync = sync.clone();
                let timeout = self.lookup_timeout;
                let event_course = course_name.clone();
                let course_code = non_blank(link.course_code.as_deref()).map(str::to_string);
                let url = link.url.clone();

                Some(tokio::spawn(async move {
                    let stored = match sync
                        .read_within(&DocPath::user_field(&user.uid, "name"), timeout)
                        .await
                    {
                        Ok(value) => value,
                        Err(e) => {
                            debug!(uid = %user.uid, error = %e, "name lookup failed, using fallback");
                            None
                        }
                    };
                    let event = DownloadEvent {
                        user_id: user.uid.clone(),
                        user_email: user.email.clone(),
                        user_name: resolve_user_name(stored, &user),
                        course_name: event_course,
                        course_code,
                        timestamp: Stamp::server(),
                        url,
                    };
                    sync.append(Some(&user), &DocPath::downloads(), &event).await
                }))
            }
            _ => None,
        };

        Tracked {
            course_name,
            pending,
        }
    }
}
