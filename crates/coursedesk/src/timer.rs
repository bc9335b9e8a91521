//! Pomodoro countdown and the study statistics it feeds.

use serde_json::Value;
use tokio::sync::watch;

use crate::error::SyncError;
use crate::sync::{Persist, SyncedField, Synchronizer};
use crate::types::{AuthUser, DocPath, TimerStats, FOCUS_THRESHOLD_MINUTES};

pub const FIELD: &str = "timerStats";

/// Preset lengths offered by the page, in minutes
pub const PRESETS: [u64; 4] = [25, 50, 5, 15];

pub const DEFAULT_PRESET: u64 = 25;

/// Longest countdown accepted from callers, in minutes
pub const MAX_MINUTES: u64 = 24 * 60;

/// Whether `minutes` is an acceptable countdown length.
pub fn is_valid_length(minutes: u64) -> bool {
    (1..=MAX_MINUTES).contains(&minutes)
}

/// Circumference of the progress ring, in stroke units
pub const RING_CIRCUMFERENCE: f64 = 691.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Focus,
    Break,
}

impl Phase {
    pub fn of(minutes: u64) -> Self {
        if minutes >= FOCUS_THRESHOLD_MINUTES {
            Phase::Focus
        } else {
            Phase::Break
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Focus => "Focus Time",
            Phase::Break => "Break Time",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The timer is paused; nothing changed
    Idle,
    Running { remaining_secs: u64 },
    /// The countdown reached zero and the timer paused itself
    Completed { minutes: u64 },
}

/// One-second resolution countdown. Driven by calling [`PomodoroTimer::tick`]
/// once per second.
#[derive(Debug, Clone, PartialEq)]
pub struct PomodoroTimer {
    preset_minutes: u64,
    remaining_secs: u64,
    running: bool,
}

impl PomodoroTimer {
    pub fn new(preset_minutes: u64) -> Self {
        Self {
            preset_minutes,
            remaining_secs: preset_minutes.saturating_mul(60),
            running: false,
        }
    }

    /// Switch preset. Pauses and rewinds to the full length.
    pub fn select(&mut self, minutes: u64) {
        self.preset_minutes = minutes;
        self.reset();
    }

    /// Start counting down. Returns `false` if already running.
    pub fn start(&mut self) -> bool {
        if self.running {
            return false;
        }
        if self.remaining_secs == 0 {
            self.remaining_secs = self.total_secs();
        }
        self.running = true;
        true
    }

    pub fn pause(&mut self) {
        self.running = false;
    }

    pub fn reset(&mut self) {
        self.pause();
        self.remaining_secs = self.total_secs();
    }

    fn total_secs(&self) -> u64 {
        self.preset_minutes.saturating_mul(60)
    }

    pub fn tick(&mut self) -> Tick {
        if !self.running {
            return Tick::Idle;
        }
        self.remaining_secs = self.remaining_secs.saturating_sub(1);
        if self.remaining_secs == 0 {
            self.pause();
            return Tick::Completed {
                minutes: self.preset_minutes,
            };
        }
        Tick::Running {
            remaining_secs: self.remaining_secs,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn preset_minutes(&self) -> u64 {
        self.preset_minutes
    }

    pub fn remaining_secs(&self) -> u64 {
        self.remaining_secs
    }

    pub fn phase(&self) -> Phase {
        Phase::of(self.preset_minutes)
    }

    /// Remaining time as `MM:SS`
    pub fn display(&self) -> String {
        format!("{:02}:{:02}", self.remaining_secs / 60, self.remaining_secs % 60)
    }

    /// Stroke offset of the progress ring: 0 when full, the circumference when done.
    pub fn progress_offset(&self) -> f64 {
        let total = self.total_secs() as f64;
        if total == 0.0 {
            return RING_CIRCUMFERENCE;
        }
        RING_CIRCUMFERENCE - (self.remaining_secs as f64 / total) * RING_CIRCUMFERENCE
    }
}

impl Default for PomodoroTimer {
    fn default() -> Self {
        Self::new(DEFAULT_PRESET)
    }
}

fn decode(raw: Option<Value>) -> TimerStats {
    raw.and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// `sessionsCompleted` and `totalMinutes` on the user record.
///
/// Completions write the locally computed counters back with an update, so
/// two sessions of the same user racing each other keep the last write.
#[derive(Debug)]
pub struct TimerStatsFeature {
    field: SyncedField<TimerStats>,
}

impl TimerStatsFeature {
    pub fn new() -> Self {
        Self {
            field: SyncedField::new(FIELD),
        }
    }

    pub fn get(&self) -> TimerStats {
        self.field.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<TimerStats> {
        self.field.subscribe()
    }

    pub fn reset(&self) {
        self.field.reset();
    }

    /// Load counters from `users/{uid}`; missing or unreadable counters are zero.
    pub async fn load(
        &self,
        sync: &Synchronizer,
        user: &AuthUser,
    ) -> Result<TimerStats, SyncError> {
        sync.hydrate(&self.field, &DocPath::user(&user.uid), decode).await
    }

    /// Count a finished countdown of `minutes`.
    pub async fn record_completion(
        &self,
        sync: &Synchronizer,
        user: Option<&AuthUser>,
        minutes: u64,
    ) -> Result<TimerStats, SyncError> {
        let uid = user.ok_or(SyncError::Unauthenticated)?.uid.clone();
        sync.apply_and_persist(
            user,
            &self.field,
            Persist::Update(DocPath::user(&uid)),
            |stats| stats.after_completion(minutes),
            "Failed to save timer stats",
        )
        .await
    }
}

impl Default for TimerStatsFeature {
    fn default() -> Self {
        Self::new()
    }
}
