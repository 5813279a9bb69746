//! Timestamped status log shown alongside the conversation

use chrono::{DateTime, Local};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEntry {
    pub at: DateTime<Local>,
    pub level: StatusLevel,
    pub message: String,
}

impl StatusEntry {
    pub fn new(level: StatusLevel, message: impl Into<String>) -> Self {
        Self {
            at: Local::now(),
            level,
            message: message.into(),
        }
    }

    /// `[HH:MM:SS] message` as rendered in the status panel
    pub fn render(&self) -> String {
        format!("[{}] {}", self.at.format("%H:%M:%S"), self.message)
    }
}

/// Bounded log; the oldest entries are dropped once `capacity` is reached
#[derive(Debug, Clone)]
pub struct StatusLog {
    entries: Vec<StatusEntry>,
    capacity: usize,
}

impl Default for StatusLog {
    fn default() -> Self {
        Self::with_capacity(200)
    }
}

impl StatusLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record an entry and mirror it to the log facade
    pub fn push(&mut self, level: StatusLevel, message: impl Into<String>) -> StatusEntry {
        let entry = StatusEntry::new(level, message);
        match level {
            StatusLevel::Info => log::info!("Status: {}", entry.message),
            StatusLevel::Warning => log::warn!("Status: {}", entry.message),
            StatusLevel::Error => log::error!("Status: {}", entry.message),
        }
        if self.entries.len() >= self.capacity {
            self.entries.remove(0);
        }
        self.entries.push(entry.clone());
        entry
    }

    pub fn entries(&self) -> &[StatusEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&StatusEntry> {
        self.entries.last()
    }
}
