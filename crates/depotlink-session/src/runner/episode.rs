//! Retry episode - bookkeeping for one logical operation

use depotlink_core::ErrorKind;
use uuid::Uuid;

/// Per-call retry state, created when an operation starts and dropped when
/// it returns.
#[derive(Debug, Clone)]
pub struct RetryEpisode {
    id: String,
    attempt: u32,
    retries: u32,
    max_retries: u32,
    last_error: Option<ErrorKind>,
    reauthenticated: bool,
    awaited_notice: bool,
}

impl RetryEpisode {
    pub fn new(max_retries: u32) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            id: id[..8].to_string(),
            attempt: 0,
            retries: 0,
            max_retries,
            last_error: None,
            reauthenticated: false,
            awaited_notice: false,
        }
    }

    /// Short id used to correlate log lines of one operation
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Zero-based index of the attempt currently running
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn record(&mut self, kind: ErrorKind) {
        self.last_error = Some(kind);
    }

    /// Claim one retry. `false` once the episode has used them all.
    pub fn try_retry(&mut self) -> bool {
        if self.retries >= self.max_retries {
            return false;
        }
        self.retries += 1;
        self.attempt += 1;
        true
    }

    pub fn reauthenticated(&self) -> bool {
        self.reauthenticated
    }

    pub fn mark_reauthenticated(&mut self) {
        self.reauthenticated = true;
    }

    /// Whether this episode already waited for a re-login notice to resolve
    pub fn awaited_notice(&self) -> bool {
        self.awaited_notice
    }

    pub fn mark_awaited_notice(&mut self) {
        self.awaited_notice = true;
    }
}
