//! Session lifetime tracking.
//!
//! Tracked locally on each peer, independently of whatever retention the
//! rendezvous store applies.

use std::time::Duration;
use tokio::time::Instant;

/// Session codes expire after 10 minutes.
pub const SESSION_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy)]
pub struct SessionExpiry {
    expires_at: Instant,
}

impl SessionExpiry {
    pub fn start() -> Self {
        Self::with_ttl(SESSION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Format a remaining duration as `M:SS`.
pub fn format_remaining(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}
