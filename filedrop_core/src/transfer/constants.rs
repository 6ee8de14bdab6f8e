/// Size of every binary chunk except a file's last one (16 KiB)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Sending pauses while more than this many bytes sit in the channel's
/// outbound buffer
pub const BACKPRESSURE_THRESHOLD: usize = 4 * CHUNK_SIZE;

/// How often a paused sender re-checks the outbound buffer (ms)
pub const BACKPRESSURE_POLL_MS: u64 = 10;

/// How long a sender waits for accept/decline (seconds)
pub const ACCEPT_TIMEOUT_SECS: u64 = 30;

/// Maximum file name length kept when saving
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Fallback MIME type for files without one
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
