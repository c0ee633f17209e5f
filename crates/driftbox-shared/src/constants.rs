/// Session code alphabet: 32 symbols, no 0/O/1/I
pub const SESSION_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Session code length in characters
pub const SESSION_CODE_LEN: usize = 5;

/// Default session time-to-live (5 hours)
pub const SESSION_TTL_MS: u64 = 5 * 60 * 60 * 1000;

/// Maximum number of files per session
pub const MAX_FILES_PER_SESSION: usize = 100;

/// Maximum number of messages per session
pub const MAX_MESSAGES_PER_SESSION: usize = 500;

/// Maximum message length in Unicode code points
pub const MAX_MESSAGE_CHARS: usize = 10_000;

/// Maximum single file size in bytes (100 MiB)
pub const MAX_FILE_SIZE_BYTES: u64 = 100 * 1024 * 1024;

/// Global byte budget across all sessions (2 GiB)
pub const MAX_TOTAL_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Chunk size for multi-part uploads (2 MiB)
pub const UPLOAD_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Maximum concurrent chunked uploads per session
pub const MAX_CONCURRENT_UPLOADS_PER_SESSION: usize = 5;

/// Uploads with no activity for this long are garbage collected (30 min)
pub const STALE_UPLOAD_THRESHOLD_MS: u64 = 30 * 60 * 1000;

/// Completed upload state is kept this long to absorb duplicate
/// complete calls before it is discarded (60 s)
pub const DRAINED_UPLOAD_RETENTION_MS: u64 = 60 * 1000;

/// Cleanup scheduler period (5 min)
pub const CLEANUP_INTERVAL_MS: u64 = 5 * 60 * 1000;

/// Client-side RPC acknowledgement deadline (30 s)
pub const RPC_TIMEOUT_MS: u64 = 30 * 1000;

/// Fraction of the byte budget at which cleanup logs a warning
pub const MEMORY_WARNING_THRESHOLD: f64 = 0.80;

/// Fraction of the byte budget at which cleanup evicts the oldest sessions
pub const MEMORY_CRITICAL_THRESHOLD: f64 = 0.95;

/// Number of oldest sessions evicted per critical-pressure tick
pub const EMERGENCY_EVICTION_COUNT: usize = 5;

/// Maximum filename length in bytes after sanitization
pub const MAX_FILENAME_BYTES: usize = 255;

/// Mime type recorded when the uploader supplied none
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Display name recorded when the sender supplied none
pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";

/// Default TCP port
pub const DEFAULT_PORT: u16 = 3000;

/// Default bind address
pub const DEFAULT_HOST: &str = "0.0.0.0";
