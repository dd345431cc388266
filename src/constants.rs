pub const DEFAULT_API_ENDPOINT: &str = "https://storage.googleapis.com";

/// Hosts outside this domain are treated as emulators and receive no credentials.
pub const GOOGLE_API_DOMAIN: &str = "googleapis.com";

pub const DEFAULT_RETRY_DELAY_MULTIPLIER: f64 = 2.0;

pub const DEFAULT_MAX_RETRY_DELAY_SECS: u64 = 64;

pub const DEFAULT_TOTAL_TIMEOUT_SECS: u64 = 600;

pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Number of leading bytes captured to detect content changes across resumed attempts.
pub const FIRST_CHUNK_FINGERPRINT_LEN: usize = 16;

pub const USER_AGENT: &str = concat!("gcs-resumable-upload-rs/", env!("CARGO_PKG_VERSION"));
