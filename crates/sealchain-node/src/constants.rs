pub(crate) const DEFAULT_MINE_TIMEOUT_SECS: u64 = 30;
pub(crate) const CORS_MAX_AGE_SECS: u64 = 3600;
