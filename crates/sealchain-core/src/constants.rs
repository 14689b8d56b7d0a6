/// Length of a lowercase hex SHA-256 digest.
pub const HASH_HEX_SIZE: usize = 64;
pub const DEFAULT_DIFFICULTY: u32 = 2;
pub const GENESIS_PREVIOUS_HASH: &str = "0";
pub const GENESIS_DATA: &str = "SEALCHAIN-GENESIS";
/// Nonces tried between two looks at a cancel token.
pub const CANCEL_POLL_INTERVAL: u64 = 4096;
/// Nonces handed to the rayon pool per round of a parallel search.
pub const PARALLEL_ROUND_SIZE: u64 = CANCEL_POLL_INTERVAL * 16;
