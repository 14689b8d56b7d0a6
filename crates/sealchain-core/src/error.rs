use thiserror::Error;

/// Failures reported by chain operations. None of them leave a chain
/// partially mutated.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("nothing to mine: the unconfirmed transaction pool is empty")]
    EmptyPool,

    #[error("previous hash {found} does not match head hash {expected}")]
    LinkageMismatch { expected: String, found: String },

    #[error("invalid proof of work for block {index}")]
    InvalidProof { index: u64 },

    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("chain broken at block {index}: {reason}")]
    BrokenChain { index: u64, reason: String },

    #[error("proof-of-work search cancelled at nonce {nonce}")]
    Cancelled { nonce: u64 },

    #[error("nonce space exhausted without a qualifying hash")]
    NonceSpaceExhausted,

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChainError>;
