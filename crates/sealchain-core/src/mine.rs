use crate::{
    constants::{CANCEL_POLL_INTERVAL, PARALLEL_ROUND_SIZE},
    pow::meets_difficulty,
    Block, ChainError, NonceSearch, Result,
};
use rayon::prelude::*;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{info, warn};

/// Shared stop signal for a proof-of-work search, optionally with a deadline.
/// Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

enum Probe {
    Miss,
    Found(u64, String),
    Cancelled(u64),
    Failed(ChainError),
}

/// Searches nonces in parallel and returns the lowest qualifying one, so the
/// result is the same as the sequential [`crate::pow::proof_of_work`].
/// The winning nonce is left on the block.
///
/// The nonce space is walked in rounds of [`PARALLEL_ROUND_SIZE`] nonces so
/// every thread works on low nonces; the first round with a hit ends the search.
pub fn proof_of_work_parallel<T: Serialize>(
    block: &mut Block<T>,
    difficulty: u32,
    cancel: &CancelToken,
) -> Result<String> {
    block.nonce = 0;
    let search = NonceSearch::new(block)?;

    let mut base = 0u64;
    let probe = loop {
        let len = PARALLEL_ROUND_SIZE.min(u64::MAX - base);
        if len == 0 {
            break None;
        }
        match search_round(&search, base, len, difficulty, cancel) {
            Some(probe) => break Some(probe),
            None => base += len,
        }
    };

    match probe {
        Some(Probe::Found(nonce, hash)) => {
            block.nonce = nonce;
            info!(
                "Mined block {} with nonce {} and hash {}",
                block.index, nonce, hash
            );
            Ok(hash)
        }
        Some(Probe::Cancelled(nonce)) => {
            warn!(index = block.index, nonce, "parallel proof of work cancelled");
            Err(ChainError::Cancelled { nonce })
        }
        Some(Probe::Failed(e)) => Err(e),
        Some(Probe::Miss) | None => Err(ChainError::NonceSpaceExhausted),
    }
}

/// Scans `base..base + len` across the rayon pool. Returns the first probe
/// that is not a miss, by nonce order.
fn search_round(
    search: &NonceSearch,
    base: u64,
    len: u64,
    difficulty: u32,
    cancel: &CancelToken,
) -> Option<Probe> {
    // each thread owns a copy of the template
    (0..len)
        .into_par_iter()
        .map_init(
            || search.clone(),
            |search, offset| {
                let nonce = base + offset;
                if nonce % CANCEL_POLL_INTERVAL == 0 && cancel.is_cancelled() {
                    return Probe::Cancelled(nonce);
                }
                match search.hash_at(nonce) {
                    Ok(hash) if meets_difficulty(&hash, difficulty) => Probe::Found(nonce, hash),
                    Ok(_) => Probe::Miss,
                    Err(e) => Probe::Failed(e),
                }
            },
        )
        .find_first(|probe| !matches!(probe, Probe::Miss))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pow;

    fn block() -> Block<u32> {
        Block::new(4, vec![1, 2, 3], 1_700_000_000_000, "00abc", "parallel")
    }

    #[test]
    fn parallel_matches_sequential_nonce() {
        let mut sequential = block();
        let mut parallel = block();
        let seq_hash = pow::proof_of_work(&mut sequential, 3).unwrap();
        let par_hash = proof_of_work_parallel(&mut parallel, 3, &CancelToken::new()).unwrap();
        assert_eq!(seq_hash, par_hash);
        assert_eq!(sequential.nonce, parallel.nonce);
        assert_eq!(par_hash, parallel.compute_hash().unwrap());
    }

    #[test]
    fn parallel_respects_cancellation() {
        let mut b = block();
        let token = CancelToken::new();
        token.cancel();
        let err = proof_of_work_parallel(&mut b, 64, &token).unwrap_err();
        assert!(matches!(err, ChainError::Cancelled { .. }));
    }

    #[test]
    fn expired_deadline_cancels() {
        let token = CancelToken::with_deadline(Instant::now());
        assert!(token.is_cancelled());
        let mut b = block();
        let err = pow::proof_of_work_cancellable(&mut b, 64, &token).unwrap_err();
        assert!(matches!(err, ChainError::Cancelled { nonce: 0 }));
    }

    #[test]
    fn parallel_matches_sequential_on_a_wide_pool() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        for i in 0..3u32 {
            let mut sequential = Block::new(u64::from(i) + 1, vec![i], 1_700_000_000_000, "00abc", "wide");
            let mut parallel = sequential.clone();
            let seq_hash = pow::proof_of_work(&mut sequential, 3).unwrap();
            let par_hash = pool
                .install(|| proof_of_work_parallel(&mut parallel, 3, &CancelToken::new()))
                .unwrap();
            assert_eq!(seq_hash, par_hash);
            assert_eq!(sequential.nonce, parallel.nonce);
        }
    }

    #[test]
    fn later_round_finds_first_nonce_past_its_base() {
        let b = block();
        let search = NonceSearch::new(&b).unwrap();
        let base = PARALLEL_ROUND_SIZE * 3 + 17;

        let mut scan = search.clone();
        let expected = (base..)
            .find(|nonce| pow::meets_difficulty(&scan.hash_at(*nonce).unwrap(), 2))
            .unwrap();

        match search_round(&search, base, PARALLEL_ROUND_SIZE, 2, &CancelToken::new()) {
            Some(Probe::Found(nonce, hash)) => {
                assert_eq!(nonce, expected);
                assert!(hash.starts_with("00"));
            }
            _ => panic!("round starting at {base} found nothing"),
        }
    }

    #[test]
    fn round_without_hit_is_a_miss() {
        let search = NonceSearch::new(&block()).unwrap();
        assert!(search_round(&search, 0, 64, 64, &CancelToken::new()).is_none());
    }

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::with_timeout(Duration::from_secs(3600));
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
