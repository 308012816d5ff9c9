//! Cooperative proof-of-work search over a single candidate block.
//!
//! The search owns its candidate and mutates only the nonce. Work proceeds
//! in bounded chunks between yields so cancellation and other tasks make
//! progress on any executor flavor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use emberd_consensus::hash_meets_difficulty;
use emberd_primitives::Block;
use rand::RngCore;

/// Nonce trials between cooperative yields.
const TRIALS_PER_CHUNK: u32 = 100;

#[derive(Debug, Default)]
pub struct MinerHandle {
    cancelled: AtomicBool,
    finished: AtomicBool,
}

impl MinerHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Observed between chunks; the search then terminates `Cancelled`.
    /// Idempotent, and a no-op once a terminal state was reached.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MinerOutcome {
    Found(Block),
    Cancelled,
}

/// Runs until some nonce satisfies the candidate's difficulty or `cancel()`
/// is observed between chunks. Exactly one terminal outcome.
pub async fn search(mut block: Block, handle: Arc<MinerHandle>) -> MinerOutcome {
    loop {
        if handle.is_cancelled() {
            handle.finished.store(true, Ordering::SeqCst);
            return MinerOutcome::Cancelled;
        }
        {
            let mut rng = rand::thread_rng();
            for _ in 0..TRIALS_PER_CHUNK {
                rng.fill_bytes(&mut block.nonce);
                if hash_meets_difficulty(&block.hash(), block.difficulty) {
                    handle.finished.store(true, Ordering::SeqCst);
                    return MinerOutcome::Found(block);
                }
            }
        }
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_primitives::{Keypair, Transaction};

    fn candidate(difficulty: u8) -> Block {
        let keypair = Keypair::generate();
        Block {
            height: 1,
            timestamp: 1_749_376_257_272,
            prev_hash: [0x11; 32],
            difficulty,
            nonce: [0u8; 32],
            txs: vec![Transaction::coinbase(
                keypair.public(),
                5_000_000_000,
                1,
                b"test",
            )],
        }
    }

    #[tokio::test]
    async fn finds_a_proof_at_low_difficulty() {
        let handle = MinerHandle::new();
        match search(candidate(1), Arc::clone(&handle)).await {
            MinerOutcome::Found(block) => {
                assert!(hash_meets_difficulty(&block.hash(), block.difficulty));
                assert!(handle.is_finished());
            }
            MinerOutcome::Cancelled => panic!("search was not cancelled"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_terminates_the_search() {
        // 255 leading zero bits will not be found by accident
        let handle = MinerHandle::new();
        let task = tokio::spawn(search(candidate(255), Arc::clone(&handle)));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        handle.cancel();
        let outcome = task.await.expect("join");
        assert_eq!(outcome, MinerOutcome::Cancelled);
        assert!(handle.is_finished());
        // cancelling again changes nothing
        handle.cancel();
        assert!(handle.is_finished());
    }
}
