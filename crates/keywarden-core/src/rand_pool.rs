//! Process-wide random source with an accumulating entropy pool.
//!
//! Seeded from OS randomness at construction; callers may fold in additional
//! entropy (mouse movement, typed text) at any time. Output chunks are
//! SHA-512(counter ‖ pool), so two pools never replay a stream even when fed
//! identical user entropy.
//!
//! The pool is an explicit context object handed to key generation and the
//! container codec rather than hidden global state; pool updates are
//! serialized behind a mutex and never touch I/O while holding it.

use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha512};
use uuid::Uuid;

const POOL_SIZE: usize = 64;

struct PoolState {
    pool: [u8; POOL_SIZE],
    counter: u64,
}

pub struct RandomPool {
    inner: Mutex<PoolState>,
}

impl RandomPool {
    /// Create a pool seeded from the operating system CSPRNG.
    pub fn new() -> Self {
        let mut seed = [0u8; POOL_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self {
            inner: Mutex::new(PoolState {
                pool: seed,
                counter: 0,
            }),
        }
    }

    /// Fold caller-supplied entropy into the pool.
    pub fn add_entropy(&self, data: &[u8]) {
        let mut state = self.inner.lock();
        let mut hasher = Sha512::new();
        hasher.update(state.pool);
        hasher.update(data);
        state.pool.copy_from_slice(&hasher.finalize());
    }

    /// Fill `out` with random bytes.
    pub fn fill(&self, out: &mut [u8]) {
        let mut state = self.inner.lock();
        let mut written = 0;
        while written < out.len() {
            let mut hasher = Sha512::new();
            hasher.update(state.counter.to_le_bytes());
            hasher.update(state.pool);
            state.counter = state.counter.wrapping_add(1);
            let chunk = hasher.finalize();
            let take = (out.len() - written).min(chunk.len());
            out[written..written + take].copy_from_slice(&chunk[..take]);
            written += take;
        }
    }

    /// Return `n` random bytes.
    pub fn bytes(&self, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        self.fill(&mut out);
        out
    }

    /// Return a fixed-size random array.
    pub fn array<const N: usize>(&self) -> [u8; N] {
        let mut out = [0u8; N];
        self.fill(&mut out);
        out
    }

    /// Random version-4 UUID drawn from this pool.
    pub fn new_uuid(&self) -> Uuid {
        uuid::Builder::from_random_bytes(self.array::<16>()).into_uuid()
    }
}

impl Default for RandomPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successive_outputs_differ() {
        let pool = RandomPool::new();
        let a = pool.bytes(32);
        let b = pool.bytes(32);
        assert_ne!(a, b);
    }

    #[test]
    fn two_pools_diverge() {
        let a = RandomPool::new();
        let b = RandomPool::new();
        assert_ne!(a.bytes(32), b.bytes(32));
    }

    #[test]
    fn entropy_changes_the_stream() {
        let pool = RandomPool::new();
        let before = pool.bytes(64);
        pool.add_entropy(b"mouse wiggle 12,48 13,49 15,52");
        let after = pool.bytes(64);
        assert_ne!(before, after);
    }

    #[test]
    fn odd_lengths_are_filled() {
        let pool = RandomPool::new();
        assert_eq!(pool.bytes(1).len(), 1);
        assert_eq!(pool.bytes(63).len(), 63);
        assert_eq!(pool.bytes(65).len(), 65);
        assert_eq!(pool.bytes(200).len(), 200);
    }

    #[test]
    fn uuids_are_v4_and_unique() {
        let pool = RandomPool::new();
        let a = pool.new_uuid();
        let b = pool.new_uuid();
        assert_ne!(a, b);
        assert_eq!(a.get_version_num(), 4);
    }
}
