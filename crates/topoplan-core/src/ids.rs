//! Instance id allocation.
//!
//! Each engine invocation owns exactly one `IdAllocator`. Suffixes are
//! derived by hashing (seed, counter) with SHA-256, so a fixed seed yields a
//! reproducible id sequence for tests, while `IdAllocator::new()` seeds from
//! the system clock for production use. Every handed-out id goes into a
//! reserved set; incremental re-expansion pre-loads that set with all
//! previous instance ids so fresh ids can never collide with surviving ones.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of the generated suffix, in lowercase hex characters.
const SUFFIX_LEN: usize = 5;

/// Generates short unique instance-id suffixes, collision-checked against
/// everything allocated or reserved so far.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    seed: u64,
    counter: u64,
    reserved: HashSet<String>,
}

impl IdAllocator {
    /// Allocator seeded from the system clock.
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::seeded(seed)
    }

    /// Allocator with an explicit seed; the id sequence is deterministic.
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed,
            counter: 0,
            reserved: HashSet::new(),
        }
    }

    /// Mark an existing id as taken so it is never handed out again.
    pub fn reserve(&mut self, id: &str) {
        self.reserved.insert(id.to_string());
    }

    /// Reserve every id in the iterator.
    pub fn reserve_all<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        for id in ids {
            self.reserve(id);
        }
    }

    /// Next unique id of the form `{prefix}_{suffix}`.
    pub fn next_id(&mut self, prefix: &str) -> String {
        loop {
            let suffix = self.derive_suffix();
            let id = format!("{prefix}_{suffix}");
            if self.reserved.insert(id.clone()) {
                return id;
            }
        }
    }

    fn derive_suffix(&mut self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(self.counter.to_le_bytes());
        self.counter += 1;
        let digest = hasher.finalize();
        hex::encode(&digest[..(SUFFIX_LEN + 1) / 2])[..SUFFIX_LEN].to_string()
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
