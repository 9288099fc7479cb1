use super::Candidate;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cyclic selection over the candidate list with a shared counter.
#[derive(Default)]
pub struct RoundRobinBalancer {
    counter: AtomicU64,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pick(&self, candidates: &[Candidate<'_>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some((count % candidates.len() as u64) as usize)
    }
}
