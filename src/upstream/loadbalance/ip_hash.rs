use super::round_robin::RoundRobinBalancer;
use super::{Candidate, SelectContext};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a; stable across processes and releases, unlike `DefaultHasher`.
fn fnv1a(key: &str) -> u64 {
    key.bytes()
        .fold(FNV_OFFSET, |h, b| (h ^ u64::from(b)).wrapping_mul(FNV_PRIME))
}

/// Sticky selection by client identity. Requests without one are spread
/// round-robin.
#[derive(Default)]
pub struct IpHashBalancer {
    fallback: RoundRobinBalancer,
}

impl IpHashBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pick(&self, candidates: &[Candidate<'_>], ctx: Option<&SelectContext>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match ctx.and_then(SelectContext::sticky_key) {
            Some(key) => Some((fnv1a(key) % candidates.len() as u64) as usize),
            None => self.fallback.pick(candidates),
        }
    }
}
