use super::Candidate;

/// Fewest active connections wins; ties go to the earliest candidate.
#[derive(Default)]
pub struct LeastConnectionsBalancer;

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn pick(&self, candidates: &[Candidate<'_>]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.runtime.active_connections())
            .map(|(i, _)| i)
    }
}
