use super::Candidate;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Smooth weighted round-robin: every candidate's current weight grows by its
/// static weight, the largest wins and gives back the total. Spreads picks
/// evenly instead of in bursts (weights 5,1,1 give `a a b a c a a`).
#[derive(Default)]
pub struct WeightedRoundRobinBalancer {
    current: Mutex<HashMap<String, i64>>,
}

impl WeightedRoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pick(&self, candidates: &[Candidate<'_>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.len() > candidates.len()
            || current.keys().any(|id| !candidates.iter().any(|c| &c.instance.instance_id == id))
        {
            current.retain(|id, _| candidates.iter().any(|c| &c.instance.instance_id == id));
        }

        let mut total: i64 = 0;
        let mut best: Option<(usize, i64)> = None;
        for (i, c) in candidates.iter().enumerate() {
            let weight = i64::from(c.instance.weight());
            total += weight;
            let cw = current.entry(c.instance.instance_id.clone()).or_insert(0);
            *cw += weight;
            if best.map_or(true, |(_, b)| *cw > b) {
                best = Some((i, *cw));
            }
        }

        let (idx, _) = best?;
        if let Some(cw) = current.get_mut(&candidates[idx].instance.instance_id) {
            *cw -= total;
        }
        Some(idx)
    }
}
