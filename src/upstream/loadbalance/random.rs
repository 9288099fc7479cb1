use super::Candidate;
use rand::Rng;

/// Uniform pick over the candidate set. Weights are ignored; use
/// weighted round robin for proportional traffic.
#[derive(Default)]
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn pick(&self, candidates: &[Candidate<'_>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::instances;
    use super::super::LoadBalancer;
    use crate::config::LbStrategy;
    use std::collections::HashMap;

    #[test]
    fn test_uniform_distribution_ignores_weight() {
        let lb = LoadBalancer::new(LbStrategy::Random);
        let mut insts = instances(2);
        insts[0] = insts[0].clone().with_metadata("weight", "9");

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..10_000 {
            let picked = lb.select(&insts, None).unwrap();
            lb.record_result(&picked.instance_id, true, std::time::Duration::from_millis(1));
            *counts.entry(picked.instance_id).or_insert(0) += 1;
        }
        for id in ["o-1", "o-2"] {
            let n = counts.get(id).copied().unwrap_or(0);
            assert!((4500..5500).contains(&n), "{}: {}", id, n);
        }
    }

    #[test]
    fn test_single() {
        let lb = LoadBalancer::new(LbStrategy::Random);
        let insts = instances(1);
        for _ in 0..100 {
            assert_eq!(lb.select(&insts, None).unwrap().instance_id, "o-1");
        }
    }
}
