//! Destination selection. Weighted random selection over the normalized
//! routing weights is the default; round-robin and uniform random exist as
//! operational escape hatches.

use std::sync::{Arc, Mutex, RwLock};

use rand::Rng;

use crate::config::RoutingAlgorithmKind;
use crate::controller::WeightTable;

pub enum RouterAlgorithm {
    Weighted(WeightedSelect),
    RoundRobin(Mutex<usize>),
    Random,
}

impl RouterAlgorithm {
    pub fn new(kind: RoutingAlgorithmKind) -> Self {
        match kind {
            RoutingAlgorithmKind::Aimd => Self::Weighted(WeightedSelect::default()),
            RoutingAlgorithmKind::RoundRobin => Self::RoundRobin(Mutex::new(0)),
            RoutingAlgorithmKind::Random => Self::Random,
        }
    }

    /// Picks a destination service, or `None` when no destination is
    /// selectable (empty fleet, or zero total weight for the weighted
    /// algorithm). Never blocks.
    pub fn select<R: Rng>(&self, table: &Arc<WeightTable>, rng: &mut R) -> Option<String> {
        match self {
            Self::Weighted(weighted) => weighted.select(table, rng),
            Self::RoundRobin(counter) => {
                if table.entries.is_empty() {
                    return None;
                }
                let mut counter = counter.lock().expect("round-robin counter poisoned");
                let index = *counter % table.entries.len();
                *counter = counter.wrapping_add(1);
                Some(table.entries[index].0.clone())
            }
            Self::Random => {
                if table.entries.is_empty() {
                    return None;
                }
                let index = rng.gen_range(0..table.entries.len());
                Some(table.entries[index].0.clone())
            }
        }
    }
}

/// Weighted random selection in O(log N) per event: a prefix-sum array over
/// the weight snapshot, rebuilt only when the snapshot version changes, and a
/// binary search per draw.
#[derive(Default)]
pub struct WeightedSelect {
    cache: RwLock<PrefixCache>,
}

#[derive(Default)]
struct PrefixCache {
    version: u64,
    names: Vec<String>,
    prefix: Vec<f64>,
    total: f64,
}

impl WeightedSelect {
    fn select<R: Rng>(&self, table: &Arc<WeightTable>, rng: &mut R) -> Option<String> {
        self.refresh(table);

        let cache = self.cache.read().expect("prefix cache poisoned");
        if cache.total <= 0.0 {
            return None;
        }

        let draw = rng.gen_range(0.0..cache.total);
        let index = cache.prefix.partition_point(|&prefix| prefix <= draw);
        cache.names.get(index).cloned()
    }

    fn refresh(&self, table: &Arc<WeightTable>) {
        if self.cache.read().expect("prefix cache poisoned").version == table.version
            && table.version != 0
        {
            return;
        }

        let mut cache = self.cache.write().expect("prefix cache poisoned");
        let mut sum = 0.0;
        cache.names.clear();
        cache.prefix.clear();
        for (name, weight) in &table.entries {
            sum += weight.max(0.0);
            cache.names.push(name.clone());
            cache.prefix.push(sum);
        }
        cache.total = sum;
        cache.version = table.version;
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::SmallRng, SeedableRng};

    use super::*;

    fn table(version: u64, entries: &[(&str, f64)]) -> Arc<WeightTable> {
        Arc::new(WeightTable {
            version,
            entries: entries
                .iter()
                .map(|(name, weight)| (name.to_string(), *weight))
                .collect(),
        })
    }

    #[test]
    fn weighted_selection_tracks_weights() {
        let algorithm = RouterAlgorithm::new(RoutingAlgorithmKind::Aimd);
        let table = table(1, &[("service1", 47.0), ("service2", 53.0)]);
        let mut rng = SmallRng::seed_from_u64(42);

        let draws = 1000;
        let mut counts = [0usize; 2];
        for _ in 0..draws {
            match algorithm.select(&table, &mut rng).unwrap().as_str() {
                "service1" => counts[0] += 1,
                "service2" => counts[1] += 1,
                other => panic!("unexpected destination {}", other),
            }
        }

        // Chi-squared with 1 degree of freedom at p = 0.01.
        let expected = [470.0, 530.0];
        let chi2: f64 = counts
            .iter()
            .zip(expected)
            .map(|(&observed, expected)| {
                let delta = observed as f64 - expected;
                delta * delta / expected
            })
            .sum();
        assert!(chi2 < 6.635, "chi2 = {}, counts = {:?}", chi2, counts);
    }

    #[test]
    fn weighted_never_selects_zero_weight() {
        let algorithm = RouterAlgorithm::new(RoutingAlgorithmKind::Aimd);
        let table = table(1, &[("cold", 0.0), ("hot", 100.0)]);
        let mut rng = SmallRng::seed_from_u64(7);

        for _ in 0..500 {
            assert_eq!(algorithm.select(&table, &mut rng).unwrap(), "hot");
        }
    }

    #[test]
    fn weighted_fails_fast_on_zero_total() {
        let algorithm = RouterAlgorithm::new(RoutingAlgorithmKind::Aimd);
        let table = table(1, &[("a", 0.0), ("b", 0.0)]);
        let mut rng = SmallRng::seed_from_u64(7);

        assert_eq!(algorithm.select(&table, &mut rng), None);
    }

    #[test]
    fn weighted_cache_follows_snapshot_changes() {
        let algorithm = RouterAlgorithm::new(RoutingAlgorithmKind::Aimd);
        let mut rng = SmallRng::seed_from_u64(7);

        let before = table(1, &[("a", 100.0), ("b", 0.0)]);
        assert_eq!(algorithm.select(&before, &mut rng).unwrap(), "a");

        let after = table(2, &[("a", 0.0), ("b", 100.0)]);
        assert_eq!(algorithm.select(&after, &mut rng).unwrap(), "b");
    }

    #[test]
    fn round_robin_cycles_in_name_order() {
        let algorithm = RouterAlgorithm::new(RoutingAlgorithmKind::RoundRobin);
        let table = table(1, &[("a", 10.0), ("b", 20.0), ("c", 70.0)]);
        let mut rng = SmallRng::seed_from_u64(7);

        let picks: Vec<String> = (0..6)
            .map(|_| algorithm.select(&table, &mut rng).unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn random_ignores_weights_but_covers_the_fleet() {
        let algorithm = RouterAlgorithm::new(RoutingAlgorithmKind::Random);
        let table = table(1, &[("a", 0.0), ("b", 100.0)]);
        let mut rng = SmallRng::seed_from_u64(7);

        let mut saw_a = false;
        for _ in 0..200 {
            if algorithm.select(&table, &mut rng).unwrap() == "a" {
                saw_a = true;
                break;
            }
        }
        assert!(saw_a);
    }

    #[test]
    fn empty_fleet_yields_no_destination() {
        let mut rng = SmallRng::seed_from_u64(7);
        let empty = table(1, &[]);
        for kind in [
            RoutingAlgorithmKind::Aimd,
            RoutingAlgorithmKind::RoundRobin,
            RoutingAlgorithmKind::Random,
        ] {
            let algorithm = RouterAlgorithm::new(kind);
            assert_eq!(algorithm.select(&empty, &mut rng), None);
        }
    }
}
