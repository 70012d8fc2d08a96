//! Stratified train/test partitioning.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::error::SplitError;

/// Disjoint row indices into the split dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
    /// Seed that produced the accepted split.
    pub seed: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Splitter {
    pub test_fraction: f64,
    pub tolerance: f64,
    pub max_attempts: usize,
}

impl Default for Splitter {
    fn default() -> Self {
        Splitter {
            test_fraction: 0.2,
            tolerance: 0.05,
            max_attempts: 10,
        }
    }
}

pub(crate) fn group_by_class(labels: &[i32]) -> BTreeMap<i32, Vec<usize>> {
    let mut groups: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    for (idx, &label) in labels.iter().enumerate() {
        groups.entry(label).or_default().push(idx);
    }
    groups
}

fn proportions(labels: &[i32], indices: &[usize]) -> BTreeMap<i32, f64> {
    let mut counts: BTreeMap<i32, usize> = BTreeMap::new();
    for &i in indices {
        *counts.entry(labels[i]).or_insert(0) += 1;
    }
    let n = indices.len().max(1) as f64;
    counts.into_iter().map(|(k, c)| (k, c as f64 / n)).collect()
}

impl Splitter {
    pub fn new(test_fraction: f64, tolerance: f64, max_attempts: usize) -> Self {
        Splitter {
            test_fraction,
            tolerance,
            max_attempts,
        }
    }

    fn attempt(&self, groups: &BTreeMap<i32, Vec<usize>>, seed: u64) -> Partition {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut train = Vec::new();
        let mut test = Vec::new();
        for members in groups.values() {
            let mut shuffled = members.clone();
            shuffled.shuffle(&mut rng);

            // Fractional remainders are resolved by a seeded coin so retries differ.
            let exact = shuffled.len() as f64 * self.test_fraction;
            let mut n_test = exact.floor() as usize;
            if rng.gen_bool((exact - exact.floor()).clamp(0.0, 1.0)) {
                n_test += 1;
            }
            if shuffled.len() >= 2 {
                n_test = n_test.clamp(1, shuffled.len() - 1);
            }

            test.extend_from_slice(&shuffled[..n_test]);
            train.extend_from_slice(&shuffled[n_test..]);
        }
        train.sort_unstable();
        test.sort_unstable();
        Partition { train, test, seed }
    }

    fn check(&self, labels: &[i32], overall: &BTreeMap<i32, f64>, partition: &Partition) -> Result<(), String> {
        for (name, indices) in [("train", &partition.train), ("test", &partition.test)] {
            let props = proportions(labels, indices);
            for (class, expected) in overall {
                let actual = props.get(class).copied().unwrap_or(0.0);
                if actual == 0.0 {
                    return Err(format!("{} partition has no rows of class {}", name, class));
                }
                if (actual - expected).abs() > self.tolerance {
                    return Err(format!(
                        "{} partition class {} share {:.4} drifts from {:.4}",
                        name, class, actual, expected
                    ));
                }
            }
        }
        Ok(())
    }

    /// Stratified split of `labels`, retrying with successive seeds until both
    /// partitions hold every class within tolerance of the overall ratio.
    pub fn split(&self, labels: &[i32], seed: u64) -> Result<Partition, SplitError> {
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(SplitError::InvalidFraction(self.test_fraction));
        }
        let groups = group_by_class(labels);
        if groups.len() < 2 {
            return Err(SplitError::InsufficientDiversity {
                reason: format!("dataset contains {} outcome class(es)", groups.len()),
            });
        }
        if let Some((class, members)) = groups.iter().find(|(_, m)| m.len() < 2) {
            return Err(SplitError::InsufficientDiversity {
                reason: format!(
                    "class {} has {} row(s), cannot appear in both partitions",
                    class,
                    members.len()
                ),
            });
        }

        let all: Vec<usize> = (0..labels.len()).collect();
        let overall = proportions(labels, &all);
        let mut last_reason = String::new();
        for attempt in 0..self.max_attempts.max(1) {
            let attempt_seed = seed.wrapping_add(attempt as u64);
            let partition = self.attempt(&groups, attempt_seed);
            match self.check(labels, &overall, &partition) {
                Ok(()) => {
                    info!(
                        "split {} train / {} test rows (seed {})",
                        partition.train.len(),
                        partition.test.len(),
                        attempt_seed
                    );
                    return Ok(partition);
                }
                Err(reason) => {
                    debug!("split attempt {} rejected: {}", attempt, reason);
                    last_reason = reason;
                }
            }
        }
        warn!("no valid stratified split after {} attempts", self.max_attempts);
        Err(SplitError::InsufficientDiversity {
            reason: format!(
                "no valid split after {} attempts: {}",
                self.max_attempts, last_reason
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(zeros: usize, ones: usize) -> Vec<i32> {
        let mut v = vec![0; zeros];
        v.extend(vec![1; ones]);
        // interleave so classes are not contiguous
        v.sort_by_key(|x| *x);
        v.rotate_left(zeros / 2);
        v
    }

    #[test]
    fn test_preserves_class_ratio() {
        let y = labels(180, 20);
        let splitter = Splitter::default();
        let part = splitter.split(&y, 42).unwrap();
        let p = 20.0 / 200.0;
        for indices in [&part.train, &part.test] {
            let ones = indices.iter().filter(|&&i| y[i] == 1).count() as f64;
            assert!((ones / indices.len() as f64 - p).abs() <= splitter.tolerance);
        }
        assert_eq!(part.train.len() + part.test.len(), 200);
    }

    #[test]
    fn test_partitions_are_disjoint_and_cover() {
        let y = labels(50, 50);
        let part = Splitter::default().split(&y, 7).unwrap();
        let mut all: Vec<usize> = part.train.iter().chain(part.test.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_same_seed_same_split() {
        let y = labels(90, 30);
        let a = Splitter::default().split(&y, 11).unwrap();
        let b = Splitter::default().split(&y, 11).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_class_fails() {
        let y = vec![0; 30];
        assert!(matches!(
            Splitter::default().split(&y, 42),
            Err(SplitError::InsufficientDiversity { .. })
        ));
    }

    #[test]
    fn test_singleton_class_fails() {
        let y = labels(30, 1);
        assert!(matches!(
            Splitter::default().split(&y, 42),
            Err(SplitError::InsufficientDiversity { .. })
        ));
    }

    #[test]
    fn test_impossible_tolerance_exhausts_attempts() {
        // 3 positives out of 10: any split of 2 test rows drifts by far more than 0.01
        let y = labels(7, 3);
        let splitter = Splitter::new(0.2, 0.01, 4);
        match splitter.split(&y, 42) {
            Err(SplitError::InsufficientDiversity { reason }) => assert!(reason.contains("4 attempts")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_small_dataset_keeps_both_classes_in_test() {
        let y = labels(8, 2);
        let part = Splitter::new(0.2, 0.5, 10).split(&y, 42).unwrap();
        assert!(part.test.iter().any(|&i| y[i] == 1));
        assert!(part.train.iter().any(|&i| y[i] == 1));
    }

    #[test]
    fn test_rejects_bad_fraction() {
        let y = labels(10, 10);
        assert_eq!(
            Splitter::new(1.0, 0.05, 3).split(&y, 1),
            Err(SplitError::InvalidFraction(1.0))
        );
    }
}
