//! Merge operators combine partial results computed over parallel data
//! partitions into the single object that finishes an execution.
//!
//! A merge is needed whenever a node's model is built from data that was
//! processed partition-wise: each partition produces an internals object,
//! and the operator folds them back together. Hierarchical operators allow
//! subgroups of partials to be pre-merged before the final call; implementers
//! of hierarchical merges must keep the combine step associative and
//! insensitive to how partials are grouped.

use thiserror::Error;

/// Error type for merge operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("intermediate merges are not supported by a non-hierarchical operator")]
    IntermediateUnsupported,
    #[error("cannot merge an empty set of partial results")]
    EmptyInput,
    #[error("merge failed: {0}")]
    Failed(String),
}

/// Combines partial internals objects produced by parallel partition
/// execution.
pub trait MergeOperator {
    /// The partial-result type this operator combines.
    type Internals;

    /// Whether partials may be combined in subgroups before the final merge.
    /// When `false`, all partials are passed to one
    /// [`merge_final`](Self::merge_final) call.
    fn is_hierarchical(&self) -> bool {
        false
    }

    /// Combines a subset of partials into one object of the same shape, for
    /// hierarchical use. Calling this on a non-hierarchical operator is a
    /// caller error and fails loudly.
    fn merge_intermediate(
        &self,
        _partials: Vec<Self::Internals>,
    ) -> Result<Self::Internals, MergeError> {
        Err(MergeError::IntermediateUnsupported)
    }

    /// Combines all remaining partials (or intermediates) into the single
    /// object passed onward to finish execution.
    fn merge_final(&self, partials: Vec<Self::Internals>) -> Result<Self::Internals, MergeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    /// Per-partition counting accumulator; combining sums the counts, so the
    /// merge is commutative and associative.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    struct CountInternals {
        counts: HashMap<String, u64>,
    }

    impl CountInternals {
        fn of(pairs: &[(&str, u64)]) -> Self {
            CountInternals {
                counts: pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect(),
            }
        }

        fn absorb(&mut self, other: CountInternals) {
            for (key, count) in other.counts {
                *self.counts.entry(key).or_insert(0) += count;
            }
        }
    }

    struct CountMerger;

    impl MergeOperator for CountMerger {
        type Internals = CountInternals;

        fn merge_final(
            &self,
            partials: Vec<CountInternals>,
        ) -> Result<CountInternals, MergeError> {
            let mut iter = partials.into_iter();
            let mut combined = iter.next().ok_or(MergeError::EmptyInput)?;
            for partial in iter {
                combined.absorb(partial);
            }
            Ok(combined)
        }
    }

    struct HierarchicalCountMerger;

    impl MergeOperator for HierarchicalCountMerger {
        type Internals = CountInternals;

        fn is_hierarchical(&self) -> bool {
            true
        }

        fn merge_intermediate(
            &self,
            partials: Vec<CountInternals>,
        ) -> Result<CountInternals, MergeError> {
            CountMerger.merge_final(partials)
        }

        fn merge_final(
            &self,
            partials: Vec<CountInternals>,
        ) -> Result<CountInternals, MergeError> {
            CountMerger.merge_final(partials)
        }
    }

    fn three_partials() -> Vec<CountInternals> {
        vec![
            CountInternals::of(&[("a", 1), ("b", 2)]),
            CountInternals::of(&[("b", 3)]),
            CountInternals::of(&[("a", 4), ("c", 5)]),
        ]
    }

    #[test]
    fn test_default_operator_is_not_hierarchical() {
        assert!(!CountMerger.is_hierarchical());
    }

    #[test]
    fn test_intermediate_fails_on_non_hierarchical_operator() {
        let err = CountMerger
            .merge_intermediate(three_partials())
            .unwrap_err();
        assert_eq!(err, MergeError::IntermediateUnsupported);
    }

    #[test]
    fn test_final_merge_is_order_insensitive() {
        let expected = CountInternals::of(&[("a", 5), ("b", 5), ("c", 5)]);
        let forward = CountMerger.merge_final(three_partials()).unwrap();
        let mut reversed_input = three_partials();
        reversed_input.reverse();
        let reversed = CountMerger.merge_final(reversed_input).unwrap();
        assert_eq!(forward, expected);
        assert_eq!(reversed, expected);
    }

    #[test]
    fn test_single_partial_merges_to_itself() {
        let only = CountInternals::of(&[("a", 7)]);
        let merged = CountMerger.merge_final(vec![only.clone()]).unwrap();
        assert_eq!(merged, only);
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let err = CountMerger.merge_final(Vec::new()).unwrap_err();
        assert_eq!(err, MergeError::EmptyInput);
    }

    #[test]
    fn test_hierarchical_grouping_matches_flat_merge() {
        let op = HierarchicalCountMerger;
        assert!(op.is_hierarchical());

        let flat = op.merge_final(three_partials()).unwrap();

        let mut partials = three_partials();
        let tail = partials.split_off(1);
        let head = partials;
        let intermediate = op.merge_intermediate(tail).unwrap();
        let grouped = op
            .merge_final(head.into_iter().chain([intermediate]).collect())
            .unwrap();

        assert_eq!(grouped, flat);
    }
}
