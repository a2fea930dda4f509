//! Parallel reducer (spec.md §4.7): partitions the outer atom loop by rank, and all-reduces each
//! accumulator (and the worst observed error) across ranks after the local loop completes.
//!
//! The source's process-level MPI ranks are realized here as a `Reducer` trait with a
//! `rayon`-backed in-process implementation (REDESIGN FLAG, see SPEC_FULL.md): no MPI crate
//! exists in this corpus, and `rayon::ThreadPoolBuilder` gives the same "N independent workers
//! each own a deterministic slice of atoms" shape without a wire protocol, grounded on the
//! teacher's own use of `rayon::prelude::*` for its per-atom force loop.

use lin_alg::f64::Vec3;
use rayon::prelude::*;

use crate::atom::AtomId;
use crate::error::CoreError;

/// Deterministically partitions `n_atoms` atom indices into `n_ranks` owned slices by index
/// modulo rank count, matching spec.md §4.7's partition rule.
pub fn partition_by_rank(n_atoms: usize, n_ranks: usize) -> Vec<Vec<AtomId>> {
    let mut slices = vec![Vec::new(); n_ranks.max(1)];
    for i in 0..n_atoms {
        slices[i % n_ranks.max(1)].push(AtomId(i as u32));
    }
    slices
}

/// Collective operations a calculation step needs after its local (per-rank) loop finishes.
pub trait Reducer {
    fn n_ranks(&self) -> usize;
    fn sum_scalar(&self, values: Vec<f64>) -> f64;
    fn sum_vectors(&self, values: Vec<Vec<Vec3>>) -> Vec<Vec3>;
    fn sum_stress(&self, values: Vec<[f64; 6]>) -> [f64; 6];
    /// All-reduce-by-max over errors observed on each rank (spec.md §7 "agreement policy").
    fn agree_on_error(&self, errors: Vec<Option<CoreError>>) -> Option<CoreError>;
}

/// In-process stand-in for an MPI communicator: `n_ranks` logical ranks, reduced with `rayon`.
#[derive(Debug, Clone, Copy)]
pub struct RayonReducer {
    n_ranks: usize,
}

impl RayonReducer {
    pub fn new(n_ranks: usize) -> Self {
        Self { n_ranks: n_ranks.max(1) }
    }
}

impl Default for RayonReducer {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Reducer for RayonReducer {
    fn n_ranks(&self) -> usize {
        self.n_ranks
    }

    fn sum_scalar(&self, values: Vec<f64>) -> f64 {
        values.into_par_iter().sum()
    }

    fn sum_vectors(&self, values: Vec<Vec<Vec3>>) -> Vec<Vec3> {
        let n = values.iter().map(|v| v.len()).max().unwrap_or(0);
        (0..n)
            .into_par_iter()
            .map(|idx| {
                values.iter().fold(Vec3::new_zero(), |acc, per_rank| {
                    acc + per_rank.get(idx).copied().unwrap_or(Vec3::new_zero())
                })
            })
            .collect()
    }

    fn sum_stress(&self, values: Vec<[f64; 6]>) -> [f64; 6] {
        let mut total = [0.0; 6];
        for v in values {
            for k in 0..6 {
                total[k] += v[k];
            }
        }
        total
    }

    fn agree_on_error(&self, errors: Vec<Option<CoreError>>) -> Option<CoreError> {
        errors.into_iter().flatten().reduce(CoreError::most_severe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_deterministic_modulo_rank() {
        let slices = partition_by_rank(7, 3);
        assert_eq!(slices[0], vec![AtomId(0), AtomId(3), AtomId(6)]);
        assert_eq!(slices[1], vec![AtomId(1), AtomId(4)]);
        assert_eq!(slices[2], vec![AtomId(2), AtomId(5)]);
    }

    #[test]
    fn sum_scalar_reduces_across_ranks() {
        let reducer = RayonReducer::new(3);
        assert_eq!(reducer.sum_scalar(vec![1.0, 2.0, 3.0]), 6.0);
    }

    #[test]
    fn agree_on_error_picks_most_severe() {
        let reducer = RayonReducer::new(2);
        let errors = vec![
            Some(CoreError::Configuration("bad cutoff".into())),
            Some(CoreError::Internal("cache miss".into())),
            None,
        ];
        let worst = reducer.agree_on_error(errors).unwrap();
        assert!(matches!(worst, CoreError::Internal(_)));
    }

    #[test]
    fn agree_on_error_is_none_when_every_rank_succeeded() {
        let reducer = RayonReducer::new(4);
        assert!(reducer.agree_on_error(vec![None, None, None, None]).is_none());
    }
}
