//! Structured error taxonomy for the evaluation engine.
//!
//! Every operation that can fail returns `CoreResult<T>`. Kinds mirror the five rows of the
//! error-handling table: a bad registration is `Configuration`, an allocation that can't grow is
//! `Resource`, evaluating with missing state is `State`, a non-finite kernel result is
//! `Numerical`, and a violated cache invariant is `Internal`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// A potential/BOF form name isn't in the catalog, a target list has the wrong arity, or a
    /// cutoff is non-positive. Raised from registration; the step is never attempted.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Neighbor-list growth exceeded its hard upper bound, or the BOF cache can't be sized for
    /// the requested number of groups.
    #[error("resource error: {0}")]
    Resource(String),

    /// Evaluation was attempted with no atoms, no cell, or indices not yet assigned.
    #[error("state error: {0}")]
    State(String),

    /// A kernel returned a non-finite value, or a smoothening interval is degenerate
    /// (`soft > hard`).
    #[error("numerical error: {0}")]
    Numerical(String),

    /// A cache-slot invariant was violated (a miss where a hit was assumed after a fill). This
    /// indicates a bug in the engine itself, not a caller error.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Ranks kinds for the parallel max-reduce described in the error-handling policy: every
    /// rank must agree on the *most severe* error observed, so that a mild error on one rank
    /// never masks an internal invariant violation discovered on another.
    fn severity(&self) -> u8 {
        match self {
            CoreError::Configuration(_) => 1,
            CoreError::State(_) => 2,
            CoreError::Resource(_) => 3,
            CoreError::Numerical(_) => 4,
            CoreError::Internal(_) => 5,
        }
    }

    /// Picks the more severe of two observed errors, per the all-reduce-by-max policy.
    pub fn most_severe(self, other: CoreError) -> CoreError {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_outranks_everything() {
        let a = CoreError::Configuration("bad cutoff".into());
        let b = CoreError::Internal("slot miss after fill".into());
        assert_eq!(a.clone().most_severe(b.clone()), b.clone());
        assert_eq!(b.most_severe(a), CoreError::Internal("slot miss after fill".into()));
    }

    #[test]
    fn numerical_outranks_resource_and_state() {
        let r = CoreError::Resource("neighbor list full".into());
        let s = CoreError::State("no cell".into());
        let n = CoreError::Numerical("nan energy".into());
        assert_eq!(r.clone().most_severe(n.clone()), n.clone());
        assert_eq!(s.most_severe(n.clone()), n);
    }
}
