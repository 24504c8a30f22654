//! Truncation options and the context threaded through H-matrix algorithms.

use crate::cluster_tree::ClusterTree;
use crate::types::{Result, RustyHMatrixError};

/// Accuracy and rank cap used by ACA and by low-rank recompression.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Options {
    /// Relative truncation tolerance.
    pub tol: f64,
    /// Hard cap on the rank of low-rank factors.
    pub max_rank: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            tol: 1E-6,
            max_rank: 100,
        }
    }
}

impl Options {
    /// Create validated options. Requires `0 <= tol < 1` and `max_rank >= 1`.
    pub fn new(tol: f64, max_rank: usize) -> Result<Self> {
        if !(0.0..1.0).contains(&tol) {
            return Err(RustyHMatrixError::InvalidOptions(format!(
                "tolerance must lie in [0, 1), found {}",
                tol
            )));
        }
        if max_rank == 0 {
            return Err(RustyHMatrixError::InvalidOptions(
                "maximum rank must be at least 1".to_string(),
            ));
        }
        Ok(Options { tol, max_rank })
    }

    pub fn with_tol(self, tol: f64) -> Result<Self> {
        Options::new(tol, self.max_rank)
    }

    pub fn with_max_rank(self, max_rank: usize) -> Result<Self> {
        Options::new(self.tol, max_rank)
    }
}

/// Shared read-only state of an H-matrix computation.
#[derive(Clone, Copy, Debug)]
pub struct Context<'a> {
    pub tree: &'a ClusterTree,
    pub options: Options,
}

impl<'a> Context<'a> {
    pub fn new(tree: &'a ClusterTree, options: Options) -> Self {
        Context { tree, options }
    }

    pub fn tol(&self) -> f64 {
        self.options.tol
    }

    pub fn max_rank(&self) -> usize {
        self.options.max_rank
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_options_validation() {
        let opts = Options::default();
        assert_eq!(opts.max_rank, 100);
        approx::assert_relative_eq!(opts.tol, 1E-6);

        assert!(Options::new(0.0, 1).is_ok());
        assert!(Options::new(1.0, 10).is_err());
        assert!(Options::new(-1E-3, 10).is_err());
        assert!(Options::new(f64::NAN, 10).is_err());
        assert!(opts.with_max_rank(0).is_err());
        assert_eq!(opts.with_tol(1E-3).unwrap().max_rank, 100);
    }
}
