//! Seeded K-Fold Partitioning
//!
//! Shared by calibration cross-validation and backtest cross-validation.
//! Assignment is a ChaCha8 shuffle of row indices, so the same `(n, k, seed)`
//! always yields the same folds on every platform.

use crate::error::{EngineError, EngineResult};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Default shuffle seed.
pub const DEFAULT_SEED: u64 = 42;

/// One train/test split. Indices are ascending within each side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub index: usize,
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Shuffled k-fold splitter.
#[derive(Debug, Clone, Copy)]
pub struct KFold {
    n_splits: usize,
    seed: u64,
}

impl KFold {
    pub fn new(n_splits: usize, seed: u64) -> EngineResult<Self> {
        if n_splits < 2 {
            return Err(EngineError::validation(
                "n_splits",
                n_splits,
                "need at least 2 folds",
            ));
        }
        Ok(Self { n_splits, seed })
    }

    pub fn n_splits(&self) -> usize {
        self.n_splits
    }

    /// Partition `n` rows. The first `n % k` folds receive one extra row.
    pub fn split(&self, n: usize) -> EngineResult<Vec<Fold>> {
        if n < self.n_splits {
            return Err(EngineError::InsufficientData(format!(
                "{} rows cannot fill {} folds",
                n, self.n_splits
            )));
        }

        let mut order: Vec<usize> = (0..n).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        order.shuffle(&mut rng);

        let base = n / self.n_splits;
        let extra = n % self.n_splits;

        let mut folds = Vec::with_capacity(self.n_splits);
        let mut start = 0;
        for index in 0..self.n_splits {
            let size = base + usize::from(index < extra);
            let mut test = order[start..start + size].to_vec();
            test.sort_unstable();

            let mut train: Vec<usize> = order[..start]
                .iter()
                .chain(&order[start + size..])
                .copied()
                .collect();
            train.sort_unstable();

            folds.push(Fold { index, train, test });
            start += size;
        }
        Ok(folds)
    }
}
