//! Minibatches and synthetic data.
use crate::error::Error;
use anyhow::{bail, Result};
use ndarray::{s, Array2, ArrayView2};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use std::ops::Range;

/// Consecutive row slices of `batch_size` rows.
///
/// The last batch holds the remaining rows and may be shorter.
#[derive(Debug, Clone)]
pub struct BatchIterator<'a> {
    data: ArrayView2<'a, f32>,
    batch_size: usize,
    index: usize,
}

impl<'a> BatchIterator<'a> {
    /// Iterates over `data` in batches of `batch_size` rows.
    ///
    /// **Errors**
    ///
    /// Returns [`Error::InvalidConfig`] if `batch_size` is 0.
    pub fn new(data: ArrayView2<'a, f32>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            bail!(Error::invalid_config("batch_size", "must be > 0"));
        }
        Ok(Self {
            data,
            batch_size,
            index: 0,
        })
    }
}

impl<'a> Iterator for BatchIterator<'a> {
    type Item = ArrayView2<'a, f32>;
    fn next(&mut self) -> Option<Self::Item> {
        let sample_count = self.data.nrows();
        if self.index >= sample_count {
            return None;
        }
        let end = (self.index + self.batch_size).min(sample_count);
        let batch = self.data.clone().slice_move(s![self.index..end, ..]);
        self.index = end;
        Some(batch)
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.data.nrows().saturating_sub(self.index);
        let batches = (remaining + self.batch_size - 1) / self.batch_size;
        (batches, Some(batches))
    }
}

impl ExactSizeIterator for BatchIterator<'_> {}

fn split_ranges(sample_count: usize, valid_ratio: f32, test_ratio: f32) -> [Range<usize>; 3] {
    let count = |ratio: f32| ((ratio.clamp(0., 1.) * sample_count as f32).round() as usize).min(sample_count);
    let test_offset = sample_count - count(test_ratio);
    let valid_offset = test_offset - count(valid_ratio).min(test_offset);
    [0..valid_offset, valid_offset..test_offset, test_offset..sample_count]
}

/// Splits the rows of `data` into train, validation and test views, in that
/// order.
pub fn train_valid_test_split(
    data: ArrayView2<f32>,
    valid_ratio: f32,
    test_ratio: f32,
) -> (ArrayView2<f32>, ArrayView2<f32>, ArrayView2<f32>) {
    let [train, valid, test] = split_ranges(data.nrows(), valid_ratio, test_ratio);
    let rows = |range: Range<usize>| data.clone().slice_move(s![range, ..]);
    (rows(train), rows(valid), rows(test))
}

/// `rows x cols` draws from N(0, 1), reproducible from `seed`.
pub fn synthetic_normal(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_simple_fn((rows, cols), || StandardNormal.sample(&mut rng))
}
