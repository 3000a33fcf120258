//! Models, costs, optimizers and training loops.
use crate::dataset::BatchIterator;
use anyhow::Result;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub mod autoencoder;
/// Reconstruction costs.
pub mod criterion;
/// Layers.
pub mod layer;
/// Optimizers.
pub mod optimizer;
pub mod pretrain;
pub mod rbm;

/// Training / Testing statistics.
#[derive(Default, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// Minibatches seen.
    pub batches: usize,
    /// Examples seen.
    pub examples: usize,
    /// Sum of the per batch costs.
    pub total_cost: f32,
}

impl Stats {
    /// Records the `cost` of a batch of `examples` rows.
    pub fn push(&mut self, examples: usize, cost: f32) {
        self.batches += 1;
        self.examples += examples;
        self.total_cost += cost;
    }
    /// Mean cost per batch.
    pub fn mean_cost(&self) -> f32 {
        self.total_cost / self.batches.max(1) as f32
    }
    /// Total cost divided by the number of examples.
    pub fn cost_per_example(&self) -> f32 {
        self.total_cost / self.examples.max(1) as f32
    }
}

/// Summary of training.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    epoch: usize,
    epoch_time: Duration,
    total_time: Duration,
    train: Stats,
}

impl Summary {
    /// Runs an epoch with `f`.
    ///
    /// Times `f`. If `f` returns `Ok`, updates the epoch time and accumulates the total time and the epoch. Otherwise returns the error.
    pub fn run_epoch<F>(&mut self, mut f: F) -> Result<Stats>
    where
        F: FnMut(&Self) -> Result<Stats>,
    {
        let start = Instant::now();
        let train = f(self)?;
        self.epoch_time = start.elapsed();
        self.total_time += self.epoch_time;
        self.epoch += 1;
        self.train = train;
        Ok(train)
    }
    /// Epochs completed.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
    /// Duration of the last epoch.
    pub fn epoch_time(&self) -> Duration {
        self.epoch_time
    }
    /// Duration of every epoch so far.
    pub fn total_time(&self) -> Duration {
        self.total_time
    }
    /// Statistics of the last epoch.
    pub fn train(&self) -> &Stats {
        &self.train
    }
}

/// Training.
///
/// [`TrainingAlgorithm`] updates a model `M` one minibatch at a time. Call
/// [`.setup()`](TrainingAlgorithm::setup()) once, then
/// [`.train()`](TrainingAlgorithm::train()) for each epoch while
/// [`.continue_learning()`](TrainingAlgorithm::continue_learning()) holds.
pub trait TrainingAlgorithm<M> {
    /// Checks that the algorithm can train `model` on `data`.
    fn setup(&mut self, _model: &M, _data: ArrayView2<f32>) -> Result<()> {
        Ok(())
    }
    /// Updates `model` with one minibatch.
    ///
    /// Returns the cost on `batch`.
    ///
    /// **Errors**
    /// Returns an error if the batch does not fit the model. The model may be modified even when returning an error.
    fn train_batch(&mut self, model: &mut M, batch: ArrayView2<f32>) -> Result<f32>;
    /// Trains for one epoch over `data` in minibatches of `batch_size` rows.
    ///
    /// Returns the training stats.
    fn train(&mut self, model: &mut M, data: ArrayView2<f32>, batch_size: usize) -> Result<Stats> {
        let mut stats = Stats::default();
        for batch in BatchIterator::new(data, batch_size)? {
            let cost = self.train_batch(model, batch)?;
            stats.push(batch.nrows(), cost);
        }
        Ok(stats)
    }
    /// Whether to run another epoch after `stats`. Stops once the cost
    /// diverges.
    fn continue_learning(&self, stats: &Stats) -> bool {
        stats.total_cost.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    struct Counter;

    impl TrainingAlgorithm<usize> for Counter {
        fn train_batch(&mut self, model: &mut usize, batch: ArrayView2<f32>) -> Result<f32> {
            *model += 1;
            Ok(batch.nrows() as f32)
        }
    }

    #[test]
    fn train_epoch_stats() -> Result<()> {
        let data = Array2::<f32>::zeros((25, 2));
        let mut updates = 0;
        let mut summary = Summary::default();
        let stats = summary.run_epoch(|_| Counter.train(&mut updates, data.view(), 10))?;
        assert_eq!(updates, 3);
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.examples, 25);
        assert_eq!(stats.mean_cost(), 25. / 3.);
        assert_eq!(stats.cost_per_example(), 1.);
        assert_eq!(summary.epoch(), 1);
        assert!(Counter.continue_learning(&stats));
        let diverged = Stats {
            total_cost: f32::NAN,
            ..stats
        };
        assert!(!Counter.continue_learning(&diverged));
        Ok(())
    }
}
