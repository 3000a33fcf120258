//! Experiment loops: training a single DAE, greedy layerwise pretraining of
//! a stack, and RBM training with PCD.
use super::{
    autoencoder::{DaTrainer, DenoisingAutoencoder, StackedDA},
    criterion::Cost,
    layer::Block,
    optimizer::Sgd,
    rbm::{compute_log_z, compute_nll, PersistentCdSampler, Rbm, RbmTrainer, MAX_EXACT_NHID},
    Stats, Summary, TrainingAlgorithm,
};
use crate::{
    config::{DaConfig, ExperimentConfig, RbmConfig, RunConfig, SgdConfig, StackedDaConfig},
    dataset::BatchIterator,
    snapshot,
};
use anyhow::{bail, Result};
use ndarray::{ArrayView2, Axis, Slice};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Final errors of [`train_da()`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DaReport {
    /// Cost of the last training epoch, mean over minibatches.
    pub train_cost: f32,
    /// Denoising error on the validation set, `None` if empty.
    pub error_valid: Option<f32>,
    /// Denoising error on the test set, `None` if empty.
    pub error_test: Option<f32>,
}

fn should_save(experiment: &ExperimentConfig, epoch: usize) -> bool {
    experiment.saving_rate != 0 && (epoch + 1) % experiment.saving_rate == 0
}

/// Seed of the corruption or sampling stream of a run seeded with `seed`.
fn sampling_seed(seed: u64) -> u64 {
    seed.wrapping_add(1)
}

fn infer_n_vis(configured: usize, data: &ArrayView2<f32>) -> usize {
    if configured == 0 {
        data.ncols()
    } else {
        configured
    }
}

/// Runs `trainer` on `model` for the configured number of epochs.
///
/// `snapshot_name` names the snapshot of an epoch, `None` disables saving.
fn run_epochs<M, T>(
    model: &mut M,
    trainer: &mut T,
    data: ArrayView2<f32>,
    experiment: &ExperimentConfig,
    snapshot_name: Option<&dyn Fn(usize) -> String>,
    mut on_epoch: impl FnMut(&M, &Summary) -> Result<()>,
) -> Result<Summary>
where
    M: Serialize,
    T: TrainingAlgorithm<M>,
{
    trainer.setup(&*model, data)?;
    let mut summary = Summary::default();
    for epoch in 0..experiment.epochs {
        let stats = summary.run_epoch(|_| trainer.train(model, data, experiment.batch_size))?;
        on_epoch(&*model, &summary)?;
        if let Some(snapshot_name) = snapshot_name {
            if should_save(experiment, epoch) {
                snapshot::save(&*model, &experiment.saving_dir, &snapshot_name(epoch))?;
            }
        }
        if !trainer.continue_learning(&stats) {
            tracing::warn!(epoch, cost = stats.total_cost, "Cost diverged, stopping");
            break;
        }
    }
    tracing::info!(
        epochs = summary.epoch(),
        total_time = ?summary.total_time(),
        "Training ended"
    );
    Ok(summary)
}

/// Trains a denoising autoencoder on `train`.
///
/// Snapshots `model-da-epoch-NN.bin` every `saving_rate` epochs and
/// `model-da-final.bin` at the end, into `saving_dir`. The denoising error is
/// then reported on `valid` and `test`.
pub fn train_da(
    conf: &RunConfig<DaConfig>,
    train: ArrayView2<f32>,
    valid: ArrayView2<f32>,
    test: ArrayView2<f32>,
) -> Result<(DenoisingAutoencoder, DaReport)> {
    conf.validate()?;
    let experiment = &conf.experiment;
    let mut model_conf = conf.model.clone();
    model_conf.n_vis = infer_n_vis(model_conf.n_vis, &train);
    let mut rng = StdRng::seed_from_u64(experiment.seed);
    let mut model = DenoisingAutoencoder::new(&model_conf, &mut rng)?;
    let mut trainer =
        DaTrainer::from_config(model_conf.cost()?, &conf.sgd, sampling_seed(experiment.seed))?;
    tracing::info!(
        n_vis = model_conf.n_vis,
        n_hid = model_conf.n_hid,
        examples = train.nrows(),
        "Training denoising autoencoder"
    );
    let snapshot_name = |epoch: usize| format!("model-da-epoch-{epoch:02}.bin");
    let mut train_cost = f32::NAN;
    let summary = run_epochs(
        &mut model,
        &mut trainer,
        train,
        experiment,
        Some(&snapshot_name),
        |_, summary| {
            train_cost = summary.train().mean_cost();
            tracing::info!(
                epoch = summary.epoch(),
                cost = train_cost,
                epoch_time = ?summary.epoch_time(),
                "Trained epoch"
            );
            Ok(())
        },
    )?;
    let mut error = |data: ArrayView2<f32>| -> Result<Option<f32>> {
        if data.nrows() == 0 {
            return Ok(None);
        }
        Ok(Some(trainer.error(&model, data)?))
    };
    let report = DaReport {
        train_cost,
        error_valid: error(valid)?,
        error_test: error(test)?,
    };
    tracing::info!(
        error_valid = ?report.error_valid,
        error_test = ?report.error_test,
        total_time = ?summary.total_time(),
        "Final denoising error"
    );
    let path = snapshot::save(&model, &experiment.saving_dir, "model-da-final.bin")?;
    tracing::info!(path = %path.display(), "Saved model");
    Ok((model, report))
}

/// Greedy layerwise pretraining.
///
/// Each layer is trained for `experiment.epochs` on the representation of
/// `data` computed by the (already trained) layers below it. Returns the
/// summary of each layer.
pub fn pretrain(
    sda: &mut StackedDA,
    cost: Cost,
    sgd: &SgdConfig,
    experiment: &ExperimentConfig,
    data: ArrayView2<f32>,
) -> Result<Vec<Summary>> {
    experiment.validate()?;
    let mut summaries = Vec::with_capacity(sda.layers().len());
    let mut representation = data.to_owned();
    let n_layers = sda.layers().len();
    for (index, layer) in sda.layers_mut().iter_mut().enumerate() {
        let seed = sampling_seed(experiment.seed).wrapping_add(index as u64);
        let mut trainer = DaTrainer::from_config(cost, sgd, seed)?;
        tracing::info!(
            layer = index,
            layers = n_layers,
            n_vis = layer.n_vis(),
            n_hid = layer.n_hid(),
            "Pretraining layer"
        );
        let summary = run_epochs(
            layer,
            &mut trainer,
            representation.view(),
            experiment,
            None,
            |_, summary| {
                tracing::info!(
                    layer = index,
                    epoch = summary.epoch(),
                    cost = summary.train().mean_cost(),
                    epoch_time = ?summary.epoch_time(),
                    "Trained epoch"
                );
                Ok(())
            },
        )?;
        summaries.push(summary);
        representation = layer.encode(representation.view())?;
    }
    Ok(summaries)
}

/// Allocates a [`StackedDA`] for `data`, pretrains it, and saves
/// `model-sda-final.bin`.
pub fn train_sda(
    conf: &RunConfig<StackedDaConfig>,
    data: ArrayView2<f32>,
) -> Result<(StackedDA, Vec<Summary>)> {
    conf.validate()?;
    let mut model_conf = conf.model.clone();
    model_conf.n_vis = infer_n_vis(model_conf.n_vis, &data);
    let mut rng = StdRng::seed_from_u64(conf.experiment.seed);
    let mut sda = StackedDA::new(&model_conf, &mut rng)?;
    let cost: Cost = model_conf.cost_class.parse()?;
    let summaries = pretrain(&mut sda, cost, &conf.sgd, &conf.experiment, data)?;
    let path = snapshot::save(&sda, &conf.experiment.saving_dir, "model-sda-final.bin")?;
    tracing::info!(path = %path.display(), "Saved model");
    Ok((sda, summaries))
}

/// Per epoch measurements of [`train_rbm()`].
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbmReport {
    /// Reconstruction error per example, for each epoch.
    pub reconstruction_errors: Vec<f32>,
    /// `(epoch, mean negative log likelihood)`, every `nll_every` epochs.
    pub nlls: Vec<(usize, f64)>,
}

/// Trains an RBM on `data` with persistent contrastive divergence.
///
/// The chains start at the first `batch_size` rows of `data`. The exact
/// likelihood is computed every `nll_every` epochs, starting after the first,
/// when the RBM has at most [`MAX_EXACT_NHID`] hidden units.
pub fn train_rbm(conf: &RunConfig<RbmConfig>, data: ArrayView2<f32>) -> Result<(Rbm, RbmReport)> {
    conf.validate()?;
    let experiment = &conf.experiment;
    if data.nrows() == 0 {
        bail!("Cannot train an RBM without data!");
    }
    let mut model_conf = conf.model.clone();
    model_conf.nvis = infer_n_vis(model_conf.nvis, &data);
    let seed = model_conf.seed.unwrap_or(experiment.seed);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rbm = Rbm::new(&model_conf, &mut rng)?;
    let chains = data
        .slice_axis(Axis(0), Slice::from(0..experiment.batch_size.min(data.nrows())))
        .to_owned();
    let sampler = PersistentCdSampler::new(&rbm, chains, model_conf.pcd_steps)?;
    let mut trainer = RbmTrainer::new(sampler, Sgd::from_config(&conf.sgd)?, sampling_seed(seed));
    let nll_every = if experiment.nll_every != 0 && model_conf.nhid > MAX_EXACT_NHID {
        tracing::warn!(
            nhid = model_conf.nhid,
            max = MAX_EXACT_NHID,
            "Too many hidden units for the exact likelihood, skipping it"
        );
        0
    } else {
        experiment.nll_every
    };
    tracing::info!(
        nvis = model_conf.nvis,
        nhid = model_conf.nhid,
        visible = ?model_conf.visible,
        "Training RBM"
    );
    let mut report = RbmReport::default();
    let snapshot_name = |epoch: usize| format!("model-rbm-epoch-{epoch:02}.bin");
    run_epochs(
        &mut rbm,
        &mut trainer,
        data,
        experiment,
        Some(&snapshot_name),
        |rbm, summary| {
            let epoch = summary.epoch();
            let avg_rec_error = summary.train().cost_per_example();
            report.reconstruction_errors.push(avg_rec_error);
            tracing::info!(epoch, avg_rec_error, epoch_time = ?summary.epoch_time(), "Trained epoch");
            if nll_every != 0 && (epoch - 1) % nll_every == 0 {
                let log_z = compute_log_z(rbm)?;
                let nll = compute_nll(rbm, data, log_z)?;
                report.nlls.push((epoch, nll));
                tracing::info!(epoch, avg_nll = nll, log_z, "Exact likelihood");
            }
            Ok(())
        },
    )?;
    let path = snapshot::save(&rbm, &experiment.saving_dir, "model-rbm-final.bin")?;
    tracing::info!(path = %path.display(), "Saved model");
    Ok((rbm, report))
}

/// Mean cost of `model` over `data` in minibatches, without updates.
pub fn evaluate(
    model: &DenoisingAutoencoder,
    trainer: &mut DaTrainer,
    data: ArrayView2<f32>,
    batch_size: usize,
) -> Result<Stats> {
    let mut stats = Stats::default();
    for batch in BatchIterator::new(data, batch_size)? {
        stats.push(batch.nrows(), trainer.error(model, batch)?);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::PerLayer, dataset::synthetic_normal};

    fn experiment(dir: &std::path::Path, epochs: usize) -> ExperimentConfig {
        ExperimentConfig {
            saving_dir: dir.to_path_buf(),
            ..ExperimentConfig::new(10, epochs)
        }
    }

    #[test]
    fn train_da_saves_snapshots() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let conf = RunConfig {
            model: DaConfig {
                n_vis: 0,
                act_enc: Some("tanh".into()),
                corruption_level: 0.1,
                corruption_class: "GaussianCorruptor".into(),
                ..DaConfig::new(0, 8)
            },
            sgd: SgdConfig {
                lr_anneal_start: Some(100.),
                ..SgdConfig::new(0.01)
            },
            experiment: ExperimentConfig {
                saving_rate: 2,
                ..experiment(dir.path(), 5)
            },
        };
        let data = synthetic_normal(200, 6, 0);
        let (train, valid) = data.view().split_at(Axis(0), 150);
        let (model, report) = train_da(&conf, train, valid, valid.slice_axis(Axis(0), Slice::from(0..0)))?;
        assert_eq!(model.n_vis(), 6);
        assert!(report.train_cost.is_finite());
        assert!(report.error_valid.is_some());
        assert_eq!(report.error_test, None);
        for name in ["model-da-epoch-01.bin", "model-da-epoch-03.bin", "model-da-final.bin"] {
            assert!(dir.path().join(name).exists(), "{name}");
        }
        assert!(!dir.path().join("model-da-epoch-00.bin").exists());
        let loaded: DenoisingAutoencoder = snapshot::load(dir.path().join("model-da-final.bin"))?;
        assert_eq!(loaded.weights().value(), model.weights().value());
        Ok(())
    }

    #[test]
    fn pretrain_feeds_each_layer() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let conf = StackedDaConfig {
            n_vis: 15,
            n_hid: vec![20, 20, 10],
            act_enc: PerLayer::All(Some("tanh".into())),
            act_dec: PerLayer::All(None),
            corruption_level: PerLayer::All(0.1),
            irange: 0.001,
            tied_weights: true,
            corruption_class: "GaussianCorruptor".into(),
            cost_class: "MeanSquaredError".into(),
        };
        let mut sda = StackedDA::new(&conf, &mut StdRng::seed_from_u64(0))?;
        let data = synthetic_normal(100, 15, 1);
        let before: Vec<_> = sda.layers().iter().map(|l| l.weights().value().clone()).collect();
        let summaries = pretrain(
            &mut sda,
            Cost::MeanSquaredError,
            &SgdConfig::new(0.01),
            &experiment(dir.path(), 2),
            data.view(),
        )?;
        assert_eq!(summaries.len(), 3);
        for (summary, (layer, before)) in summaries.iter().zip(sda.layers().iter().zip(before)) {
            assert_eq!(summary.epoch(), 2);
            assert_eq!(summary.train().batches, 10);
            assert_ne!(layer.weights().value(), &before);
        }
        assert_eq!(sda.encode(data.view())?.dim(), (100, 10));
        Ok(())
    }

    #[test]
    fn train_rbm_reports_likelihood() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let conf = RunConfig {
            model: RbmConfig {
                nvis: 0,
                nhid: 5,
                irange: 0.5,
                visible: crate::config::Visible::Gaussian,
                pcd_steps: 1,
                seed: None,
            },
            sgd: SgdConfig {
                lr_anneal_start: Some(1.),
                ..SgdConfig::new(1e-4)
            },
            experiment: ExperimentConfig {
                nll_every: 2,
                ..experiment(dir.path(), 5)
            },
        };
        let data = synthetic_normal(50, 8, 999);
        let (rbm, report) = train_rbm(&conf, data.view())?;
        assert_eq!(rbm.n_vis(), 8);
        assert_eq!(report.reconstruction_errors.len(), 5);
        let epochs: Vec<_> = report.nlls.iter().map(|(epoch, _)| *epoch).collect();
        assert_eq!(epochs, [1, 3, 5]);
        assert!(report.nlls.iter().all(|(_, nll)| nll.is_finite()));
        assert!(dir.path().join("model-rbm-final.bin").exists());
        Ok(())
    }

    #[test]
    fn rbm_seed_overrides_experiment_seed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let model = RbmConfig {
            nvis: 0,
            nhid: 4,
            irange: 0.5,
            visible: crate::config::Visible::Binary,
            pcd_steps: 1,
            seed: Some(7),
        };
        let conf = RunConfig {
            model: model.clone(),
            sgd: SgdConfig::new(0.01),
            experiment: experiment(dir.path(), 0),
        };
        let data = synthetic_normal(20, 6, 0);
        let (rbm, report) = train_rbm(&conf, data.view())?;
        assert!(report.reconstruction_errors.is_empty());
        let expected = Rbm::new(
            &RbmConfig { nvis: 6, ..model },
            &mut StdRng::seed_from_u64(7),
        )?;
        assert_eq!(rbm.weights().value(), expected.weights().value());
        let conf = RunConfig {
            model: RbmConfig { seed: None, ..conf.model.clone() },
            ..conf
        };
        let (other, _) = train_rbm(&conf, data.view())?;
        assert_ne!(other.weights().value(), rbm.weights().value());
        Ok(())
    }

    #[test]
    fn evaluate_without_updates() -> Result<()> {
        let conf = DaConfig::new(4, 3);
        let model = DenoisingAutoencoder::new(&conf, &mut StdRng::seed_from_u64(0))?;
        let mut trainer = DaTrainer::from_config(Cost::MeanSquaredError, &SgdConfig::new(0.1), 0)?;
        let data = synthetic_normal(30, 4, 0);
        let stats = evaluate(&model, &mut trainer, data.view(), 7)?;
        assert_eq!(stats.batches, 5);
        assert_eq!(trainer.optimizer().iteration(), 0);
        Ok(())
    }
}
