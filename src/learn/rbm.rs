//! Restricted Boltzmann machines trained with persistent contrastive divergence.
use super::{
    layer::{check_input, sigmoid, softplus, Block, Parameter1, Parameter2, ParameterView, ParameterViewMut},
    optimizer::{Optimizer, Sgd},
    TrainingAlgorithm,
};
use crate::{
    config::{RbmConfig, Visible},
    error::Error,
    init::{Initializer, SymmetricUniform, Zeros},
};
use anyhow::{bail, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Largest hidden layer for which [`compute_log_z()`] enumerates every
/// configuration.
pub const MAX_EXACT_NHID: usize = 20;

/// A restricted Boltzmann machine with binary hidden units.
///
/// With binary visible units the energy is `-v.vb - h.hb - v W h`. Gaussian
/// visible units have unit variance and energy `|v - vb|^2 / 2 - h.hb - v W h`.
///
/// Parameters, in order: `vb` `[nvis]`, `hb` `[nhid]`, `W` `[nvis, nhid]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rbm {
    visible: Visible,
    visbias: Parameter1,
    hidbias: Parameter1,
    weights: Parameter2,
}

impl Rbm {
    /// Allocates an RBM. Biases start at 0, weights at `U[-irange, irange)`.
    pub fn new<R: Rng>(conf: &RbmConfig, rng: &mut R) -> Result<Self> {
        conf.validate()?;
        let weights = SymmetricUniform {
            irange: conf.irange,
        }
        .init((conf.nvis, conf.nhid), rng);
        Ok(Self {
            visible: conf.visible,
            visbias: Parameter1::new("vb", Zeros.init(conf.nvis, rng)),
            hidbias: Parameter1::new("hb", Zeros.init(conf.nhid, rng)),
            weights: Parameter2::new("W", weights),
        })
    }
    /// The visible unit type.
    pub fn visible(&self) -> Visible {
        self.visible
    }
    /// Hidden units.
    pub fn nhid(&self) -> usize {
        self.hidbias.value().len()
    }
    /// The visible bias.
    pub fn visbias(&self) -> &Parameter1 {
        &self.visbias
    }
    /// The hidden bias.
    pub fn hidbias(&self) -> &Parameter1 {
        &self.hidbias
    }
    /// The weights.
    pub fn weights(&self) -> &Parameter2 {
        &self.weights
    }
    fn hidden_input(&self, visible: ArrayView2<f32>) -> Array2<f32> {
        visible.dot(self.weights.value()) + self.hidbias.value()
    }
    /// `P(h = 1 | v) = sigmoid(hb + v W)`.
    pub fn hidden_mean(&self, visible: ArrayView2<f32>) -> Result<Array2<f32>> {
        check_input(&visible, self.n_vis())?;
        let mut mean = self.hidden_input(visible);
        mean.mapv_inplace(sigmoid);
        Ok(mean)
    }
    /// `E[v | h]`, `sigmoid(vb + h W^T)` for binary units and `vb + h W^T`
    /// for gaussian units.
    pub fn visible_mean(&self, hidden: ArrayView2<f32>) -> Result<Array2<f32>> {
        check_input(&hidden, self.nhid())?;
        let mut mean = hidden.dot(&self.weights.value().t()) + self.visbias.value();
        if self.visible == Visible::Binary {
            mean.mapv_inplace(sigmoid);
        }
        Ok(mean)
    }
    /// Draws `h ~ P(h | v)`.
    pub fn sample_hidden<R: Rng>(&self, visible: ArrayView2<f32>, rng: &mut R) -> Result<Array2<f32>> {
        let mut sample = self.hidden_mean(visible)?;
        sample.mapv_inplace(|p| bernoulli(p, rng));
        Ok(sample)
    }
    /// Draws `v ~ P(v | h)`.
    pub fn sample_visible<R: Rng>(&self, hidden: ArrayView2<f32>, rng: &mut R) -> Result<Array2<f32>> {
        let mut sample = self.visible_mean(hidden)?;
        match self.visible {
            Visible::Binary => sample.mapv_inplace(|p| bernoulli(p, rng)),
            Visible::Gaussian => sample.mapv_inplace(|mu| {
                let noise: f32 = StandardNormal.sample(rng);
                mu + noise
            }),
        }
        Ok(sample)
    }
    /// The free energy `F(v) = -ln sum_h exp(-E(v, h))` of each row.
    pub fn free_energy(&self, visible: ArrayView2<f32>) -> Result<Array1<f32>> {
        check_input(&visible, self.n_vis())?;
        let softplus_sum = self
            .hidden_input(visible)
            .mapv(softplus)
            .sum_axis(Axis(1));
        let visible_term = match self.visible {
            Visible::Binary => -visible.dot(self.visbias.value()),
            Visible::Gaussian => {
                let centered = &visible - self.visbias.value();
                centered.mapv(|x| 0.5 * x * x).sum_axis(Axis(1))
            }
        };
        Ok(visible_term - softplus_sum)
    }
    /// Sum over the batch of the squared error between `visible` and its
    /// mean reconstruction from a sampled hidden state.
    pub fn reconstruction_error<R: Rng>(&self, visible: ArrayView2<f32>, rng: &mut R) -> Result<f32> {
        let hidden = self.sample_hidden(visible, rng)?;
        let reconstruction = self.visible_mean(hidden.view())?;
        let mut total = 0f32;
        Zip::from(&reconstruction)
            .and(&visible)
            .for_each(|r, v| total += (r - v) * (r - v));
        Ok(total)
    }
}

fn bernoulli<R: Rng>(p: f32, rng: &mut R) -> f32 {
    if rng.gen::<f32>() < p {
        1.
    } else {
        0.
    }
}

impl Block for Rbm {
    fn params(&self) -> Vec<ParameterView> {
        vec![self.visbias.view(), self.hidbias.view(), self.weights.view()]
    }
    fn params_mut(&mut self) -> Vec<ParameterViewMut> {
        vec![
            self.visbias.view_mut(),
            self.hidbias.view_mut(),
            self.weights.view_mut(),
        ]
    }
    fn n_vis(&self) -> usize {
        self.visbias.value().len()
    }
    fn n_out(&self) -> usize {
        self.nhid()
    }
    fn encode(&self, input: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.hidden_mean(input)
    }
}

/// Negative phase particles that persist across updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentCdSampler {
    chains: Array2<f32>,
    steps: usize,
}

impl PersistentCdSampler {
    /// Starts one chain per row of `initial`, advanced `steps` Gibbs steps
    /// per call to [`.sample()`](Self::sample()).
    ///
    /// **Errors**
    ///
    /// - [`Error::ShapeMismatch`] if `initial` does not have `nvis` columns.
    /// - [`Error::InvalidConfig`] if there are no chains or `steps` is 0.
    pub fn new(rbm: &Rbm, initial: Array2<f32>, steps: usize) -> Result<Self> {
        check_input(&initial.view(), rbm.n_vis())?;
        if initial.nrows() == 0 {
            bail!(Error::invalid_config("chains", "at least one chain"));
        }
        if steps == 0 {
            bail!(Error::invalid_config("pcd_steps", "must be > 0"));
        }
        Ok(Self {
            chains: initial,
            steps,
        })
    }
    /// The current particles.
    pub fn chains(&self) -> ArrayView2<f32> {
        self.chains.view()
    }
    /// Gibbs steps per call.
    pub fn steps(&self) -> usize {
        self.steps
    }
    /// Advances the chains and returns the new particles.
    pub fn sample<R: Rng>(&mut self, rbm: &Rbm, rng: &mut R) -> Result<ArrayView2<f32>> {
        for _ in 0..self.steps {
            let hidden = rbm.sample_hidden(self.chains.view(), rng)?;
            self.chains = rbm.sample_visible(hidden.view(), rng)?;
        }
        Ok(self.chains.view())
    }
}

/// Maximum likelihood gradients of `rbm`, `E_pos[dF] - E_neg[dF]` where `F`
/// is the free energy, as `[vb, hb, W]`.
///
/// Expectations are means over the rows of `positive` (data) and `negative`
/// (model samples).
pub fn ml_gradients(
    rbm: &Rbm,
    positive: ArrayView2<f32>,
    negative: ArrayView2<f32>,
) -> Result<(Array1<f32>, Array1<f32>, Array2<f32>)> {
    let n_pos = positive.nrows().max(1) as f32;
    let n_neg = negative.nrows().max(1) as f32;
    let h_pos = rbm.hidden_mean(positive)?;
    let h_neg = rbm.hidden_mean(negative)?;
    // dF/dvb is -v for binary and -(v - vb) for gaussian units, vb cancels.
    let visbias_grad = negative.sum_axis(Axis(0)) / n_neg - positive.sum_axis(Axis(0)) / n_pos;
    let hidbias_grad = h_neg.sum_axis(Axis(0)) / n_neg - h_pos.sum_axis(Axis(0)) / n_pos;
    let weights_grad = negative.t().dot(&h_neg) / n_neg - positive.t().dot(&h_pos) / n_pos;
    Ok((visbias_grad, hidbias_grad, weights_grad))
}

/// Exact `ln Z`, summing over every hidden configuration.
///
/// **Errors**
///
/// Returns [`Error::PartitionTooLarge`] if the RBM has more than
/// [`MAX_EXACT_NHID`] hidden units.
pub fn compute_log_z(rbm: &Rbm) -> Result<f64> {
    let nhid = rbm.nhid();
    if nhid > MAX_EXACT_NHID {
        bail!(Error::PartitionTooLarge {
            nhid,
            max: MAX_EXACT_NHID,
        });
    }
    let nvis = rbm.n_vis();
    let configs = 1usize << nhid;
    let chunk_size = configs.min(4096);
    let vb = rbm.visbias.value();
    let hb = rbm.hidbias.value();
    let vb_sq = vb.iter().map(|b| f64::from(*b).powi(2)).sum::<f64>();
    let mut log_z = LogSumExp::default();
    for start in (0..configs).step_by(chunk_size) {
        let end = (start + chunk_size).min(configs);
        let hidden = Array2::from_shape_fn((end - start, nhid), |(i, j)| {
            (((start + i) >> j) & 1) as f32
        });
        let hidden_term = hidden.dot(hb);
        // [chunk, nvis]
        let visible_input = hidden.dot(&rbm.weights.value().t()) + vb;
        for (c, row) in hidden_term.iter().zip(visible_input.outer_iter()) {
            let visible_term = match rbm.visible {
                Visible::Binary => row.iter().map(|x| f64::from(softplus(*x))).sum::<f64>(),
                Visible::Gaussian => {
                    0.5 * (row.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>() - vb_sq)
                }
            };
            log_z.push(f64::from(*c) + visible_term);
        }
    }
    let mut log_z = log_z.value();
    if rbm.visible == Visible::Gaussian {
        log_z += 0.5 * nvis as f64 * (2. * std::f64::consts::PI).ln();
    }
    Ok(log_z)
}

/// Running `ln sum exp(x)`, rescaled whenever the max grows.
#[derive(Debug, Clone, Copy)]
struct LogSumExp {
    max: f64,
    sum: f64,
}

impl Default for LogSumExp {
    fn default() -> Self {
        Self {
            max: f64::NEG_INFINITY,
            sum: 0.,
        }
    }
}

impl LogSumExp {
    fn push(&mut self, x: f64) {
        if x > self.max {
            self.sum = self.sum * (self.max - x).exp() + 1.;
            self.max = x;
        } else {
            self.sum += (x - self.max).exp();
        }
    }
    fn value(&self) -> f64 {
        if !self.max.is_finite() {
            return self.max;
        }
        self.max + self.sum.ln()
    }
}

impl FromIterator<f64> for LogSumExp {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut acc = Self::default();
        for x in iter {
            acc.push(x);
        }
        acc
    }
}

/// Mean negative log likelihood of the rows of `data`, `mean(F(v)) + ln Z`.
pub fn compute_nll(rbm: &Rbm, data: ArrayView2<f32>, log_z: f64) -> Result<f64> {
    let free_energy = rbm.free_energy(data)?;
    let mean = free_energy.iter().map(|f| f64::from(*f)).sum::<f64>() / data.nrows().max(1) as f64;
    Ok(mean + log_z)
}

/// Trains an [`Rbm`] by stochastic maximum likelihood.
///
/// Each update compares the data with the particles of a
/// [`PersistentCdSampler`].
#[derive(Debug, Clone)]
pub struct RbmTrainer {
    sampler: PersistentCdSampler,
    optimizer: Sgd,
    rng: StdRng,
}

impl RbmTrainer {
    /// Creates a trainer. `seed` drives the Gibbs sampling.
    pub fn new(sampler: PersistentCdSampler, optimizer: Sgd, seed: u64) -> Self {
        Self {
            sampler,
            optimizer,
            rng: StdRng::seed_from_u64(seed),
        }
    }
    /// The negative phase sampler.
    pub fn sampler(&self) -> &PersistentCdSampler {
        &self.sampler
    }
    /// The optimizer.
    pub fn optimizer(&self) -> &Sgd {
        &self.optimizer
    }
}

impl TrainingAlgorithm<Rbm> for RbmTrainer {
    fn setup(&mut self, model: &Rbm, data: ArrayView2<f32>) -> Result<()> {
        check_input(&self.sampler.chains(), model.n_vis())?;
        check_input(&data, model.n_vis())
    }
    /// Returns the reconstruction error of `batch` before the update.
    fn train_batch(&mut self, model: &mut Rbm, batch: ArrayView2<f32>) -> Result<f32> {
        let proxy = model.reconstruction_error(batch, &mut self.rng)?;
        let negative = self.sampler.sample(model, &mut self.rng)?;
        let (visbias_grad, hidbias_grad, weights_grad) = ml_gradients(model, batch, negative)?;
        model.visbias.set_grad(visbias_grad)?;
        model.hidbias.set_grad(hidbias_grad)?;
        model.weights.set_grad(weights_grad)?;
        self.optimizer.update(model.params_mut())?;
        Ok(proxy)
    }
}
