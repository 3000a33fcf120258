//! Autoencoders, denoising autoencoders, and stacked DAEs.
use super::{
    criterion::Cost,
    layer::{check_input, Activation, Block, Parameter1, Parameter2, ParameterView, ParameterViewMut},
    optimizer::{Optimizer, Sgd},
    TrainingAlgorithm,
};
use crate::{
    config::{DaConfig, SgdConfig, StackedDaConfig},
    corruption::Corruptor,
    init::{Initializer, ScaledUniform, Zeros},
};
use anyhow::Result;
use ndarray::{Array2, ArrayView2, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// A denoising autoencoder learns a representation of the input by
/// reconstructing it from a corrupted copy.
///
/// Parameters, in order:
/// - `vb`: visible bias, `[n_vis]`
/// - `hb`: hidden bias, `[n_hid]`
/// - `W`: encoder weights, `[n_vis, n_hid]`
/// - `Wprime`: decoder weights, `[n_hid, n_vis]`, only with untied weights.
///   Tied weights decode with `W^T`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenoisingAutoencoder {
    corruptor: Corruptor,
    act_enc: Activation,
    act_dec: Activation,
    visbias: Parameter1,
    hidbias: Parameter1,
    weights: Parameter2,
    w_prime: Option<Parameter2>,
}

/// Intermediate values of the forward pass, kept for the backward pass.
struct ForwardPass {
    corrupted: Array2<f32>,
    hidden_input: Array2<f32>,
    hidden: Array2<f32>,
    output_input: Array2<f32>,
    reconstruction: Array2<f32>,
}

impl DenoisingAutoencoder {
    /// Allocates a denoising autoencoder, drawing the weights from `rng`.
    ///
    /// Biases start at 0, weights at `0.5 * U[0, 1) * irange`.
    ///
    /// **Errors**
    ///
    /// Fails if `conf` does not validate, see [`DaConfig::validate()`].
    pub fn new<R: Rng>(conf: &DaConfig, rng: &mut R) -> Result<Self> {
        conf.validate()?;
        let (n_vis, n_hid) = (conf.n_vis, conf.n_hid);
        let init = ScaledUniform {
            irange: conf.irange,
        };
        let weights = Parameter2::new("W", init.init((n_vis, n_hid), rng));
        let w_prime = if conf.tied_weights {
            None
        } else {
            Some(Parameter2::new("Wprime", init.init((n_hid, n_vis), rng)))
        };
        Ok(Self {
            corruptor: conf.corruptor()?,
            act_enc: conf.activation_encoder()?,
            act_dec: conf.activation_decoder()?,
            visbias: Parameter1::new("vb", Zeros.init(n_vis, rng)),
            hidbias: Parameter1::new("hb", Zeros.init(n_hid, rng)),
            weights,
            w_prime,
        })
    }
    /// Hidden units.
    pub fn n_hid(&self) -> usize {
        self.hidbias.value().len()
    }
    /// Whether the decoder uses `W^T`.
    pub fn tied_weights(&self) -> bool {
        self.w_prime.is_none()
    }
    /// The corruptor applied before encoding in [`.reconstruction()`](Self::reconstruction()).
    pub fn corruptor(&self) -> &Corruptor {
        &self.corruptor
    }
    /// The encoder weights.
    pub fn weights(&self) -> &Parameter2 {
        &self.weights
    }
    /// The decoder weights, `[n_hid, n_vis]`.
    pub fn decoder_weights(&self) -> ArrayView2<f32> {
        if let Some(w_prime) = self.w_prime.as_ref() {
            w_prime.value().view()
        } else {
            self.weights.value().t()
        }
    }
    fn encode_with_input(&self, input: ArrayView2<f32>) -> (Array2<f32>, Array2<f32>) {
        let hidden_input = input.dot(self.weights.value()) + self.hidbias.value();
        let mut hidden = hidden_input.clone();
        self.act_enc.apply_inplace(&mut hidden);
        (hidden_input, hidden)
    }
    fn decode_with_input(&self, hidden: ArrayView2<f32>) -> (Array2<f32>, Array2<f32>) {
        let output_input = hidden.dot(&self.decoder_weights()) + self.visbias.value();
        let mut output = output_input.clone();
        self.act_dec.apply_inplace(&mut output);
        (output_input, output)
    }
    /// Hidden unit activations `act_enc(hb + x W)`, without corruption.
    pub fn hidden_repr(&self, input: ArrayView2<f32>) -> Result<Array2<f32>> {
        check_input(&input, self.n_vis())?;
        Ok(self.encode_with_input(input).1)
    }
    /// Decodes hidden activations, `act_dec(vb + h W')`.
    pub fn decode(&self, hidden: ArrayView2<f32>) -> Result<Array2<f32>> {
        check_input(&hidden, self.n_hid())?;
        Ok(self.decode_with_input(hidden).1)
    }
    /// Reconstructs `input` after corrupting it.
    pub fn reconstruction<R: Rng>(&self, input: ArrayView2<f32>, rng: &mut R) -> Result<Array2<f32>> {
        check_input(&input, self.n_vis())?;
        Ok(self.forward_pass(input, rng).reconstruction)
    }
    fn forward_pass<R: Rng>(&self, input: ArrayView2<f32>, rng: &mut R) -> ForwardPass {
        let corrupted = self.corruptor.corrupt(input, rng);
        let (hidden_input, hidden) = self.encode_with_input(corrupted.view());
        let (output_input, reconstruction) = self.decode_with_input(hidden.view());
        ForwardPass {
            corrupted,
            hidden_input,
            hidden,
            output_input,
            reconstruction,
        }
    }
    /// The cost of reconstructing `input` from its corruption.
    pub fn cost<R: Rng>(&self, input: ArrayView2<f32>, cost: Cost, rng: &mut R) -> Result<f32> {
        let reconstruction = self.reconstruction(input, rng)?;
        cost.eval(reconstruction.view(), input)
    }
    /// Mean squared reconstruction error.
    pub fn mse<R: Rng>(&self, input: ArrayView2<f32>, rng: &mut R) -> Result<f32> {
        self.cost(input, Cost::MeanSquaredError, rng)
    }
    /// Computes the cost on `input` and stores the gradient of every parameter.
    ///
    /// The corruption is drawn once, the same corrupted batch is used for the
    /// cost and the gradients.
    pub fn cost_and_grads<R: Rng>(
        &mut self,
        input: ArrayView2<f32>,
        cost: Cost,
        rng: &mut R,
    ) -> Result<f32> {
        check_input(&input, self.n_vis())?;
        let ForwardPass {
            corrupted,
            hidden_input,
            hidden,
            output_input,
            reconstruction,
        } = self.forward_pass(input, rng);
        let value = cost.eval(reconstruction.view(), input)?;
        let output_grad = cost.grad(reconstruction.view(), input)?;
        let output_grad =
            self.act_dec
                .backward(output_input.view(), reconstruction.view(), output_grad);
        let visbias_grad = output_grad.sum_axis(Axis(0));
        // [n_hid, n_vis]
        let decoder_grad = hidden.t().dot(&output_grad);
        let hidden_grad = output_grad.dot(&self.decoder_weights().t());
        let hidden_grad = self
            .act_enc
            .backward(hidden_input.view(), hidden.view(), hidden_grad);
        let hidbias_grad = hidden_grad.sum_axis(Axis(0));
        let mut weights_grad = corrupted.t().dot(&hidden_grad);
        if let Some(w_prime) = self.w_prime.as_mut() {
            w_prime.set_grad(decoder_grad)?;
        } else {
            weights_grad += &decoder_grad.t();
        }
        self.visbias.set_grad(visbias_grad)?;
        self.hidbias.set_grad(hidbias_grad)?;
        self.weights.set_grad(weights_grad)?;
        Ok(value)
    }
}

impl Block for DenoisingAutoencoder {
    fn params(&self) -> Vec<ParameterView> {
        let mut params = vec![self.visbias.view(), self.hidbias.view(), self.weights.view()];
        params.extend(self.w_prime.as_ref().map(Parameter2::view));
        params
    }
    fn params_mut(&mut self) -> Vec<ParameterViewMut> {
        let mut params = vec![
            self.visbias.view_mut(),
            self.hidbias.view_mut(),
            self.weights.view_mut(),
        ];
        params.extend(self.w_prime.as_mut().map(Parameter2::view_mut));
        params
    }
    fn n_vis(&self) -> usize {
        self.visbias.value().len()
    }
    fn n_out(&self) -> usize {
        self.n_hid()
    }
    fn encode(&self, input: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.hidden_repr(input)
    }
}

/// A stack of denoising autoencoders.
///
/// Encoding passes the input through each layer in order. Each layer can be
/// pretrained on the representation produced by the layers below, see
/// [`pretrain()`](super::pretrain::pretrain()).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackedDA {
    layers: Vec<DenoisingAutoencoder>,
}

impl StackedDA {
    /// Allocates one autoencoder per entry of `conf.n_hid`.
    pub fn new<R: Rng>(conf: &StackedDaConfig, rng: &mut R) -> Result<Self> {
        conf.validate()?;
        let layers = conf
            .layers()?
            .iter()
            .map(|layer| DenoisingAutoencoder::new(layer, rng))
            .collect::<Result<_>>()?;
        Ok(Self { layers })
    }
    /// The layers, bottom up.
    pub fn layers(&self) -> &[DenoisingAutoencoder] {
        &self.layers
    }
    /// Mutable access to the layers, bottom up.
    pub fn layers_mut(&mut self) -> &mut [DenoisingAutoencoder] {
        &mut self.layers
    }
}

impl Block for StackedDA {
    fn params(&self) -> Vec<ParameterView> {
        self.layers.iter().flat_map(Block::params).collect()
    }
    fn params_mut(&mut self) -> Vec<ParameterViewMut> {
        self.layers.iter_mut().flat_map(Block::params_mut).collect()
    }
    fn n_vis(&self) -> usize {
        self.layers.first().map_or(0, Block::n_vis)
    }
    fn n_out(&self) -> usize {
        self.layers.last().map_or(0, Block::n_out)
    }
    fn encode(&self, input: ArrayView2<f32>) -> Result<Array2<f32>> {
        let mut output = input.to_owned();
        for layer in self.layers.iter() {
            output = layer.encode(output.view())?;
        }
        Ok(output)
    }
}

/// Trains a [`DenoisingAutoencoder`] with [`Sgd`] on a reconstruction [`Cost`].
#[derive(Debug, Clone)]
pub struct DaTrainer {
    cost: Cost,
    optimizer: Sgd,
    rng: StdRng,
}

impl DaTrainer {
    /// Creates a trainer. `seed` drives the corruption.
    pub fn new(cost: Cost, optimizer: Sgd, seed: u64) -> Self {
        Self {
            cost,
            optimizer,
            rng: StdRng::seed_from_u64(seed),
        }
    }
    /// Creates a trainer from an optimizer configuration.
    pub fn from_config(cost: Cost, config: &SgdConfig, seed: u64) -> Result<Self> {
        Ok(Self::new(cost, Sgd::from_config(config)?, seed))
    }
    /// The cost being minimized.
    pub fn cost(&self) -> Cost {
        self.cost
    }
    /// The optimizer.
    pub fn optimizer(&self) -> &Sgd {
        &self.optimizer
    }
    /// Evaluates the cost on `data` without updating the model.
    pub fn error(&mut self, model: &DenoisingAutoencoder, data: ArrayView2<f32>) -> Result<f32> {
        model.cost(data, self.cost, &mut self.rng)
    }
}

impl TrainingAlgorithm<DenoisingAutoencoder> for DaTrainer {
    fn train_batch(&mut self, model: &mut DenoisingAutoencoder, batch: ArrayView2<f32>) -> Result<f32> {
        let cost = model.cost_and_grads(batch, self.cost, &mut self.rng)?;
        self.optimizer.update(model.params_mut())?;
        Ok(cost)
    }
}
