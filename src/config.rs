//! Configuration.
//!
//! Experiments are described by a JSON file with a model section, an `sgd`
//! section and an `experiment` section:
/*!
```json
{
    "model": {
        "n_hid": 20,
        "act_enc": "tanh",
        "act_dec": null,
        "irange": 0.001,
        "tied_weights": true,
        "corruption_level": 0.1,
        "corruption_class": "GaussianCorruptor"
    },
    "sgd": { "base_lr": 0.01, "lr_anneal_start": 100 },
    "experiment": { "batch_size": 10, "epochs": 5 }
}
```
*/
//! Values are checked when the file is loaded, so a malformed configuration
//! fails before any training happens.
use crate::{
    corruption::Corruptor,
    error::Error,
    learn::{criterion::Cost, layer::Activation, optimizer::Anneal},
};
use anyhow::{bail, Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path, path::PathBuf};

fn default_irange() -> f32 {
    0.001
}

fn default_true() -> bool {
    true
}

fn default_corruption_class() -> String {
    "BinomialCorruptor".into()
}

fn default_cost_class() -> String {
    "MeanSquaredError".into()
}

fn check_positive(key: &str, value: usize) -> Result<()> {
    if value == 0 {
        bail!(Error::invalid_config(key, "must be > 0"));
    }
    Ok(())
}

fn check_irange(irange: f32) -> Result<()> {
    if !(irange.is_finite() && irange >= 0.) {
        bail!(Error::invalid_config(
            "irange",
            format!("{irange} must be finite and >= 0")
        ));
    }
    Ok(())
}

/// Denoising autoencoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaConfig {
    /// Visible units. 0 means "the number of columns of the training data".
    #[serde(default)]
    pub n_vis: usize,
    /// Hidden units.
    pub n_hid: usize,
    /// Encoder activation, `None` for a linear encoder.
    #[serde(default)]
    pub act_enc: Option<String>,
    /// Decoder activation, `None` for a linear decoder.
    #[serde(default)]
    pub act_dec: Option<String>,
    /// Weight initialization scale.
    #[serde(default = "default_irange")]
    pub irange: f32,
    /// Whether the decoder reuses the transposed encoder weights.
    #[serde(default = "default_true")]
    pub tied_weights: bool,
    /// Masking probability or noise stdev, depending on the corruption class.
    #[serde(default)]
    pub corruption_level: f32,
    /// One of `BinomialCorruptor`, `GaussianCorruptor`, `IdentityCorruptor`.
    #[serde(default = "default_corruption_class")]
    pub corruption_class: String,
    /// One of `MeanSquaredError`, `CrossEntropy`.
    #[serde(default = "default_cost_class")]
    pub cost_class: String,
}

impl DaConfig {
    /// A configuration for `n_vis` inputs and `n_hid` hidden units, with
    /// linear activations and no corruption.
    pub fn new(n_vis: usize, n_hid: usize) -> Self {
        Self {
            n_vis,
            n_hid,
            act_enc: None,
            act_dec: None,
            irange: default_irange(),
            tied_weights: true,
            corruption_level: 0.,
            corruption_class: "IdentityCorruptor".into(),
            cost_class: default_cost_class(),
        }
    }
    /// Resolved encoder activation.
    pub fn activation_encoder(&self) -> Result<Activation> {
        Activation::resolve(self.act_enc.as_deref())
    }
    /// Resolved decoder activation.
    pub fn activation_decoder(&self) -> Result<Activation> {
        Activation::resolve(self.act_dec.as_deref())
    }
    /// Resolved corruptor.
    pub fn corruptor(&self) -> Result<Corruptor> {
        Corruptor::resolve(&self.corruption_class, self.corruption_level)
    }
    /// Resolved cost.
    pub fn cost(&self) -> Result<Cost> {
        Ok(self.cost_class.parse()?)
    }
    /// Checks every value, including that `n_vis` is set.
    pub fn validate(&self) -> Result<()> {
        check_positive("n_vis", self.n_vis)?;
        self.validate_partial()
    }
    /// Checks every value except `n_vis`, which may still be inferred from data.
    pub fn validate_partial(&self) -> Result<()> {
        check_positive("n_hid", self.n_hid)?;
        check_irange(self.irange)?;
        self.activation_encoder()?;
        self.activation_decoder()?;
        self.corruptor()?;
        self.cost()?;
        Ok(())
    }
}

/// A value shared by every layer, or one value per layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerLayer<T> {
    /// One value per layer.
    Each(Vec<T>),
    /// The same value for every layer.
    All(T),
}

impl<T: Clone> PerLayer<T> {
    /// Expands to exactly `layers` values.
    ///
    /// **Errors**
    ///
    /// Returns [`Error::InvalidConfig`] if a per layer list does not have
    /// `layers` entries.
    pub fn expand(&self, key: &str, layers: usize) -> Result<Vec<T>> {
        match self {
            Self::All(value) => Ok(vec![value.clone(); layers]),
            Self::Each(values) if values.len() == layers => Ok(values.clone()),
            Self::Each(values) => bail!(Error::invalid_config(
                key,
                format!("{} values for {layers} layers", values.len())
            )),
        }
    }
}

impl<T: Default> Default for PerLayer<T> {
    fn default() -> Self {
        Self::All(T::default())
    }
}

/// Stacked denoising autoencoder configuration.
///
/// The number of layers is the length of `n_hid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackedDaConfig {
    /// Inputs of the first layer. 0 means "from the training data".
    #[serde(default)]
    pub n_vis: usize,
    /// Hidden units of each layer, bottom up.
    pub n_hid: Vec<usize>,
    /// Encoder activations.
    #[serde(default)]
    pub act_enc: PerLayer<Option<String>>,
    /// Decoder activations.
    #[serde(default)]
    pub act_dec: PerLayer<Option<String>>,
    /// Corruption levels.
    #[serde(default)]
    pub corruption_level: PerLayer<f32>,
    /// Shared by every layer.
    #[serde(default = "default_irange")]
    pub irange: f32,
    /// Shared by every layer.
    #[serde(default = "default_true")]
    pub tied_weights: bool,
    /// Shared by every layer.
    #[serde(default = "default_corruption_class")]
    pub corruption_class: String,
    /// Shared by every layer.
    #[serde(default = "default_cost_class")]
    pub cost_class: String,
}

impl StackedDaConfig {
    /// The configuration of each layer.
    ///
    /// Layer `k` reads `n_vis` inputs for `k = 0` and `n_hid[k - 1]` otherwise.
    pub fn layers(&self) -> Result<Vec<DaConfig>> {
        let layers = self.n_hid.len();
        if layers == 0 {
            bail!(Error::invalid_config("n_hid", "at least one layer"));
        }
        let act_enc = self.act_enc.expand("act_enc", layers)?;
        let act_dec = self.act_dec.expand("act_dec", layers)?;
        let corruption_level = self.corruption_level.expand("corruption_level", layers)?;
        let n_viss = std::iter::once(self.n_vis).chain(self.n_hid.iter().copied());
        Ok(self
            .n_hid
            .iter()
            .zip(n_viss)
            .zip(act_enc.into_iter().zip(act_dec))
            .zip(corruption_level)
            .map(|(((n_hid, n_vis), (act_enc, act_dec)), corruption_level)| DaConfig {
                n_vis,
                n_hid: *n_hid,
                act_enc,
                act_dec,
                irange: self.irange,
                tied_weights: self.tied_weights,
                corruption_level,
                corruption_class: self.corruption_class.clone(),
                cost_class: self.cost_class.clone(),
            })
            .collect())
    }
    /// Checks every value, including that `n_vis` is set.
    pub fn validate(&self) -> Result<()> {
        for layer in self.layers()? {
            layer.validate()?;
        }
        Ok(())
    }
    /// Checks every value except `n_vis`.
    pub fn validate_partial(&self) -> Result<()> {
        for layer in self.layers()?.into_iter().skip(1) {
            layer.validate()?;
        }
        self.layers()?[0].validate_partial()
    }
}

/// Visible unit type of an RBM.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visible {
    /// Bernoulli visible units.
    #[default]
    Binary,
    /// Unit variance gaussian visible units.
    Gaussian,
}

fn default_rbm_irange() -> f32 {
    0.5
}

fn default_pcd_steps() -> usize {
    1
}

/// Restricted Boltzmann machine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbmConfig {
    /// Visible units. 0 means "from the training data".
    #[serde(default)]
    pub nvis: usize,
    /// Hidden units.
    pub nhid: usize,
    /// Weights are drawn from U[-irange, irange).
    #[serde(default = "default_rbm_irange")]
    pub irange: f32,
    /// Visible unit type.
    #[serde(default)]
    pub visible: Visible,
    /// Gibbs steps per update of the persistent chains.
    #[serde(default = "default_pcd_steps")]
    pub pcd_steps: usize,
    /// Seeds the weights and the Gibbs chains, `None` uses the experiment seed.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl RbmConfig {
    /// Checks every value, including that `nvis` is set.
    pub fn validate(&self) -> Result<()> {
        check_positive("nvis", self.nvis)?;
        self.validate_partial()
    }
    /// Checks every value except `nvis`.
    pub fn validate_partial(&self) -> Result<()> {
        check_positive("nhid", self.nhid)?;
        check_positive("pcd_steps", self.pcd_steps)?;
        check_irange(self.irange)
    }
}

/// Stochastic gradient descent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    /// Learning rate before annealing.
    pub base_lr: f32,
    /// Anneal start, `None` for a constant learning rate.
    #[serde(default)]
    pub lr_anneal_start: Option<f32>,
    /// Annealing formula.
    #[serde(default)]
    pub lr_anneal: Anneal,
    /// Learning rate scales keyed by `<parameter>_lr`, ie `"vb_lr"`.
    #[serde(default)]
    pub learning_rates: BTreeMap<String, f32>,
}

impl SgdConfig {
    /// A constant learning rate of `base_lr`.
    pub fn new(base_lr: f32) -> Self {
        Self {
            base_lr,
            lr_anneal_start: None,
            lr_anneal: Anneal::default(),
            learning_rates: BTreeMap::new(),
        }
    }
    /// Checks every value.
    pub fn validate(&self) -> Result<()> {
        crate::learn::optimizer::Sgd::from_config(self).map(|_| ())
    }
}

fn default_saving_dir() -> PathBuf {
    PathBuf::from("./outputs/")
}

fn default_seed() -> u64 {
    42
}

fn default_nll_every() -> usize {
    50
}

/// Training loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Examples per minibatch.
    pub batch_size: usize,
    /// Passes over the training data (per layer when pretraining).
    pub epochs: usize,
    /// Save a snapshot every `saving_rate` epochs, 0 disables.
    #[serde(default)]
    pub saving_rate: usize,
    /// Where snapshots are written.
    #[serde(default = "default_saving_dir")]
    pub saving_dir: PathBuf,
    /// Seeds the data independent randomness of a run. Initialization and
    /// corruption or sampling draw from distinct streams derived from it.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Compute the exact RBM likelihood every `nll_every` epochs, 0 disables.
    #[serde(default = "default_nll_every")]
    pub nll_every: usize,
}

impl ExperimentConfig {
    /// `batch_size` examples for `epochs` epochs, without snapshots.
    pub fn new(batch_size: usize, epochs: usize) -> Self {
        Self {
            batch_size,
            epochs,
            saving_rate: 0,
            saving_dir: default_saving_dir(),
            seed: default_seed(),
            nll_every: 0,
        }
    }
    /// Checks every value.
    pub fn validate(&self) -> Result<()> {
        check_positive("batch_size", self.batch_size)
    }
}

/// Checks a model section.
pub trait Validate {
    /// Checks every value that does not depend on the data.
    fn validate_partial(&self) -> Result<()>;
}

impl Validate for DaConfig {
    fn validate_partial(&self) -> Result<()> {
        DaConfig::validate_partial(self)
    }
}

impl Validate for StackedDaConfig {
    fn validate_partial(&self) -> Result<()> {
        StackedDaConfig::validate_partial(self)
    }
}

impl Validate for RbmConfig {
    fn validate_partial(&self) -> Result<()> {
        RbmConfig::validate_partial(self)
    }
}

/// A configuration file: model, optimizer and training loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig<M> {
    /// The model section.
    pub model: M,
    /// The optimizer section.
    pub sgd: SgdConfig,
    /// The training loop section.
    pub experiment: ExperimentConfig,
}

impl<M: DeserializeOwned + Validate> RunConfig<M> {
    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
    /// Reads, parses and validates the JSON file at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {path:?}"))?;
        Self::from_json(&json).with_context(|| format!("Invalid config {path:?}"))
    }
    /// Checks every section.
    pub fn validate(&self) -> Result<()> {
        self.model.validate_partial()?;
        self.sgd.validate()?;
        self.experiment.validate()
    }
}
