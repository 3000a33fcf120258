#[cfg(doc)]
use super::layer::Block;
use super::layer::{ParameterView, ParameterViewMut};
use crate::{config::SgdConfig, error::Error};
use anyhow::{bail, Result};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Sgd`].
    pub struct SgdBuilder {
        base_lr: f32,
        anneal: Anneal,
        anneal_start: Option<f32>,
        learning_rates: BTreeMap<String, f32>,
    }

    impl SgdBuilder {
        pub(super) fn new(base_lr: f32) -> Self {
            Self {
                base_lr,
                anneal: Anneal::default(),
                anneal_start: None,
                learning_rates: BTreeMap::new(),
            }
        }
        /// Starts annealing the learning rate after `anneal_start` updates.
        ///
        /// By default the learning rate is constant.
        pub fn anneal_start(self, anneal_start: f32) -> Self {
            Self {
                anneal_start: Some(anneal_start),
                ..self
            }
        }
        /// The annealing formula. Default is [`Anneal::Clipped`].
        pub fn anneal(self, anneal: Anneal) -> Self {
            Self { anneal, ..self }
        }
        /// Scales the learning rate of the parameter named `name` by `scale`.
        ///
        /// Parameters without a scale use 1.
        pub fn learning_rate(mut self, name: impl AsRef<str>, scale: f32) -> Self {
            self.learning_rates
                .insert(format!("{}_lr", name.as_ref()), scale);
            self
        }
        /// Builds the optimizer.
        ///
        /// **Errors**
        ///
        /// Returns [`Error::InvalidConfig`] if the base learning rate, the anneal
        /// start or any scale is negative or not finite.
        pub fn build(self) -> Result<Sgd> {
            let Self {
                base_lr,
                anneal,
                anneal_start,
                learning_rates,
            } = self;
            if !(base_lr.is_finite() && base_lr >= 0.) {
                bail!(Error::invalid_config(
                    "base_lr",
                    format!("{base_lr} must be finite and >= 0")
                ));
            }
            if let Some(anneal_start) = anneal_start {
                if !(anneal_start.is_finite() && anneal_start > 0.) {
                    bail!(Error::invalid_config(
                        "lr_anneal_start",
                        format!("{anneal_start} must be finite and > 0")
                    ));
                }
            }
            for (key, scale) in learning_rates.iter() {
                if !(scale.is_finite() && *scale >= 0.) {
                    bail!(Error::invalid_config(
                        key.as_str(),
                        format!("{scale} must be finite and >= 0")
                    ));
                }
            }
            Ok(Sgd {
                base_lr,
                anneal,
                anneal_start,
                learning_rates,
                iteration: 0,
                annealed: base_lr,
            })
        }
    }
}
use builder::*;

/// Learning rate annealing formulas.
///
/// With `t` the number of updates already applied and `s` the anneal start:
/// - [`Clipped`](Anneal::Clipped): `clip(s / (t + 1), 0, base_lr)`
/// - [`Scaled`](Anneal::Scaled): `base_lr * min(1, s / (t + 1))`
///
/// Both are `base_lr` for the first updates and decay like `1 / t` afterwards.
/// [`Clipped`](Anneal::Clipped) only starts at `base_lr` when `s >= base_lr`.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anneal {
    /// Annealing starts once `s / (t + 1)` drops under `base_lr`.
    #[default]
    Clipped,
    /// Annealing starts after `s` updates.
    Scaled,
}

impl Anneal {
    /// The learning rate for update `iteration`.
    pub fn learning_rate(&self, base_lr: f32, anneal_start: Option<f32>, iteration: u64) -> f32 {
        let anneal_start = if let Some(anneal_start) = anneal_start {
            anneal_start
        } else {
            return base_lr;
        };
        let frac = anneal_start / (iteration as f32 + 1.);
        match self {
            Self::Scaled => base_lr * frac.min(1.),
            Self::Clipped => frac.clamp(0., base_lr),
        }
    }
}

/// New values for parameters, keyed by their position in [`Block::params()`].
///
/// A parameter can only be updated once per step.
#[derive(Default, Debug, Clone)]
pub struct Updates {
    entries: BTreeMap<usize, (String, ArrayD<f32>)>,
}

impl Updates {
    /// Creates an empty set of updates.
    pub fn new() -> Self {
        Self::default()
    }
    /// Records the new `value` for parameter `index`.
    ///
    /// **Errors**
    ///
    /// Returns [`Error::DuplicateUpdate`] if `index` already has an update. The
    /// existing update is kept.
    pub fn safe_update(
        &mut self,
        index: usize,
        name: impl Into<String>,
        value: ArrayD<f32>,
    ) -> Result<()> {
        let name = name.into();
        if self.entries.contains_key(&index) {
            bail!(Error::DuplicateUpdate(name));
        }
        self.entries.insert(index, (name, value));
        Ok(())
    }
    /// Moves the updates of `other` into self, without overwriting any.
    ///
    /// **Errors**
    ///
    /// Fails on the first duplicate, see [`.safe_update()`](Self::safe_update()).
    pub fn merge(&mut self, other: Updates) -> Result<()> {
        for (index, (name, value)) in other.entries {
            self.safe_update(index, name, value)?;
        }
        Ok(())
    }
    /// The number of updated parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    /// Whether no parameter is updated.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// The new value of parameter `index`.
    pub fn get(&self, index: usize) -> Option<&ArrayD<f32>> {
        self.entries.get(&index).map(|(_, value)| value)
    }
    /// Assigns the new values to `params`.
    ///
    /// **Errors**
    ///
    /// Fails if an update refers to a missing parameter or has a different
    /// shape. Nothing is assigned in that case.
    pub fn apply(self, params: &mut [ParameterViewMut]) -> Result<()> {
        for (index, (name, value)) in self.entries.iter() {
            let param = if let Some(param) = params.get(*index) {
                param
            } else {
                bail!("Update for {name:?} at {index} but only {} parameters!", params.len());
            };
            if param.value.shape() != value.shape() {
                bail!(Error::ShapeMismatch {
                    expected: param.value.shape().to_vec(),
                    found: value.shape().to_vec(),
                });
            }
        }
        for (index, (_, value)) in self.entries {
            params[index].value.assign(&value);
        }
        Ok(())
    }
}

/// Optimizer.
pub trait Optimizer {
    /// Computes the new parameter values from their gradients.
    ///
    /// Parameters without a gradient are not updated.
    fn updates(&self, params: &[ParameterView]) -> Result<Updates>;
    /// Applies one step to `params`, advancing the optimizer state.
    fn update(&mut self, params: Vec<ParameterViewMut>) -> Result<()>;
}

/// Stochastic Gradient Descent with an annealed learning rate and per
/// parameter learning rate scales.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sgd {
    base_lr: f32,
    anneal: Anneal,
    anneal_start: Option<f32>,
    learning_rates: BTreeMap<String, f32>,
    iteration: u64,
    annealed: f32,
}

impl Sgd {
    /// An Sgd builder.
    pub fn builder(base_lr: f32) -> SgdBuilder {
        SgdBuilder::new(base_lr)
    }
    /// Builds an optimizer from `config`.
    pub fn from_config(config: &SgdConfig) -> Result<Self> {
        let mut builder = Self::builder(config.base_lr).anneal(config.lr_anneal);
        if let Some(anneal_start) = config.lr_anneal_start {
            builder = builder.anneal_start(anneal_start);
        }
        for (key, scale) in config.learning_rates.iter() {
            let name = if let Some(name) = key.strip_suffix("_lr") {
                name
            } else {
                bail!(Error::invalid_config(
                    key.as_str(),
                    "learning rate keys are named <parameter>_lr"
                ));
            };
            builder = builder.learning_rate(name, *scale);
        }
        builder.build()
    }
    /// The base learning rate.
    pub fn base_lr(&self) -> f32 {
        self.base_lr
    }
    /// The number of updates applied so far.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }
    /// The annealed learning rate used by the last update, or the base
    /// learning rate before the first update.
    pub fn annealed(&self) -> f32 {
        self.annealed
    }
    /// The annealed learning rate the next update will use.
    pub fn learning_rate(&self) -> f32 {
        self.anneal
            .learning_rate(self.base_lr, self.anneal_start, self.iteration)
    }
    /// The learning rate scale of the parameter named `name`.
    pub fn learning_rate_scale(&self, name: &str) -> f32 {
        self.learning_rates
            .get(&format!("{name}_lr"))
            .copied()
            .unwrap_or(1.)
    }
}

impl Optimizer for Sgd {
    fn updates(&self, params: &[ParameterView]) -> Result<Updates> {
        let annealed = self.learning_rate();
        let mut updates = Updates::new();
        for (index, param) in params.iter().enumerate() {
            let grad = if let Some(grad) = param.grad.as_ref() {
                grad
            } else {
                continue;
            };
            if grad.shape() != param.value.shape() {
                bail!(Error::ShapeMismatch {
                    expected: param.value.shape().to_vec(),
                    found: grad.shape().to_vec(),
                });
            }
            let learning_rate = annealed * self.learning_rate_scale(param.name);
            let mut value = param.value.to_owned();
            value.scaled_add(-learning_rate, grad);
            updates.safe_update(index, param.name, value)?;
        }
        Ok(updates)
    }
    fn update(&mut self, mut params: Vec<ParameterViewMut>) -> Result<()> {
        let views: Vec<_> = params
            .iter()
            .map(|param| ParameterView {
                name: param.name,
                value: param.value.view(),
                grad: param.grad.as_ref().map(|grad| grad.view()),
            })
            .collect();
        let updates = self.updates(&views)?;
        drop(views);
        updates.apply(&mut params)?;
        self.annealed = self.learning_rate();
        self.iteration += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::layer::{Parameter1, Parameter2};
    use approx::assert_relative_eq;
    use ndarray::{array, Array1, Array2};

    #[test]
    fn anneal_starts_at_base_lr() {
        for anneal in [Anneal::Scaled, Anneal::Clipped] {
            assert_relative_eq!(anneal.learning_rate(0.01, Some(100.), 0), 0.01, epsilon = 1e-6);
            assert_relative_eq!(anneal.learning_rate(0.01, None, 0), 0.01, epsilon = 1e-6);
            assert_relative_eq!(anneal.learning_rate(0.01, None, 1_000_000), 0.01, epsilon = 1e-6);
        }
    }

    #[test]
    fn anneal_is_monotonic() {
        for anneal in [Anneal::Scaled, Anneal::Clipped] {
            let mut previous = f32::INFINITY;
            for iteration in 0..5000 {
                let lr = anneal.learning_rate(0.01, Some(100.), iteration);
                assert!(lr <= previous);
                assert!(lr >= 0.);
                previous = lr;
            }
        }
    }

    #[test]
    fn anneal_scaled_decays_after_start() {
        let anneal = Anneal::Scaled;
        assert_relative_eq!(anneal.learning_rate(0.1, Some(10.), 9), 0.1, epsilon = 1e-6);
        assert_relative_eq!(anneal.learning_rate(0.1, Some(10.), 19), 0.05, epsilon = 1e-6);
        assert_relative_eq!(anneal.learning_rate(0.1, Some(10.), 99), 0.01, epsilon = 1e-6);
    }

    #[test]
    fn anneal_clipped() {
        let anneal = Anneal::Clipped;
        // 100 / 1 clipped to base_lr
        assert_relative_eq!(anneal.learning_rate(0.01, Some(100.), 0), 0.01, epsilon = 1e-6);
        assert_relative_eq!(anneal.learning_rate(0.01, Some(100.), 19_999), 0.005, epsilon = 1e-6);
        // anneal_start below base_lr starts under it
        assert_relative_eq!(anneal.learning_rate(1., Some(0.5), 0), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn default_anneal_is_clipped() -> Result<()> {
        let config: SgdConfig = serde_json::from_str(r#"{ "base_lr": 1e-4, "lr_anneal_start": 1 }"#)?;
        assert_eq!(config.lr_anneal, Anneal::Clipped);
        let sgd = Sgd::from_config(&config)?;
        assert_relative_eq!(
            sgd.anneal.learning_rate(sgd.base_lr(), sgd.anneal_start, 999),
            1e-4,
            epsilon = 1e-9
        );
        // 100 / 5000 is still above base_lr
        let sgd = Sgd::builder(0.01).anneal_start(100.).build()?;
        assert_relative_eq!(
            sgd.anneal.learning_rate(sgd.base_lr(), sgd.anneal_start, 4999),
            0.01,
            epsilon = 1e-6
        );
        Ok(())
    }

    #[test]
    fn builder_rejects_invalid() {
        assert!(Sgd::builder(-1.).build().is_err());
        assert!(Sgd::builder(f32::NAN).build().is_err());
        assert!(Sgd::builder(0.1).anneal_start(0.).build().is_err());
        assert!(Sgd::builder(0.1).learning_rate("W", -2.).build().is_err());
        let err = Sgd::builder(-1.).build().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidConfig { key, .. }) if key == "base_lr"
        ));
    }

    #[test]
    fn from_config() -> Result<()> {
        let config = SgdConfig {
            base_lr: 0.1,
            lr_anneal_start: Some(5.),
            lr_anneal: Anneal::Scaled,
            learning_rates: [("hb_lr".to_string(), 0.5)].into_iter().collect(),
        };
        let sgd = Sgd::from_config(&config)?;
        assert_relative_eq!(sgd.learning_rate_scale("hb"), 0.5, epsilon = 1e-6);
        assert_relative_eq!(sgd.learning_rate_scale("W"), 1., epsilon = 1e-6);
        assert_relative_eq!(sgd.learning_rate(), 0.1, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn safe_update_refuses_overwrite() -> Result<()> {
        let mut updates = Updates::new();
        updates.safe_update(0, "W", ArrayD::zeros(vec![2]))?;
        let err = updates
            .safe_update(0, "W", ArrayD::ones(vec![2]))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::DuplicateUpdate("W".into()))
        );
        assert_eq!(updates.get(0).unwrap().sum(), 0.);
        let mut other = Updates::new();
        other.safe_update(1, "hb", ArrayD::zeros(vec![2]))?;
        updates.merge(other)?;
        assert_eq!(updates.len(), 2);
        let mut clash = Updates::new();
        clash.safe_update(1, "hb", ArrayD::zeros(vec![2]))?;
        assert!(updates.merge(clash).is_err());
        Ok(())
    }

    #[test]
    fn update_uses_annealed_rate_and_scales() -> Result<()> {
        let mut w = Parameter2::new("W", Array2::ones((2, 2)));
        let mut hb = Parameter1::new("hb", Array1::ones(2));
        let mut vb = Parameter1::new("vb", Array1::ones(2));
        w.set_grad(Array2::ones((2, 2)))?;
        hb.set_grad(array![1., 2.])?;
        let mut sgd = Sgd::builder(0.1)
            .anneal(Anneal::Scaled)
            .anneal_start(1.)
            .learning_rate("hb", 2.)
            .build()?;
        sgd.update(vec![w.view_mut(), hb.view_mut(), vb.view_mut()])?;
        assert_eq!(sgd.iteration(), 1);
        assert_relative_eq!(sgd.annealed(), 0.1, epsilon = 1e-6);
        assert_relative_eq!(w.value()[(0, 0)], 0.9, epsilon = 1e-6);
        assert_relative_eq!(hb.value()[0], 0.8, epsilon = 1e-6);
        assert_relative_eq!(hb.value()[1], 0.6, epsilon = 1e-6);
        // no gradient, no update
        assert_eq!(vb.value(), &Array1::<f32>::ones(2));
        // second step at iteration 1 uses 0.1 * 1 / 2
        sgd.update(vec![w.view_mut(), hb.view_mut(), vb.view_mut()])?;
        assert_relative_eq!(sgd.annealed(), 0.05, epsilon = 1e-6);
        assert_relative_eq!(w.value()[(0, 0)], 0.85, epsilon = 1e-6);
        Ok(())
    }
}
