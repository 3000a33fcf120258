//! Input corruption for denoising autoencoders.
use crate::error::Error;
use anyhow::{bail, Result};
use ndarray::{Array2, ArrayView2};
use rand::Rng;
use rand_distr::{Bernoulli, Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Corrupts a minibatch before it is encoded.
#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Corruptor {
    /// Zero each input with probability `level`.
    Binomial {
        /// Probability of masking an input.
        level: f32,
    },
    /// Add isotropic gaussian noise.
    Gaussian {
        /// Standard deviation of the noise.
        stdev: f32,
    },
    /// Pass the input through untouched.
    #[default]
    Identity,
}

impl Corruptor {
    /// Resolves a corruptor from its class name and level.
    ///
    /// Accepts `"BinomialCorruptor"`, `"GaussianCorruptor"` and
    /// `"IdentityCorruptor"` (or their short lowercase forms).
    ///
    /// **Errors**
    ///
    /// - [`Error::UnknownCorruptor`] if the class is not recognized.
    /// - [`Error::InvalidConfig`] if `level` is negative, or above 1 for
    ///   binomial corruption.
    pub fn resolve(class: &str, level: f32) -> Result<Self> {
        let corruptor = match class {
            "BinomialCorruptor" | "binomial" => Self::Binomial { level },
            "GaussianCorruptor" | "gaussian" => Self::Gaussian { stdev: level },
            "IdentityCorruptor" | "identity" => Self::Identity,
            _ => bail!(Error::UnknownCorruptor(class.to_string())),
        };
        corruptor.validate()?;
        Ok(corruptor)
    }
    /// Checks the corruption level.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Binomial { level } if !(0. ..=1.).contains(&level) => bail!(
                Error::invalid_config("corruption_level", format!("{level} not in [0, 1]"))
            ),
            Self::Gaussian { stdev } if !(stdev >= 0. && stdev.is_finite()) => bail!(
                Error::invalid_config("corruption_level", format!("stdev {stdev} must be >= 0"))
            ),
            _ => Ok(()),
        }
    }
    /// The corruption level (masking probability or noise stdev).
    pub fn level(&self) -> f32 {
        match *self {
            Self::Binomial { level } => level,
            Self::Gaussian { stdev } => stdev,
            Self::Identity => 0.,
        }
    }
    /// Returns a corrupted copy of `input`.
    pub fn corrupt<R: Rng>(&self, input: ArrayView2<f32>, rng: &mut R) -> Array2<f32> {
        let mut output = input.to_owned();
        match *self {
            Self::Binomial { level } if level > 0. => {
                if let Ok(keep) = Bernoulli::new(f64::from(1. - level).clamp(0., 1.)) {
                    output.mapv_inplace(|x| if keep.sample(rng) { x } else { 0. });
                }
            }
            Self::Gaussian { stdev } if stdev > 0. => {
                if let Ok(normal) = Normal::new(0., stdev) {
                    output.mapv_inplace(|x| x + normal.sample(rng));
                }
            }
            _ => (),
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn resolve_classes() -> Result<()> {
        assert_eq!(
            Corruptor::resolve("BinomialCorruptor", 0.5)?,
            Corruptor::Binomial { level: 0.5 }
        );
        assert_eq!(
            Corruptor::resolve("GaussianCorruptor", 0.1)?,
            Corruptor::Gaussian { stdev: 0.1 }
        );
        let err = Corruptor::resolve("SaltAndPepper", 0.1).unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::UnknownCorruptor("SaltAndPepper".into()))
        );
        assert!(Corruptor::resolve("BinomialCorruptor", 1.5).is_err());
        assert!(Corruptor::resolve("GaussianCorruptor", -1.).is_err());
        Ok(())
    }

    #[test]
    fn binomial_masks_inputs() {
        let mut rng = StdRng::seed_from_u64(0);
        let input = Array::from_elem((100, 50), 1f32);
        let output = Corruptor::Binomial { level: 0.5 }.corrupt(input.view(), &mut rng);
        let zeros = output.iter().filter(|x| **x == 0.).count();
        assert!(zeros > 2000 && zeros < 3000, "zeros = {zeros}");
        assert!(output.iter().all(|x| *x == 0. || *x == 1.));
        // input untouched
        assert!(input.iter().all(|x| *x == 1.));
    }

    #[test]
    fn gaussian_adds_noise() {
        let mut rng = StdRng::seed_from_u64(0);
        let input = Array2::<f32>::zeros((200, 50));
        let output = Corruptor::Gaussian { stdev: 0.1 }.corrupt(input.view(), &mut rng);
        let mean = output.mean().unwrap();
        let var = output.mapv(|x| x * x).mean().unwrap();
        assert!(mean.abs() < 0.01);
        assert!((var.sqrt() - 0.1).abs() < 0.01);
    }

    #[test]
    fn identity_and_zero_level_are_noops() {
        let mut rng = StdRng::seed_from_u64(0);
        let input = Array::from_shape_fn((3, 4), |(i, j)| (i * 4 + j) as f32);
        for corruptor in [
            Corruptor::Identity,
            Corruptor::Binomial { level: 0. },
            Corruptor::Gaussian { stdev: 0. },
        ] {
            assert_eq!(corruptor.corrupt(input.view(), &mut rng), input);
        }
    }
}
