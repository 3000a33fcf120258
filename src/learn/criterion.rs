use crate::error::Error;
use anyhow::{bail, Result};
use ndarray::{Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const EPSILON: f32 = 1e-6;

/// Reconstruction costs.
///
/// Both costs sum over the features of an example and average over the
/// examples of the minibatch.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cost {
    /// `mean_i sum_j (r_ij - x_ij)^2`
    #[default]
    MeanSquaredError,
    /// `mean_i sum_j -(x_ij ln r_ij + (1 - x_ij) ln(1 - r_ij))`
    ///
    /// Expects targets and reconstructions in [0, 1].
    CrossEntropy,
}

fn check_shapes(reconstruction: &ArrayView2<f32>, target: &ArrayView2<f32>) -> Result<()> {
    if reconstruction.shape() != target.shape() {
        bail!(Error::ShapeMismatch {
            expected: target.shape().to_vec(),
            found: reconstruction.shape().to_vec(),
        });
    }
    Ok(())
}

impl Cost {
    /// Evaluates the cost of `reconstruction` against `target`.
    pub fn eval(&self, reconstruction: ArrayView2<f32>, target: ArrayView2<f32>) -> Result<f32> {
        check_shapes(&reconstruction, &target)?;
        let batch_size = target.nrows().max(1) as f32;
        let mut total = 0f32;
        match self {
            Self::MeanSquaredError => {
                Zip::from(&reconstruction)
                    .and(&target)
                    .for_each(|r, x| total += (r - x) * (r - x));
            }
            Self::CrossEntropy => {
                Zip::from(&reconstruction).and(&target).for_each(|r, x| {
                    let r = r.clamp(EPSILON, 1. - EPSILON);
                    total -= x * r.ln() + (1. - x) * (1. - r).ln();
                });
            }
        }
        Ok(total / batch_size)
    }
    /// The derivative of [`.eval()`](Self::eval()) with respect to `reconstruction`.
    ///
    /// The cross entropy gradient is 0 where `reconstruction` is clamped.
    pub fn grad(
        &self,
        reconstruction: ArrayView2<f32>,
        target: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        check_shapes(&reconstruction, &target)?;
        let scale = 1. / target.nrows().max(1) as f32;
        let grad = match self {
            Self::MeanSquaredError => {
                Zip::from(&reconstruction)
                    .and(&target)
                    .map_collect(|r, x| 2. * scale * (r - x))
            }
            Self::CrossEntropy => Zip::from(&reconstruction).and(&target).map_collect(|r, x| {
                if *r < EPSILON || *r > 1. - EPSILON {
                    0.
                } else {
                    scale * (r - x) / (r * (1. - r))
                }
            }),
        };
        Ok(grad)
    }
}

impl FromStr for Cost {
    type Err = Error;
    fn from_str(class: &str) -> Result<Self, Error> {
        match class {
            "MeanSquaredError" | "mse" => Ok(Self::MeanSquaredError),
            "CrossEntropy" | "cross_entropy" => Ok(Self::CrossEntropy),
            _ => Err(Error::UnknownCost(class.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn mse_eval() -> Result<()> {
        let r = array![[1f32, 2.], [0., 0.]];
        let x = array![[0f32, 0.], [0., 1.]];
        // (1 + 4 + 0 + 1) / 2
        assert_relative_eq!(Cost::MeanSquaredError.eval(r.view(), x.view())?, 3.);
        Ok(())
    }

    #[test]
    fn grads_match_finite_difference() -> Result<()> {
        let r = array![[0.2f32, 0.7, 0.4], [0.9, 0.1, 0.5]];
        let x = array![[0f32, 1., 1.], [1., 0., 0.]];
        let eps = 1e-3;
        for cost in [Cost::MeanSquaredError, Cost::CrossEntropy] {
            let grad = cost.grad(r.view(), x.view())?;
            for ((i, j), g) in grad.indexed_iter() {
                let mut rp = r.clone();
                rp[(i, j)] += eps;
                let mut rm = r.clone();
                rm[(i, j)] -= eps;
                let numeric =
                    (cost.eval(rp.view(), x.view())? - cost.eval(rm.view(), x.view())?) / (2. * eps);
                assert_relative_eq!(numeric, *g, epsilon = 1e-2);
            }
        }
        Ok(())
    }

    #[test]
    fn cross_entropy_clamped_grad_is_zero() -> Result<()> {
        let r = array![[0f32, 1., 0.5]];
        let x = array![[1f32, 0., 1.]];
        let grad = Cost::CrossEntropy.grad(r.view(), x.view())?;
        assert_eq!(grad[(0, 0)], 0.);
        assert_eq!(grad[(0, 1)], 0.);
        assert_relative_eq!(grad[(0, 2)], -2., epsilon = 1e-5);
        assert!(Cost::CrossEntropy.eval(r.view(), x.view())?.is_finite());
        Ok(())
    }

    #[test]
    fn shape_mismatch() {
        let r = array![[1f32, 2.]];
        let x = array![[1f32, 2., 3.]];
        assert!(Cost::MeanSquaredError.eval(r.view(), x.view()).is_err());
    }

    #[test]
    fn parse() {
        assert_eq!("MeanSquaredError".parse::<Cost>(), Ok(Cost::MeanSquaredError));
        assert_eq!("CrossEntropy".parse::<Cost>(), Ok(Cost::CrossEntropy));
        assert_eq!(
            "Hinge".parse::<Cost>(),
            Err(Error::UnknownCost("Hinge".into()))
        );
    }
}
