use crate::error::Error;
use anyhow::{bail, Result};
use ndarray::{
    Array, Array2, ArrayD, ArrayView2, ArrayViewD, ArrayViewMutD, Dimension, Ix1, Ix2, Zip,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A trait for trainable layers.
///
/// [`Block`] provides reflection over the parameters and the forward pass used
/// to feed the layer above.
pub trait Block {
    /// Enumerates the parameters of the block, in a stable order.
    fn params(&self) -> Vec<ParameterView>;
    /// Enumerates mutable views of the parameters, in the same order as
    /// [`.params()`](Self::params()).
    fn params_mut(&mut self) -> Vec<ParameterViewMut>;
    /// Number of inputs.
    fn n_vis(&self) -> usize;
    /// Number of outputs of [`.encode()`](Self::encode()).
    fn n_out(&self) -> usize;
    /// Computes the representation passed on to the layer above.
    ///
    /// **Errors**
    ///
    /// Returns an error if `input` does not have [`.n_vis()`](Self::n_vis()) columns.
    fn encode(&self, input: ArrayView2<f32>) -> Result<Array2<f32>>;
    /// Clears the gradients of every parameter.
    fn zero_grad(&mut self) {
        for param in self.params_mut() {
            *param.grad = None;
        }
    }
}

pub(crate) fn check_input(input: &ArrayView2<f32>, n_vis: usize) -> Result<()> {
    if input.ncols() != n_vis {
        bail!(Error::ShapeMismatch {
            expected: vec![input.nrows(), n_vis],
            found: input.shape().to_vec(),
        });
    }
    Ok(())
}

/// A named trainable array and its last gradient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter<D: Dimension> {
    name: String,
    value: Array<f32, D>,
    #[serde(skip)]
    grad: Option<ArrayD<f32>>,
}

/// A vector parameter (biases).
pub type Parameter1 = Parameter<Ix1>;
/// A matrix parameter (weights).
pub type Parameter2 = Parameter<Ix2>;

impl<D: Dimension> Parameter<D> {
    /// Creates a new parameter named `name` without a gradient.
    pub fn new(name: impl Into<String>, value: Array<f32, D>) -> Self {
        Self {
            name: name.into(),
            value,
            grad: None,
        }
    }
    /// The name, used to look up per-parameter learning rates.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The current value.
    pub fn value(&self) -> &Array<f32, D> {
        &self.value
    }
    /// Mutable access to the value.
    pub fn value_mut(&mut self) -> &mut Array<f32, D> {
        &mut self.value
    }
    /// The gradient from the last backward computation, if any.
    pub fn grad(&self) -> Option<&ArrayD<f32>> {
        self.grad.as_ref()
    }
    /// Stores `grad`.
    ///
    /// **Errors**
    ///
    /// The shape of `grad` must match the value.
    pub fn set_grad(&mut self, grad: Array<f32, D>) -> Result<()> {
        if grad.shape() != self.value.shape() {
            bail!(Error::ShapeMismatch {
                expected: self.value.shape().to_vec(),
                found: grad.shape().to_vec(),
            });
        }
        self.grad = Some(grad.into_dyn());
        Ok(())
    }
    /// Borrows the parameter as a [`ParameterView`].
    pub fn view(&self) -> ParameterView {
        ParameterView {
            name: &self.name,
            value: self.value.view().into_dyn(),
            grad: self.grad.as_ref().map(|x| x.view()),
        }
    }
    /// Borrows the parameter as a [`ParameterViewMut`].
    pub fn view_mut(&mut self) -> ParameterViewMut {
        ParameterViewMut {
            name: &self.name,
            value: self.value.view_mut().into_dyn(),
            grad: &mut self.grad,
        }
    }
}

/// Borrowed [`Parameter`].
#[derive(Debug, Clone)]
pub struct ParameterView<'a> {
    /// The name.
    pub name: &'a str,
    /// The value.
    pub value: ArrayViewD<'a, f32>,
    /// The gradient.
    pub grad: Option<ArrayViewD<'a, f32>>,
}

/// Mutably borrowed [`Parameter`].
#[derive(Debug)]
pub struct ParameterViewMut<'a> {
    /// The name.
    pub name: &'a str,
    /// The value.
    pub value: ArrayViewMutD<'a, f32>,
    /// The gradient.
    pub grad: &'a mut Option<ArrayD<f32>>,
}

/// Elementwise nonlinearities.
///
/// `None` in a configuration means [`Activation::Identity`], ie a linear layer.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// f(x) = x
    #[default]
    Identity,
    /// f(x) = 1 / (1 + e^-x)
    Sigmoid,
    /// f(x) = tanh(x)
    Tanh,
    /// f(x) = ln(1 + e^x)
    Softplus,
    /// f(x) = max(x, 0)
    Rectifier,
}

impl Activation {
    /// Resolves an optional activation name.
    ///
    /// **Errors**
    ///
    /// Returns [`Error::UnknownActivation`] if `name` is not recognized.
    pub fn resolve(name: Option<&str>) -> Result<Self> {
        match name {
            None => Ok(Self::Identity),
            Some(name) => Ok(name.parse()?),
        }
    }
    /// Applies the activation to `x`.
    pub fn apply(&self, x: f32) -> f32 {
        match self {
            Self::Identity => x,
            Self::Sigmoid => sigmoid(x),
            Self::Tanh => x.tanh(),
            Self::Softplus => softplus(x),
            Self::Rectifier => x.max(0.),
        }
    }
    /// Applies the activation inplace.
    pub fn apply_inplace(&self, x: &mut Array2<f32>) {
        if *self != Self::Identity {
            x.mapv_inplace(|x| self.apply(x));
        }
    }
    /// df/dx, expressed with both the input `x` and the output `y` = f(x).
    pub fn derivative(&self, x: f32, y: f32) -> f32 {
        match self {
            Self::Identity => 1.,
            Self::Sigmoid => y * (1. - y),
            Self::Tanh => 1. - y * y,
            Self::Softplus => sigmoid(x),
            Self::Rectifier => {
                if x > 0. {
                    1.
                } else {
                    0.
                }
            }
        }
    }
    /// Backpropagates `output_grad` through the activation.
    pub(crate) fn backward(
        &self,
        input: ArrayView2<f32>,
        output: ArrayView2<f32>,
        mut output_grad: Array2<f32>,
    ) -> Array2<f32> {
        if *self != Self::Identity {
            Zip::from(&mut output_grad)
                .and(input)
                .and(output)
                .for_each(|dy, x, y| *dy *= self.derivative(*x, *y));
        }
        output_grad
    }
}

impl FromStr for Activation {
    type Err = Error;
    fn from_str(name: &str) -> Result<Self, Error> {
        match name {
            "identity" | "linear" => Ok(Self::Identity),
            "sigmoid" => Ok(Self::Sigmoid),
            "tanh" => Ok(Self::Tanh),
            "softplus" => Ok(Self::Softplus),
            "relu" | "rectifier" => Ok(Self::Rectifier),
            _ => Err(Error::UnknownActivation(name.to_string())),
        }
    }
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

pub(crate) fn softplus(x: f32) -> f32 {
    x.max(0.) + (-x.abs()).exp().ln_1p()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array1};

    #[test]
    fn activation_resolve() -> Result<()> {
        assert_eq!(Activation::resolve(None)?, Activation::Identity);
        assert_eq!(Activation::resolve(Some("tanh"))?, Activation::Tanh);
        assert_eq!(Activation::resolve(Some("sigmoid"))?, Activation::Sigmoid);
        let err = Activation::resolve(Some("swish")).unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::UnknownActivation("swish".into()))
        );
        Ok(())
    }

    #[test]
    fn activation_derivative_matches_finite_difference() {
        let eps = 1e-3;
        for act in [
            Activation::Identity,
            Activation::Sigmoid,
            Activation::Tanh,
            Activation::Softplus,
        ] {
            for x in [-2f32, -0.3, 0.4, 1.7] {
                let numeric = (act.apply(x + eps) - act.apply(x - eps)) / (2. * eps);
                let analytic = act.derivative(x, act.apply(x));
                assert_relative_eq!(numeric, analytic, epsilon = 1e-2);
            }
        }
    }

    #[test]
    fn softplus_is_stable() {
        assert_relative_eq!(softplus(0.), 2f32.ln());
        assert_relative_eq!(softplus(100.), 100.);
        assert!(softplus(-100.) >= 0.);
    }

    #[test]
    fn parameter_set_grad_checks_shape() {
        let mut param = Parameter1::new("hb", Array1::zeros(3));
        assert!(param.set_grad(Array1::zeros(4)).is_err());
        param.set_grad(array![1., 2., 3.]).unwrap();
        assert_eq!(param.view().grad.unwrap().len(), 3);
        let view = param.view_mut();
        *view.grad = None;
        assert!(param.grad().is_none());
    }
}
