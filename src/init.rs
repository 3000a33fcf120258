//! Parameter initializers.
use ndarray::{Array, Dimension, ShapeBuilder};
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use std::fmt::Debug;

/// Fills arrays with initial parameter values.
pub trait Initializer: Debug {
    /// Draws a value for each element of `array` from `rng`.
    fn fill<D: Dimension, R: Rng>(&self, array: &mut Array<f32, D>, rng: &mut R);
    /// Allocates an array of `shape` and fills it.
    fn init<D: Dimension, Sh: ShapeBuilder<Dim = D>, R: Rng>(&self, shape: Sh, rng: &mut R) -> Array<f32, D>
    where
        Self: Sized,
    {
        let mut array = Array::zeros(shape);
        self.fill(&mut array, rng);
        array
    }
}

/// All zeros, used for biases.
#[derive(Debug, Clone, Copy)]
pub struct Zeros;

impl Initializer for Zeros {
    fn fill<D: Dimension, R: Rng>(&self, array: &mut Array<f32, D>, _rng: &mut R) {
        array.fill(0.);
    }
}

/// `0.5 * U[0, 1) * irange`, the autoencoder weight initialization.
///
/// Every weight starts small and non-negative.
#[derive(Debug, Clone, Copy)]
pub struct ScaledUniform {
    /// Scale of the draw.
    pub irange: f32,
}

impl Initializer for ScaledUniform {
    fn fill<D: Dimension, R: Rng>(&self, array: &mut Array<f32, D>, rng: &mut R) {
        let scale = 0.5 * self.irange;
        array.mapv_inplace(|_| scale * rng.gen::<f32>());
    }
}

/// `U[-irange, irange)`, the RBM weight initialization.
#[derive(Debug, Clone, Copy)]
pub struct SymmetricUniform {
    /// Half width of the interval.
    pub irange: f32,
}

impl Initializer for SymmetricUniform {
    fn fill<D: Dimension, R: Rng>(&self, array: &mut Array<f32, D>, rng: &mut R) {
        if self.irange <= 0. {
            array.fill(0.);
            return;
        }
        let distr = Uniform::new(-self.irange, self.irange);
        array.mapv_inplace(|_| distr.sample(rng));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Ix2;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn scaled_uniform_range() {
        let mut rng = StdRng::seed_from_u64(0);
        let w = ScaledUniform { irange: 0.002 }.init::<Ix2, _, _>((15, 20), &mut rng);
        assert_eq!(w.dim(), (15, 20));
        assert!(w.iter().all(|x| (0. ..0.001).contains(x)));
    }

    #[test]
    fn symmetric_uniform_range() {
        let mut rng = StdRng::seed_from_u64(1);
        let w = SymmetricUniform { irange: 0.5 }.init::<Ix2, _, _>((20, 30), &mut rng);
        assert!(w.iter().all(|x| (-0.5..0.5).contains(x)));
        assert!(w.iter().any(|x| *x < 0.));
    }

    #[test]
    fn seeded_init_is_reproducible() {
        let a = ScaledUniform { irange: 1. }.init::<Ix2, _, _>((4, 4), &mut StdRng::seed_from_u64(7));
        let b = ScaledUniform { irange: 1. }.init::<Ix2, _, _>((4, 4), &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }
}
