//! User-facing oracles for the smooth part of the objective
//!
//! The smooth loss $`f`$ is accessed only through its value, gradient and
//! Hessian-vector products, each evaluated against the problem data `D`.
//! The smooth regularizer $`g`$ does not see the data and cannot fail.

use crate::error::OracleError;
use ndarray::prelude::*;

/// Smooth loss $`f(x; D)`$ with first and second order information.
pub trait SmoothObjective<D> {
    /// $`f(x; D)`$
    fn value(&self, params: ArrayView1<f64>, data: &D) -> Result<f64, OracleError>;

    /// $`\nabla f(x; D)`$
    fn gradient(&self, params: ArrayView1<f64>, data: &D) -> Result<Array1<f64>, OracleError>;

    /// $`\nabla^2 f(x; D) v`$
    fn hvp(
        &self,
        params: ArrayView1<f64>,
        vector: ArrayView1<f64>,
        data: &D,
    ) -> Result<Array1<f64>, OracleError>;
}

/// Bundles three closures `fun`, `grad_fun` and `hvp_fun` into a [`SmoothObjective`].
pub struct FnObjective<F, G, H> {
    pub fun: F,
    pub grad_fun: G,
    pub hvp_fun: H,
}

impl<F, G, H> FnObjective<F, G, H> {
    /// The bounds only pin down the closure signatures, `D` is inferred.
    pub fn new<D>(fun: F, grad_fun: G, hvp_fun: H) -> Self
    where
        F: Fn(ArrayView1<f64>, &D) -> Result<f64, OracleError>,
        G: Fn(ArrayView1<f64>, &D) -> Result<Array1<f64>, OracleError>,
        H: Fn(ArrayView1<f64>, ArrayView1<f64>, &D) -> Result<Array1<f64>, OracleError>,
    {
        FnObjective {
            fun,
            grad_fun,
            hvp_fun,
        }
    }
}

impl<D, F, G, H> SmoothObjective<D> for FnObjective<F, G, H>
where
    F: Fn(ArrayView1<f64>, &D) -> Result<f64, OracleError>,
    G: Fn(ArrayView1<f64>, &D) -> Result<Array1<f64>, OracleError>,
    H: Fn(ArrayView1<f64>, ArrayView1<f64>, &D) -> Result<Array1<f64>, OracleError>,
{
    fn value(&self, params: ArrayView1<f64>, data: &D) -> Result<f64, OracleError> {
        (self.fun)(params, data)
    }

    fn gradient(&self, params: ArrayView1<f64>, data: &D) -> Result<Array1<f64>, OracleError> {
        (self.grad_fun)(params, data)
    }

    fn hvp(
        &self,
        params: ArrayView1<f64>,
        vector: ArrayView1<f64>,
        data: &D,
    ) -> Result<Array1<f64>, OracleError> {
        (self.hvp_fun)(params, vector, data)
    }
}

/// Smooth, data-independent regularizer $`g(x)`$
pub trait SmoothRegularizer {
    fn value(&self, params: ArrayView1<f64>) -> f64;
    fn gradient(&self, params: ArrayView1<f64>) -> Array1<f64>;
    fn hvp(&self, params: ArrayView1<f64>, vector: ArrayView1<f64>) -> Array1<f64>;
}

/// Ridge penalty
/// ```math
/// g(x) = \frac{\gamma}{2} \|x\|_2^2
/// ```
/// A strength of zero switches the regularizer off.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ridge {
    pub strength: f64,
}

impl Ridge {
    pub fn new(strength: f64) -> Ridge {
        Ridge { strength }
    }
}

impl SmoothRegularizer for Ridge {
    fn value(&self, params: ArrayView1<f64>) -> f64 {
        0.5 * self.strength * params.dot(&params)
    }

    fn gradient(&self, params: ArrayView1<f64>) -> Array1<f64> {
        &params * self.strength
    }

    fn hvp(&self, _params: ArrayView1<f64>, vector: ArrayView1<f64>) -> Array1<f64> {
        &vector * self.strength
    }
}
