//! Proximal Operators for the non-smooth term of a composite objective
//!
//! The proximal operator of a function $`h`$ with scaling $`t > 0`$ is
//! ```math
//! \mathrm{prox}_{t h}(v) = \mathrm{arg}\!\min_x \; h(x) + \frac{1}{2t} \|x - v\|_2^2
//! ```
//! For the indicator of a closed convex set this is the Euclidean projection
//! onto the set, independent of $`t`$.
//!
//! Solvers accept anything implementing [`ProximalOperator`], including plain
//! closures `Fn(ArrayView1<f64>, f64, &P) -> Result<Array1<f64>, OracleError>`
//! where `P` carries the extra parameters of the operator.

mod bisection;
pub use bisection::*;

use crate::error::{ensure_positive, OracleError};
use ndarray::prelude::*;

/// $`\mathrm{prox}_{t h}(v)`$ with operator-specific parameters `P`
pub trait ProximalOperator<P> {
    fn prox(&self, point: ArrayView1<f64>, scaling: f64, params: &P)
        -> Result<Array1<f64>, OracleError>;
}

impl<P, F> ProximalOperator<P> for F
where
    F: Fn(ArrayView1<f64>, f64, &P) -> Result<Array1<f64>, OracleError>,
{
    fn prox(
        &self,
        point: ArrayView1<f64>,
        scaling: f64,
        params: &P,
    ) -> Result<Array1<f64>, OracleError> {
        self(point, scaling, params)
    }
}

/// Projection onto the box $`\{x : l \leq x \leq u\}`$
#[derive(Debug, Clone, Copy)]
pub struct BoxProjection {
    pub lower: f64,
    pub upper: f64,
}

impl BoxProjection {
    pub fn new(lower: f64, upper: f64) -> BoxProjection {
        BoxProjection { lower, upper }
    }
}

impl ProximalOperator<()> for BoxProjection {
    fn prox(
        &self,
        point: ArrayView1<f64>,
        _scaling: f64,
        _params: &(),
    ) -> Result<Array1<f64>, OracleError> {
        if !(self.lower <= self.upper) {
            return Err(format!("empty box [{}, {}]", self.lower, self.upper).into());
        }
        Ok(point.mapv(|v| v.max(self.lower).min(self.upper)))
    }
}

/// Soft thresholding, the proximal operator of
/// $`h(x) = \lambda \|x\|_1`$
/// ```math
/// \mathrm{prox}_{t h}(v)_i = \mathrm{sign}(v_i) \max(|v_i| - t \lambda, 0)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SoftThreshold {
    pub strength: f64,
}

impl SoftThreshold {
    pub fn new(strength: f64) -> SoftThreshold {
        SoftThreshold { strength }
    }
}

impl ProximalOperator<()> for SoftThreshold {
    fn prox(
        &self,
        point: ArrayView1<f64>,
        scaling: f64,
        _params: &(),
    ) -> Result<Array1<f64>, OracleError> {
        ensure_positive("scaling", scaling)?;
        let thresh = scaling * self.strength;
        Ok(point.mapv(|v| v.signum() * (v.abs() - thresh).max(0.)))
    }
}
