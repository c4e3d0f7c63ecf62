//! Projection onto a hyperplane intersected with a box

use super::ProximalOperator;
use crate::error::{ensure_len, ensure_positive, OracleError, Result, SolverError};
use ndarray::prelude::*;
use ndarray::Zip;

/// Tolerances of the scalar root finder behind [`project_hyperplane_box`]
#[derive(Debug, Clone)]
pub struct BisectionOptions {
    /// Tolerance on the multiplier $`\mu`$: the bracket half-width has to
    /// fall below `atol`...
    pub atol: f64,
    /// ...or below `rtol` times the magnitude of the midpoint
    pub rtol: f64,
    /// Tolerance on the hyperplane residual $`|y^T \alpha|`$, required on top
    /// of the bracket width
    pub ftol: f64,
    /// Hard cap on bisection steps
    pub max_iter: usize,
    /// Hard cap on bracket doublings before giving up
    pub max_bracket_iter: usize,
}

impl Default for BisectionOptions {
    fn default() -> Self {
        BisectionOptions {
            atol: 1e-12,
            rtol: 1e-12,
            ftol: 1e-10,
            max_iter: 200,
            max_bracket_iter: 64,
        }
    }
}

/// Euclidean projection onto $`\{\alpha : y^T \alpha = 0, \; 0 \leq \alpha \leq C\}`$
///
/// The projection is $`\Pi_{[0, C]}(z - \mu^* y)`$ where $`\mu^*`$ is a root of
/// the non-increasing function
/// ```math
/// \varphi(\mu) = y^T \Pi_{[0, C]}(z - \mu y)
/// ```
/// This is the feasible set of the dual of a support vector machine, with
/// `coeffs` the labels and `upper` the box constraint $`C`$.
///
/// Algorithm
/// ---------
/// If $`\varphi(0) = 0`$ the clipped point is returned. Otherwise a signed step
/// $`\pm 1, \pm 2, \pm 4, \dots`$ is doubled until $`\varphi`$ changes sign, then
/// the bracket is bisected until both its half-width is below
/// $`\max(\mathrm{atol}, \mathrm{rtol} |c|)`$ and
/// $`|\varphi(c)| \leq \mathrm{ftol}`$. Bisection also ends when
/// $`\varphi(c) = 0`$ exactly, when the bracket cannot be split further in
/// floating point, or after `max_iter` steps.
///
/// A slope of $`\varphi`$ of order $`\|y\|_2^2`$ turns a small error in
/// $`\mu`$ into a large hyperplane residual, hence the separate `ftol`.
///
/// Errors
/// ------
/// [`SolverError::BracketFailure`] when no sign change is found within
/// `max_bracket_iter` doublings. An infeasible point is never returned.
pub fn project_hyperplane_box(
    point: ArrayView1<f64>,
    coeffs: ArrayView1<f64>,
    upper: f64,
    options: &BisectionOptions,
) -> Result<Array1<f64>> {
    ensure_len(point.len(), coeffs.len())?;
    ensure_positive("upper bound", upper)?;
    let clipped = |mu: f64| -> Array1<f64> {
        Zip::from(&point)
            .and(&coeffs)
            .map_collect(|&z, &y| (z - mu * y).max(0.).min(upper))
    };
    let phi = |mu: f64| coeffs.dot(&clipped(mu));

    let mu = find_root(phi, options)?;
    Ok(clipped(mu))
}

/// Root of a non-increasing scalar function
fn find_root(phi: impl Fn(f64) -> f64, options: &BisectionOptions) -> Result<f64> {
    let phi0 = phi(0.);
    if phi0 == 0. {
        return Ok(0.);
    }
    if !phi0.is_finite() {
        return Err(SolverError::InvalidParameter(
            "projection of a non-finite point".into(),
        ));
    }

    // positive at zero means the root lies to the right
    let sign0 = phi0.signum();
    let mut lo = 0.;
    let mut hi = None;
    let mut step = sign0;
    for _ in 0..options.max_bracket_iter {
        let f = phi(step);
        if f == 0. {
            return Ok(step);
        }
        if f.signum() != sign0 {
            hi = Some(step);
            break;
        }
        lo = step;
        step *= 2.;
    }
    let mut hi = match hi {
        Some(hi) => hi,
        None => {
            return Err(SolverError::BracketFailure {
                iterations: options.max_bracket_iter,
            })
        }
    };

    // phi(lo) has the sign of phi(0), phi(hi) the opposite one
    for _ in 0..options.max_iter {
        let c = 0.5 * (lo + hi);
        if c == lo || c == hi {
            log::debug!("bisection bracket [{}, {}] at floating point resolution", lo, hi);
            return Ok(c);
        }
        let fc = phi(c);
        let narrow = 0.5 * (hi - lo).abs() <= options.atol.max(options.rtol * c.abs());
        if fc == 0. || (narrow && fc.abs() <= options.ftol) {
            return Ok(c);
        }
        if fc.signum() == sign0 {
            lo = c;
        } else {
            hi = c;
        }
    }
    log::debug!("bisection hit its iteration cap, bracket [{}, {}]", lo, hi);
    Ok(0.5 * (lo + hi))
}

/// Parameters of [`HyperplaneBoxProjection`]
#[derive(Debug, Clone)]
pub struct HyperplaneBoxParams {
    /// normal of the hyperplane $`y`$
    pub coeffs: Array1<f64>,
    /// upper bound $`C`$ of the box $`[0, C]`$
    pub upper: f64,
}

/// [`project_hyperplane_box`] as a [`ProximalOperator`]; the scaling is
/// ignored since the set is not scaled.
#[derive(Debug, Clone, Default)]
pub struct HyperplaneBoxProjection {
    pub options: BisectionOptions,
}

impl HyperplaneBoxProjection {
    pub fn new(options: BisectionOptions) -> HyperplaneBoxProjection {
        HyperplaneBoxProjection { options }
    }
}

impl ProximalOperator<HyperplaneBoxParams> for HyperplaneBoxProjection {
    fn prox(
        &self,
        point: ArrayView1<f64>,
        _scaling: f64,
        params: &HyperplaneBoxParams,
    ) -> std::result::Result<Array1<f64>, OracleError> {
        Ok(project_hyperplane_box(
            point,
            params.coeffs.view(),
            params.upper,
            &self.options,
        )?)
    }
}
