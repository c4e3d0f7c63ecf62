//! Private Module

#![allow(non_snake_case)]

use super::nystrom::{NystromSketch, Preconditioner};
use crate::error::{ensure_len, ensure_positive, Result, SolverError};
use crate::linop::{LinearOperator, OperatorShape};
use ndarray::prelude::*;
use ndarray_linalg::Norm;
use rand::Rng;

/// Stopping rule of [`pcg`]
#[derive(Debug, Clone)]
pub struct PcgOptions {
    /// Converge when $`\|r\|_2 \leq \mathrm{tol} \|b\|_2`$
    pub tol: f64,
    /// Hard cap on CG iterations, reached without error
    pub max_iter: usize,
}

impl Default for PcgOptions {
    fn default() -> Self {
        PcgOptions {
            tol: 1e-8,
            max_iter: 1000,
        }
    }
}

impl PcgOptions {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("pcg tol", self.tol)?;
        if self.max_iter == 0 {
            return Err(SolverError::InvalidParameter(
                "pcg max_iter must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// How a [`pcg`] solve ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcgStatus {
    Converged,
    MaxIterReached,
    /// A search direction with non-positive curvature, or a preconditioned
    /// residual with non-positive norm, stopped the recursion.
    Breakdown,
}

#[derive(Debug, Clone)]
pub struct PcgResult {
    pub solution: Array1<f64>,
    pub iterations: usize,
    pub residual_norm: f64,
    pub status: PcgStatus,
}

impl PcgResult {
    pub fn converged(&self) -> bool {
        self.status == PcgStatus::Converged
    }
}

/// Preconditioned Conjugate Gradient for the shifted system
/// $`(A + \mu I) x = b`$
///
/// Algorithm
/// ---------
/// ```math
/// \begin{aligned}
/// r_0 &= b - (A + \mu I) x_0, \quad z_0 = P^{-1} r_0, \quad p_0 = z_0 \\
/// \alpha_i &= \frac{\langle r_i, z_i \rangle}{\langle p_i, (A + \mu I) p_i \rangle} \\
/// x_{i+1} &= x_i + \alpha_i p_i \\
/// r_{i+1} &= r_i - \alpha_i (A + \mu I) p_i \\
/// z_{i+1} &= P^{-1} r_{i+1} \\
/// p_{i+1} &= z_{i+1} + \frac{\langle r_{i+1}, z_{i+1} \rangle}{\langle r_i, z_i \rangle} p_i
/// \end{aligned}
/// ```
///
/// The returned iterate is always the last one computed: CG decreases the
/// $`(A + \mu I)`$-norm of the error monotonically, so on a breakdown or when
/// the iteration cap is hit it is also the best one available.
///
/// Parameters
/// ----------
/// - __A:__        symmetric PSD operator
/// - __b:__        right-hand side
/// - __mu:__       shift, $`\mu \geq 0`$; with $`\mu = 0`$, $`A`$ must be definite
/// - __Pinv:__     inverse of the preconditioner, symmetric positive definite
/// - __x0:__       initial guess, zero if `None`
/// - __options:__  tolerance and iteration cap
pub fn pcg<T, P>(
    A: &T,
    b: ArrayView1<f64>,
    mu: f64,
    Pinv: &P,
    x0: Option<ArrayView1<f64>>,
    options: &PcgOptions,
) -> PcgResult
where
    T: LinearOperator<Elem = f64>,
    P: LinearOperator<Elem = f64>,
{
    let shifted = |v: &Array1<f64>| -> Array1<f64> {
        let mut Av = A.apply(v);
        Av.scaled_add(mu, v);
        Av
    };

    let b_norm = b.norm_l2();
    if b_norm == 0. {
        return PcgResult {
            solution: Array1::zeros(b.len()),
            iterations: 0,
            residual_norm: 0.,
            status: PcgStatus::Converged,
        };
    }
    let threshold = options.tol * b_norm;

    let mut x = match x0 {
        Some(x0) => x0.to_owned(),
        None => Array1::zeros(b.len()),
    };
    let mut r = &b - &shifted(&x);
    let mut r_norm = r.norm_l2();
    let finish = |x, iterations, residual_norm, status| PcgResult {
        solution: x,
        iterations,
        residual_norm,
        status,
    };
    if r_norm <= threshold {
        return finish(x, 0, r_norm, PcgStatus::Converged);
    }

    let mut z = Pinv.apply(&r);
    let mut p = z.clone();
    let mut rz = r.dot(&z);
    if !(rz > 0.) {
        return finish(x, 0, r_norm, PcgStatus::Breakdown);
    }

    for iter in 1..=options.max_iter {
        let Ap = shifted(&p);
        let curvature = p.dot(&Ap);
        if !(curvature > 0.) {
            log::debug!("pcg breakdown: curvature {:e} at iteration {}", curvature, iter);
            return finish(x, iter - 1, r_norm, PcgStatus::Breakdown);
        }
        let alpha = rz / curvature;
        x.scaled_add(alpha, &p);
        r.scaled_add(-alpha, &Ap);
        r_norm = r.norm_l2();
        if r_norm <= threshold {
            return finish(x, iter, r_norm, PcgStatus::Converged);
        }

        z = Pinv.apply(&r);
        let rz_new = r.dot(&z);
        if !(rz_new > 0.) {
            log::debug!("pcg breakdown: <r, Pr> = {:e} at iteration {}", rz_new, iter);
            return finish(x, iter, r_norm, PcgStatus::Breakdown);
        }
        p *= rz_new / rz;
        p += &z;
        rz = rz_new;
    }
    log::debug!(
        "pcg stopped after {} iterations, relative residual {:e}",
        options.max_iter,
        r_norm / b_norm
    );
    finish(x, options.max_iter, r_norm, PcgStatus::MaxIterReached)
}

/// Solve $`(A + \mu I) x = b`$ with CG preconditioned by a rank `rank`
/// Nyström sketch of $`A`$
///
/// A sketch that fails numerically (e.g. LAPACK errors on a degenerate
/// operator) does not fail the solve: plain CG is used instead.
///
/// Parameters
/// ----------
/// - __A:__        symmetric PSD operator of size $`n \times n`$
/// - __b:__        right-hand side
/// - __mu:__       strictly positive shift
/// - __rank:__     sketch size, $`1 \leq r \leq n`$
/// - __x0:__       initial guess, zero if `None`
/// - __options:__  tolerance and iteration cap
/// - __rng:__      source of the Gaussian test matrix
pub fn nystrom_pcg<T, R>(
    A: &T,
    b: ArrayView1<f64>,
    mu: f64,
    rank: usize,
    x0: Option<ArrayView1<f64>>,
    options: &PcgOptions,
    rng: &mut R,
) -> Result<PcgResult>
where
    T: LinearOperator<Elem = f64> + OperatorShape,
    R: Rng + ?Sized,
{
    ensure_positive("mu", mu)?;
    options.validate()?;
    let (n, m) = A.shape();
    ensure_len(n, m)?;
    ensure_len(n, b.len())?;
    if let Some(x0) = x0 {
        ensure_len(n, x0.len())?;
    }
    if rank == 0 || rank > n {
        return Err(SolverError::InvalidSketchSize {
            sketch_size: rank,
            dim: n,
        });
    }

    let Pinv = Preconditioner::nystrom_or_identity(NystromSketch::new(A, rank, rng), mu, n)?;
    Ok(pcg(A, b, mu, &Pinv, x0, options))
}


#[allow(non_snake_case)]
#[cfg(all(rustc_nightly, test))]
mod benches {
    use super::*;
    use crate::linop::Identity;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::StandardNormal;
    use test::Bencher;

    fn problem() -> (Array2<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(10);
        let G: Array2<f64> = Array::random_using((200, 30), StandardNormal, &mut rng);
        let b: Array1<f64> = Array::random_using(200, StandardNormal, &mut rng);
        (G.dot(&G.t()), b)
    }

    #[bench]
    fn plain_cg(bench: &mut Bencher) {
        let (A, b) = problem();
        let opts = PcgOptions::default();
        bench.iter(|| pcg(&A, b.view(), 1e-2, &Identity::new(200), None, &opts));
    }

    #[bench]
    fn sketched_cg(bench: &mut Bencher) {
        let (A, b) = problem();
        let opts = PcgOptions::default();
        let mut rng = StdRng::seed_from_u64(11);
        bench.iter(|| nystrom_pcg(&A, b.view(), 1e-2, 40, None, &opts, &mut rng));
    }
}
