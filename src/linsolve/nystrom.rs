//! Private Module

#![allow(non_snake_case)]

use crate::error::{Result, SolverError};
use crate::linop::{Identity, LinearOperator, OperatorShape};
use ndarray::prelude::*;
use ndarray::{Data, DataMut};
use ndarray_linalg::{Cholesky, Diag, Eigh, Norm, SolveTriangular, QR, SVD, UPLO};
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::StandardNormal;

/// Randomized Nyström approximation of a symmetric PSD operator
///
/// ```math
/// A \approx \hat A = U \Lambda U^T
/// ```
/// with $`U \in \mathbb{R}^{n \times k}`$ orthonormal and
/// $`\Lambda \succeq 0`$ sorted in decreasing order.
///
/// Algorithm
/// ---------
/// ```math
/// \begin{aligned}
/// \Omega &= \mathrm{orth}(G), \quad G_{ij} \sim \mathcal{N}(0, 1) \\
/// Y &= A\Omega \\
/// \nu &= \sqrt{n}\, \epsilon_{mach} \|Y\|_F \\
/// Y_\nu &= Y + \nu \Omega \\
/// L L^T &= \Omega^T Y_\nu \\
/// B &= Y_\nu L^{-T} = U \Sigma V^T \\
/// \Lambda &= \max(\Sigma^2 - \nu I, 0)
/// \end{aligned}
/// ```
/// The shift $`\nu`$ keeps the Cholesky factorization well defined in
/// floating point. When it still fails, the core matrix is pseudo-inverted
/// through its eigendecomposition instead. Components whose estimate
/// $`\sigma^2 - \nu`$ does not exceed the rounding floor
/// $`n \epsilon_{mach} \lambda_{max}`$ carry no information about $`A`$ and
/// are dropped, so the working rank $`k`$ may end up below the requested
/// rank [\[TYUC17\]](#references).
///
/// References
/// ----------
/// \[TYUC17\]: [ Tropp J, Yurtsever A, Udell M, Cevher V,
///              "Fixed-Rank Approximation of a Positive-Semidefinite Matrix
///              from Streaming Data", NeurIPS 2017 ](https://arxiv.org/abs/1706.05736)
#[derive(Debug, Clone)]
pub struct NystromSketch {
    U: Array2<f64>,
    lambda: Array1<f64>,
}

impl NystromSketch {
    /// Sketch `op` with `rank` Gaussian test vectors drawn from `rng`.
    pub fn new<T, R>(op: &T, rank: usize, rng: &mut R) -> Result<NystromSketch>
    where
        T: LinearOperator<Elem = f64> + OperatorShape,
        R: Rng + ?Sized,
    {
        let (n, m) = op.shape();
        if n != m {
            return Err(SolverError::DimensionMismatch {
                expected: n,
                actual: m,
            });
        }
        if rank == 0 || rank > n {
            return Err(SolverError::InvalidSketchSize {
                sketch_size: rank,
                dim: n,
            });
        }

        let G: Array2<f64> = Array::random_using((n, rank), StandardNormal, rng);
        let (omega, _) = G.qr()?;
        let Y = op.apply2(&omega);
        NystromSketch::from_range(omega.view(), Y)
    }

    /// Build the approximation from an orthonormal test matrix `omega`
    /// and its image `Y = A omega`.
    pub fn from_range(omega: ArrayView2<f64>, Y: Array2<f64>) -> Result<NystromSketch> {
        let n = Y.nrows();
        let nu = (n as f64).sqrt() * f64::EPSILON * Y.norm_l2();
        if nu == 0. || !nu.is_finite() {
            if !nu.is_finite() {
                log::warn!("non-finite values in Nystrom sketch, discarding it");
            }
            // A vanishes on the sketched subspace
            return Ok(NystromSketch::empty(n));
        }
        let Y_nu = Y + &(&omega * nu);
        let core = omega.t().dot(&Y_nu);
        let core = (&core + &core.t()) * 0.5;

        let B = match core.cholesky(UPLO::Lower) {
            Ok(L) => L
                .solve_triangular(UPLO::Lower, Diag::NonUnit, &Y_nu.t().to_owned())?
                .reversed_axes(),
            Err(err) => {
                log::debug!(
                    "cholesky of Nystrom core failed ({}), using eigendecomposition",
                    err
                );
                pseudo_sqrt_solve(&core, &Y_nu)?
            }
        };
        if B.ncols() == 0 {
            return Ok(NystromSketch::empty(n));
        }

        // thin SVD of B through its QR factorization
        let (Q, R) = B.qr()?;
        let (U_R, sigma, _) = R.svd(true, false)?;
        let U_R = U_R.ok_or_else(|| {
            SolverError::InvalidParameter("SVD returned no left singular vectors".into())
        })?;

        let lambda = sigma.mapv(|s| s * s - nu);
        let floor = (n as f64) * f64::EPSILON * lambda[0].max(0.);
        let keep = lambda.iter().take_while(|&&l| l > floor).count();
        if keep < sigma.len() {
            log::debug!(
                "Nystrom sketch rank shrunk from {} to {}",
                omega.ncols(),
                keep
            );
        }
        let U = Q.dot(&U_R.slice(s![.., ..keep]));
        let lambda = lambda.slice(s![..keep]).to_owned();
        Ok(NystromSketch { U, lambda })
    }

    /// Rank-zero approximation of an `n x n` operator
    pub fn empty(n: usize) -> NystromSketch {
        NystromSketch {
            U: Array2::zeros((n, 0)),
            lambda: Array1::zeros(0),
        }
    }

    /// Working rank $`k`$, at most the requested rank
    pub fn rank(&self) -> usize {
        self.lambda.len()
    }

    pub fn dim(&self) -> usize {
        self.U.nrows()
    }

    /// Orthonormal basis $`U`$
    pub fn basis(&self) -> ArrayView2<f64> {
        self.U.view()
    }

    /// Eigenvalue estimates $`\Lambda`$, decreasing
    pub fn eigenvalues(&self) -> ArrayView1<f64> {
        self.lambda.view()
    }

    /// $`\hat A v`$
    pub fn approx_apply(&self, v: ArrayView1<f64>) -> Array1<f64> {
        let coef = self.U.t().dot(&v) * &self.lambda;
        self.U.dot(&coef)
    }
}

/// $`Y M^{+1/2}`$ for a symmetric PSD core matrix $`M`$, keeping only
/// eigenvalues above machine precision relative to the largest one.
fn pseudo_sqrt_solve(core: &Array2<f64>, Y_nu: &Array2<f64>) -> Result<Array2<f64>> {
    let (d, V) = core.eigh(UPLO::Lower)?;
    let d_max = d.iter().cloned().fold(0., f64::max);
    let cutoff = f64::EPSILON * d_max * (d.len() as f64);
    let kept: Vec<usize> = (0..d.len()).rev().filter(|&i| d[i] > cutoff).collect();
    let mut B = Array2::zeros((Y_nu.nrows(), kept.len()));
    for (j, &i) in kept.iter().enumerate() {
        let col = Y_nu.dot(&V.column(i)) / d[i].sqrt();
        B.column_mut(j).assign(&col);
    }
    Ok(B)
}

/// Nyström preconditioner for the shifted system $`(A + \mu I) x = b`$
///
/// ```math
/// P^{-1} = U (\Lambda + \mu I)^{-1} U^T + \frac{1}{\mu} (I - U U^T)
/// ```
/// which is the exact inverse of $`\hat A + \mu I`$: on the sketched
/// subspace it inverts the approximation, on its complement it acts as
/// $`\mu^{-1} I`$.
#[derive(Debug, Clone)]
pub struct NystromPreconditioner {
    sketch: NystromSketch,
    mu: f64,
}

impl NystromPreconditioner {
    pub fn new(sketch: NystromSketch, mu: f64) -> Result<NystromPreconditioner> {
        crate::error::ensure_positive("mu", mu)?;
        Ok(NystromPreconditioner { sketch, mu })
    }

    pub fn sketch(&self) -> &NystromSketch {
        &self.sketch
    }

    pub fn mu(&self) -> f64 {
        self.mu
    }
}

impl OperatorShape for NystromPreconditioner {
    fn shape(&self) -> (usize, usize) {
        (self.sketch.dim(), self.sketch.dim())
    }
}

impl LinearOperator for NystromPreconditioner {
    type Elem = f64;

    fn apply<S>(&self, a: &ArrayBase<S, Ix1>) -> Array1<f64>
    where
        S: Data<Elem = f64>,
    {
        let U = &self.sketch.U;
        let Uta = U.t().dot(a);
        let mut out = (a - &U.dot(&Uta)) / self.mu;
        let inner = Uta / &(&self.sketch.lambda + self.mu);
        out += &U.dot(&inner);
        out
    }

    fn apply_mut<S>(&self, a: &mut ArrayBase<S, Ix1>)
    where
        S: DataMut<Elem = f64>,
    {
        let out = self.apply(&*a);
        a.assign(&out);
    }

    fn apply2<S>(&self, a: &ArrayBase<S, Ix2>) -> Array2<f64>
    where
        S: Data<Elem = f64>,
    {
        let U = &self.sketch.U;
        let UtA = U.t().dot(a);
        let mut out = (a - &U.dot(&UtA)) / self.mu;
        let scale = (&self.sketch.lambda + self.mu).insert_axis(Axis(1));
        let inner = UtA / &scale;
        out += &U.dot(&inner);
        out
    }
}

/// Preconditioner choices for [`pcg`](super::pcg)
pub enum Preconditioner {
    /// Plain conjugate gradient
    Identity(Identity<f64>),
    Nystrom(NystromPreconditioner),
}

impl Preconditioner {
    /// Nyström preconditioner from a sketching attempt, or the identity if
    /// sketching failed numerically.
    pub fn nystrom_or_identity(
        sketch: Result<NystromSketch>,
        mu: f64,
        dim: usize,
    ) -> Result<Preconditioner> {
        match sketch {
            Ok(sketch) => Ok(Preconditioner::Nystrom(NystromPreconditioner::new(
                sketch, mu,
            )?)),
            Err(SolverError::Linalg(err)) => {
                log::warn!(
                    "Nystrom sketch failed ({}), falling back to plain CG",
                    err
                );
                Ok(Preconditioner::Identity(Identity::new(dim)))
            }
            Err(err) => Err(err),
        }
    }

    /// Working rank of the sketch, zero for the identity
    pub fn rank(&self) -> usize {
        match self {
            Preconditioner::Identity(_) => 0,
            Preconditioner::Nystrom(p) => p.sketch().rank(),
        }
    }
}

impl OperatorShape for Preconditioner {
    fn shape(&self) -> (usize, usize) {
        match self {
            Preconditioner::Identity(p) => p.shape(),
            Preconditioner::Nystrom(p) => p.shape(),
        }
    }
}

impl LinearOperator for Preconditioner {
    type Elem = f64;

    fn apply<S>(&self, a: &ArrayBase<S, Ix1>) -> Array1<f64>
    where
        S: Data<Elem = f64>,
    {
        match self {
            Preconditioner::Identity(p) => p.apply(a),
            Preconditioner::Nystrom(p) => p.apply(a),
        }
    }

    fn apply_mut<S>(&self, a: &mut ArrayBase<S, Ix1>)
    where
        S: DataMut<Elem = f64>,
    {
        match self {
            Preconditioner::Identity(p) => p.apply_mut(a),
            Preconditioner::Nystrom(p) => p.apply_mut(a),
        }
    }
}
