//! Sketch-preconditioned stochastic gradient methods
//!
//! Both solvers minimize $`f(x; D) + g(x)`$ for data that can be
//! subsampled by rows. Every `update_freq` iterations the Hessian of a
//! random subsample is sketched into a Nyström preconditioner $`P`$, and the
//! learning rate is set from the largest eigenvalue of the preconditioned
//! subsampled Hessian,
//! ```math
//! \eta = \frac{s}{\lambda_{\max}(P^{-1} H_S)}
//! ```
//! estimated by power iteration. Steps are
//! $`x_{k+1} = x_k - \eta P^{-1} \hat g_k`$ with $`\hat g_k`$ a minibatch
//! gradient ([`SketchySgd`]) or its variance-reduced counterpart
//! ([`SketchySvrg`]).
//!
//! Both report `value` as the objective over the full data at the new
//! iterate, not over the minibatch.
//!
//! References
//! ----------
//! \[FRU23\]: [ Frangella Z, Rathore P, Zhao S, Udell M,
//!             "SketchySGD: Reliable Stochastic Optimization via Randomized
//!             Curvature Estimates" ](https://arxiv.org/abs/2211.08597)

#![allow(non_snake_case)]

use super::driver::{run_loop, LoopControl, SolverState};
use crate::error::{ensure_positive, Result, SolverError};
use crate::linop::{composite_hessian, LinearOperator};
use crate::linsolve::{NystromSketch, Preconditioner};
use crate::oracle::{SmoothObjective, SmoothRegularizer};
use ndarray::prelude::*;
use ndarray_linalg::Norm;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Problem data that can be restricted to a subset of its samples
pub trait Batched: Sized {
    /// number of samples
    fn num_samples(&self) -> usize;

    /// the samples at `rows`, in that order
    fn select_rows(&self, rows: &[usize]) -> Self;
}

/// Supervised data, one sample per row of `features`
#[derive(Debug, Clone)]
pub struct Dataset {
    pub features: Array2<f64>,
    pub targets: Array1<f64>,
}

impl Dataset {
    pub fn new(features: Array2<f64>, targets: Array1<f64>) -> Result<Dataset> {
        crate::error::ensure_len(features.nrows(), targets.len())?;
        Ok(Dataset { features, targets })
    }
}

impl Batched for Dataset {
    fn num_samples(&self) -> usize {
        self.features.nrows()
    }

    fn select_rows(&self, rows: &[usize]) -> Dataset {
        Dataset {
            features: self.features.select(Axis(0), rows),
            targets: self.targets.select(Axis(0), rows),
        }
    }
}

/// Configuration of [`SketchySgd`]
#[derive(Debug, Clone)]
pub struct SketchySgdOptions {
    /// scale $`s`$ of the automatic learning rate
    pub lr_scale: f64,
    pub batch_size: usize,
    pub hessian_batch_size: usize,
    pub sketch_size: usize,
    /// shift $`\rho`$ of the preconditioner
    pub rho: f64,
    /// refresh the preconditioner every `update_freq` iterations
    pub update_freq: usize,
    /// power iterations for the learning rate
    pub power_iters: usize,
    pub maxiter: usize,
    pub tol: f64,
    pub seed: u64,
    pub log_every: usize,
}

impl Default for SketchySgdOptions {
    fn default() -> Self {
        SketchySgdOptions {
            lr_scale: 0.5,
            batch_size: 32,
            hessian_batch_size: 64,
            sketch_size: 10,
            rho: 1e-3,
            update_freq: 20,
            power_iters: 20,
            maxiter: 1000,
            tol: 1e-8,
            seed: 0,
            log_every: 0,
        }
    }
}

impl SketchySgdOptions {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("lr_scale", self.lr_scale)?;
        ensure_positive("rho", self.rho)?;
        for &(name, value) in &[
            ("batch_size", self.batch_size),
            ("hessian_batch_size", self.hessian_batch_size),
            ("sketch_size", self.sketch_size),
            ("update_freq", self.update_freq),
            ("power_iters", self.power_iters),
        ] {
            if value == 0 {
                return Err(SolverError::InvalidParameter(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }
        self.loop_control().validate()
    }

    fn loop_control(&self) -> LoopControl {
        LoopControl {
            maxiter: self.maxiter,
            tol: self.tol,
            log_every: self.log_every,
        }
    }

    /// Reject problems the batch and sketch sizes do not fit.
    fn check_problem(&self, dim: usize, num_samples: usize) -> Result<()> {
        if self.sketch_size >= dim {
            return Err(SolverError::InvalidSketchSize {
                sketch_size: self.sketch_size,
                dim,
            });
        }
        if self.batch_size > num_samples || self.hessian_batch_size > num_samples {
            return Err(SolverError::InvalidParameter(format!(
                "batch sizes {} and {} exceed the {} available samples",
                self.batch_size, self.hessian_batch_size, num_samples
            )));
        }
        Ok(())
    }
}

/// Configuration of [`SketchySvrg`]
#[derive(Debug, Clone)]
pub struct SketchySvrgOptions {
    pub sgd: SketchySgdOptions,
    /// take a new full-gradient snapshot every `snapshot_freq` iterations
    pub snapshot_freq: usize,
}

impl Default for SketchySvrgOptions {
    fn default() -> Self {
        SketchySvrgOptions {
            sgd: SketchySgdOptions::default(),
            snapshot_freq: 50,
        }
    }
}

impl SketchySvrgOptions {
    pub fn validate(&self) -> Result<()> {
        if self.snapshot_freq == 0 {
            return Err(SolverError::InvalidParameter(
                "snapshot_freq must be at least 1".into(),
            ));
        }
        self.sgd.validate()
    }
}

/// Preconditioner and learning rate of the current sketch
#[derive(Debug, Clone, Copy)]
pub struct SketchyState {
    pub learning_rate: f64,
    pub sketch_rank: usize,
}

/// Subsample, sketch and pick the learning rate at `x`.
fn refresh<O, R, D, Rn>(
    oracle: &O,
    reg: &R,
    data: &D,
    x: ArrayView1<f64>,
    opts: &SketchySgdOptions,
    rng: &mut Rn,
) -> Result<(Preconditioner, f64)>
where
    O: SmoothObjective<D>,
    R: SmoothRegularizer,
    D: Batched,
    Rn: Rng + ?Sized,
{
    let rows = sample(rng, data.num_samples(), opts.hessian_batch_size).into_vec();
    let batch = data.select_rows(&rows);
    let H = composite_hessian(oracle, reg, &batch, x)?;

    let sketch = NystromSketch::new(&H, opts.sketch_size, rng);
    H.lhs().take_failure()?;
    let Pinv = Preconditioner::nystrom_or_identity(sketch, opts.rho, x.len())?;

    let lambda = preconditioned_lambda_max(&H, &Pinv, x.len(), opts.power_iters, rng);
    H.lhs().take_failure()?;
    let learning_rate = if lambda > 0. && lambda.is_finite() {
        opts.lr_scale / lambda
    } else {
        log::warn!(
            "power iteration returned {}, falling back to lr_scale * rho",
            lambda
        );
        opts.lr_scale * opts.rho
    };
    log::debug!(
        "sketch rank {}, lambda_max {:e}, learning rate {:e}",
        Pinv.rank(),
        lambda,
        learning_rate
    );
    Ok((Pinv, learning_rate))
}

/// Dominant eigenvalue of $`P^{-1} H`$
///
/// The product is similar to $`P^{-1/2} H P^{-1/2}`$, so its spectrum is real
/// and non-negative and plain power iteration applies.
fn preconditioned_lambda_max<T, P, Rn>(H: &T, Pinv: &P, n: usize, iters: usize, rng: &mut Rn) -> f64
where
    T: LinearOperator<Elem = f64>,
    P: LinearOperator<Elem = f64>,
    Rn: Rng + ?Sized,
{
    let mut v: Array1<f64> = Array::random_using(n, StandardNormal, rng);
    v /= v.norm_l2();
    let mut lambda = 0.;
    for _ in 0..iters {
        let w = Pinv.apply(&H.apply(&v));
        lambda = w.norm_l2();
        if !(lambda > 0.) {
            break;
        }
        v = w / lambda;
    }
    lambda
}

/// `batch_size` distinct samples drawn uniformly
fn minibatch<D, Rn>(data: &D, batch_size: usize, rng: &mut Rn) -> D
where
    D: Batched,
    Rn: Rng + ?Sized,
{
    let rows = sample(rng, data.num_samples(), batch_size).into_vec();
    data.select_rows(&rows)
}

/// SketchySGD
///
/// Algorithm
/// ---------
/// ```math
/// \begin{aligned}
/// g_k &= \nabla f(x_k; S_k) + \nabla g(x_k) \\
/// x_{k+1} &= x_k - \eta P^{-1} g_k
/// \end{aligned}
/// ```
/// The primal residual is the step length $`\|x_{k+1} - x_k\|_2`$, the dual
/// residual the norm of the minibatch gradient.
pub struct SketchySgd<O, R> {
    oracle: O,
    reg: R,
    options: SketchySgdOptions,
}

impl<O, R> SketchySgd<O, R>
where
    R: SmoothRegularizer,
{
    pub fn new(oracle: O, reg: R, options: SketchySgdOptions) -> Result<Self> {
        options.validate()?;
        Ok(SketchySgd {
            oracle,
            reg,
            options,
        })
    }

    pub fn run<D>(
        &self,
        init_params: Array1<f64>,
        data: &D,
    ) -> Result<(Array1<f64>, SolverState<SketchyState>)>
    where
        O: SmoothObjective<D>,
        D: Batched,
    {
        let mut rng = StdRng::seed_from_u64(self.options.seed);
        self.run_with_rng(init_params, data, &mut rng)
    }

    pub fn run_with_rng<D, Rn>(
        &self,
        init_params: Array1<f64>,
        data: &D,
        rng: &mut Rn,
    ) -> Result<(Array1<f64>, SolverState<SketchyState>)>
    where
        O: SmoothObjective<D>,
        D: Batched,
        Rn: Rng + ?Sized,
    {
        let opts = &self.options;
        opts.check_problem(init_params.len(), data.num_samples())?;

        let x0 = init_params.view();
        let value = self.oracle.value(x0, data)? + self.reg.value(x0);
        let (mut Pinv, learning_rate) =
            refresh(&self.oracle, &self.reg, data, init_params.view(), opts, rng)?;
        let aux = SketchyState {
            learning_rate,
            sketch_rank: Pinv.rank(),
        };
        let state = SolverState::new(init_params, value, aux);

        let state = run_loop(state, &opts.loop_control(), |mut state| {
            if state.iter_num > 0 && state.iter_num % opts.update_freq == 0 {
                let (P, lr) = refresh(
                    &self.oracle,
                    &self.reg,
                    data,
                    state.params.view(),
                    opts,
                    &mut *rng,
                )?;
                Pinv = P;
                state.aux = SketchyState {
                    learning_rate: lr,
                    sketch_rank: Pinv.rank(),
                };
            }

            let batch = minibatch(data, opts.batch_size, &mut *rng);
            let x = state.params.view();
            let g = self.oracle.gradient(x, &batch)? + self.reg.gradient(x);
            let step = Pinv.apply(&g) * state.aux.learning_rate;

            state.params -= &step;
            state.primal_residual = step.norm_l2();
            state.dual_residual = g.norm_l2();
            state.value =
                self.oracle.value(state.params.view(), data)? + self.reg.value(state.params.view());
            Ok(state)
        })?;
        Ok((state.params.clone(), state))
    }
}

/// SketchySVRG
///
/// Algorithm
/// ---------
/// Every `snapshot_freq` iterations $`\tilde x = x_k`$ and the full gradient
/// $`\tilde g = \nabla f(\tilde x; D)`$ are stored, then
/// ```math
/// \begin{aligned}
/// g_k &= \nabla f(x_k; S_k) - \nabla f(\tilde x; S_k) + \tilde g + \nabla g(x_k) \\
/// x_{k+1} &= x_k - \eta P^{-1} g_k
/// \end{aligned}
/// ```
pub struct SketchySvrg<O, R> {
    oracle: O,
    reg: R,
    options: SketchySvrgOptions,
}

impl<O, R> SketchySvrg<O, R>
where
    R: SmoothRegularizer,
{
    pub fn new(oracle: O, reg: R, options: SketchySvrgOptions) -> Result<Self> {
        options.validate()?;
        Ok(SketchySvrg {
            oracle,
            reg,
            options,
        })
    }

    pub fn run<D>(
        &self,
        init_params: Array1<f64>,
        data: &D,
    ) -> Result<(Array1<f64>, SolverState<SketchyState>)>
    where
        O: SmoothObjective<D>,
        D: Batched,
    {
        let mut rng = StdRng::seed_from_u64(self.options.sgd.seed);
        self.run_with_rng(init_params, data, &mut rng)
    }

    pub fn run_with_rng<D, Rn>(
        &self,
        init_params: Array1<f64>,
        data: &D,
        rng: &mut Rn,
    ) -> Result<(Array1<f64>, SolverState<SketchyState>)>
    where
        O: SmoothObjective<D>,
        D: Batched,
        Rn: Rng + ?Sized,
    {
        let opts = &self.options.sgd;
        opts.check_problem(init_params.len(), data.num_samples())?;

        let x0 = init_params.view();
        let value = self.oracle.value(x0, data)? + self.reg.value(x0);
        let (mut Pinv, learning_rate) =
            refresh(&self.oracle, &self.reg, data, init_params.view(), opts, rng)?;
        let mut snapshot = init_params.clone();
        let mut full_grad = self.oracle.gradient(snapshot.view(), data)?;
        let aux = SketchyState {
            learning_rate,
            sketch_rank: Pinv.rank(),
        };
        let state = SolverState::new(init_params, value, aux);

        let state = run_loop(state, &opts.loop_control(), |mut state| {
            if state.iter_num > 0 && state.iter_num % self.options.snapshot_freq == 0 {
                snapshot = state.params.clone();
                full_grad = self.oracle.gradient(snapshot.view(), data)?;
                log::debug!("new snapshot, full gradient norm {:e}", full_grad.norm_l2());
            }
            if state.iter_num > 0 && state.iter_num % opts.update_freq == 0 {
                let (P, lr) = refresh(
                    &self.oracle,
                    &self.reg,
                    data,
                    state.params.view(),
                    opts,
                    &mut *rng,
                )?;
                Pinv = P;
                state.aux = SketchyState {
                    learning_rate: lr,
                    sketch_rank: Pinv.rank(),
                };
            }

            let batch = minibatch(data, opts.batch_size, &mut *rng);
            let x = state.params.view();
            let mut g = self.oracle.gradient(x, &batch)?;
            g -= &self.oracle.gradient(snapshot.view(), &batch)?;
            g += &full_grad;
            g += &self.reg.gradient(x);
            let step = Pinv.apply(&g) * state.aux.learning_rate;

            state.params -= &step;
            state.primal_residual = step.norm_l2();
            state.dual_residual = g.norm_l2();
            state.value =
                self.oracle.value(state.params.view(), data)? + self.reg.value(state.params.view());
            Ok(state)
        })?;
        Ok((state.params.clone(), state))
    }
}
