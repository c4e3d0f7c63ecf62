//! Private Module

#![allow(non_snake_case)]

use super::driver::{run_loop, LoopControl, SolverState};
use crate::error::{ensure_len, ensure_positive, OracleError, Result, SolverError};
use crate::linop::{composite_hessian, LinearOperator};
use crate::linsolve::{self, NystromSketch, PcgOptions, PcgStatus, Preconditioner};
use crate::oracle::{FnObjective, SmoothObjective, SmoothRegularizer};
use crate::prox::ProximalOperator;
use ndarray::prelude::*;
use ndarray_linalg::Norm;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Configuration of [`NysAdmm`]
#[derive(Debug, Clone)]
pub struct NysAdmmOptions {
    /// ADMM step size $`t`$, the penalty is $`\rho = 1/t`$
    pub step_size: f64,
    /// rank of the Nyström sketch, must be below the problem dimension
    pub sketch_size: usize,
    pub maxiter: usize,
    /// tolerance on both the primal and the dual residual
    pub tol: f64,
    /// relative residual tolerance of the inner PCG solve
    pub pcg_tol: f64,
    pub pcg_maxiter: usize,
    /// rebuild the preconditioner every `sketch_update_freq` iterations
    pub sketch_update_freq: usize,
    /// seed of the test matrices drawn by [`NysAdmm::run`]
    pub seed: u64,
    pub log_every: usize,
}

impl Default for NysAdmmOptions {
    fn default() -> Self {
        NysAdmmOptions {
            step_size: 1.,
            sketch_size: 10,
            maxiter: 100,
            tol: 1e-4,
            pcg_tol: 1e-8,
            pcg_maxiter: 100,
            sketch_update_freq: 1,
            seed: 0,
            log_every: 0,
        }
    }
}

impl NysAdmmOptions {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("step_size", self.step_size)?;
        if self.sketch_size == 0 {
            return Err(SolverError::InvalidParameter(
                "sketch_size must be at least 1".into(),
            ));
        }
        if self.sketch_update_freq == 0 {
            return Err(SolverError::InvalidParameter(
                "sketch_update_freq must be at least 1".into(),
            ));
        }
        self.pcg_options().validate()?;
        self.loop_control().validate()
    }

    fn pcg_options(&self) -> PcgOptions {
        PcgOptions {
            tol: self.pcg_tol,
            max_iter: self.pcg_maxiter,
        }
    }

    fn loop_control(&self) -> LoopControl {
        LoopControl {
            maxiter: self.maxiter,
            tol: self.tol,
            log_every: self.log_every,
        }
    }
}

/// ADMM splitting variables and diagnostics of the last inner solve
#[derive(Debug, Clone)]
pub struct AdmmState {
    /// iterate of the non-smooth block
    pub z: Array1<f64>,
    /// scaled dual variable
    pub u: Array1<f64>,
    pub pcg_iterations: usize,
    /// `None` before the first iteration
    pub pcg_status: Option<PcgStatus>,
    /// working rank of the current preconditioner
    pub sketch_rank: usize,
}

/// Nyström-preconditioned ADMM for composite problems
/// ```math
/// \min_x f(x; D) + g(x) + h(x)
/// ```
/// with $`f`$ smooth and accessed through Hessian-vector products, $`g`$ a
/// smooth regularizer and $`h`$ non-smooth with an accessible proximal
/// operator.
///
/// Algorithm
/// ---------
/// With $`\rho = 1/t`$ and $`H_k = \nabla^2 (f + g)(x_k)`$, each iteration
/// takes one Newton step on the augmented Lagrangian of the split
/// $`x = z`$:
/// ```math
/// \begin{aligned}
/// x_{k+1} &= (H_k + \rho I)^{-1} \left( H_k x_k - \nabla (f + g)(x_k) + \rho (z_k - u_k) \right) \\
/// z_{k+1} &= \mathrm{prox}_{t h}(x_{k+1} + u_k) \\
/// u_{k+1} &= u_k + x_{k+1} - z_{k+1}
/// \end{aligned}
/// ```
/// The linear system is solved inexactly by PCG with a randomized Nyström
/// preconditioner of $`H_k`$, rebuilt every `sketch_update_freq`
/// iterations. An inner solve that stops early still produces an update.
///
/// The run stops when $`\|x_{k+1} - z_{k+1}\|_2`$ and
/// $`\rho \|z_{k+1} - z_k\|_2`$ are both below `tol`.
///
/// References
/// ----------
/// \[ZFTU22\]: [ Zhao S, Frangella Z, Udell M,
///              "NysADMM: faster composite convex optimization via low-rank
///              approximation", ICML 2022 ](https://arxiv.org/abs/2202.11599)
pub struct NysAdmm<O, R, P> {
    oracle: O,
    reg: R,
    prox: P,
    options: NysAdmmOptions,
}

impl<O, R, P> NysAdmm<O, R, P>
where
    R: SmoothRegularizer,
{
    /// Fails on an invalid configuration, nothing is clamped.
    pub fn new(oracle: O, reg: R, prox: P, options: NysAdmmOptions) -> Result<Self> {
        options.validate()?;
        Ok(NysAdmm {
            oracle,
            reg,
            prox,
            options,
        })
    }

    pub fn options(&self) -> &NysAdmmOptions {
        &self.options
    }

    /// [`run_with_rng`](Self::run_with_rng) seeded from `options.seed`
    pub fn run<D, Q>(
        &self,
        init_params: Array1<f64>,
        data: &D,
        prox_params: &Q,
    ) -> Result<(Array1<f64>, SolverState<AdmmState>)>
    where
        O: SmoothObjective<D>,
        P: ProximalOperator<Q>,
    {
        let mut rng = StdRng::seed_from_u64(self.options.seed);
        self.run_with_rng(init_params, data, prox_params, &mut rng)
    }

    /// Minimize from `init_params`, drawing sketches from `rng`.
    ///
    /// Returns the final $`x`$ and the final state; $`z`$ and $`u`$ are in
    /// its auxiliary data.
    pub fn run_with_rng<D, Q, Rn>(
        &self,
        init_params: Array1<f64>,
        data: &D,
        prox_params: &Q,
        rng: &mut Rn,
    ) -> Result<(Array1<f64>, SolverState<AdmmState>)>
    where
        O: SmoothObjective<D>,
        P: ProximalOperator<Q>,
        Rn: Rng + ?Sized,
    {
        let opts = &self.options;
        let n = init_params.len();
        if opts.sketch_size >= n {
            return Err(SolverError::InvalidSketchSize {
                sketch_size: opts.sketch_size,
                dim: n,
            });
        }
        let rho = 1. / opts.step_size;
        let pcg_opts = opts.pcg_options();

        let value = self.value(init_params.view(), data)?;
        let mut Pinv = self.preconditioner(init_params.view(), data, rho, rng)?;
        let aux = AdmmState {
            z: init_params.clone(),
            u: Array1::zeros(n),
            pcg_iterations: 0,
            pcg_status: None,
            sketch_rank: Pinv.rank(),
        };
        let state = SolverState::new(init_params, value, aux);

        let state = run_loop(state, &opts.loop_control(), |state| {
            if state.iter_num > 0 && state.iter_num % opts.sketch_update_freq == 0 {
                Pinv = self.preconditioner(state.params.view(), data, rho, &mut *rng)?;
            }
            let aux = &state.aux;

            let solve = {
                let x = state.params.view();
                let H = composite_hessian(&self.oracle, &self.reg, data, x)?;
                let mut b = H.apply(&x);
                H.lhs().take_failure()?;
                b -= &self.oracle.gradient(x, data)?;
                b -= &self.reg.gradient(x);
                b.scaled_add(rho, &(&aux.z - &aux.u));

                let solve = linsolve::pcg(&H, b.view(), rho, &Pinv, Some(x), &pcg_opts);
                H.lhs().take_failure()?;
                solve
            };
            log::debug!(
                "inner pcg: {:?} after {} iterations, residual {:e}",
                solve.status,
                solve.iterations,
                solve.residual_norm
            );

            let x = solve.solution;
            let z = self.prox.prox((&x + &aux.u).view(), opts.step_size, prox_params)?;
            ensure_len(n, z.len())?;
            let u = &aux.u + &x - &z;

            let primal_residual = (&x - &z).norm_l2();
            let dual_residual = rho * (&z - &aux.z).norm_l2();
            let value = self.value(x.view(), data)?;

            Ok(SolverState {
                iter_num: state.iter_num,
                params: x,
                value,
                primal_residual,
                dual_residual,
                status: state.status,
                aux: AdmmState {
                    z,
                    u,
                    pcg_iterations: solve.iterations,
                    pcg_status: Some(solve.status),
                    sketch_rank: Pinv.rank(),
                },
            })
        })?;
        Ok((state.params.clone(), state))
    }

    /// $`f(x) + g(x)`$
    fn value<D>(&self, x: ArrayView1<f64>, data: &D) -> std::result::Result<f64, OracleError>
    where
        O: SmoothObjective<D>,
    {
        Ok(self.oracle.value(x, data)? + self.reg.value(x))
    }

    fn preconditioner<D, Rn>(
        &self,
        x: ArrayView1<f64>,
        data: &D,
        rho: f64,
        rng: &mut Rn,
    ) -> Result<Preconditioner>
    where
        O: SmoothObjective<D>,
        Rn: Rng + ?Sized,
    {
        let H = composite_hessian(&self.oracle, &self.reg, data, x)?;
        let sketch = NystromSketch::new(&H, self.options.sketch_size, rng);
        H.lhs().take_failure()?;
        let Pinv = Preconditioner::nystrom_or_identity(sketch, rho, x.len())?;
        log::debug!("rebuilt Nystrom preconditioner, rank {}", Pinv.rank());
        Ok(Pinv)
    }
}

impl<F, G, H, R, P> NysAdmm<FnObjective<F, G, H>, R, P>
where
    R: SmoothRegularizer,
{
    /// Build the solver from the closures `fun`, `grad_fun` and `hvp_fun`
    /// of the smooth loss.
    pub fn from_fns<D>(
        fun: F,
        grad_fun: G,
        hvp_fun: H,
        reg: R,
        prox: P,
        options: NysAdmmOptions,
    ) -> Result<Self>
    where
        F: Fn(ArrayView1<f64>, &D) -> std::result::Result<f64, OracleError>,
        G: Fn(ArrayView1<f64>, &D) -> std::result::Result<Array1<f64>, OracleError>,
        H: Fn(ArrayView1<f64>, ArrayView1<f64>, &D) -> std::result::Result<Array1<f64>, OracleError>,
    {
        NysAdmm::new(
            FnObjective::new::<D>(fun, grad_fun, hvp_fun),
            reg,
            prox,
            options,
        )
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::Ridge;
    use crate::prox::{BoxProjection, HyperplaneBoxParams, HyperplaneBoxProjection};
    use crate::solver::Status;
    use ndarray_rand::RandomExt;
    use rand_distr::StandardNormal;

    /// $`f(x) = \frac12 x^T Q x - 1^T x`$
    struct Quadratic;

    impl SmoothObjective<Array2<f64>> for Quadratic {
        fn value(&self, x: ArrayView1<f64>, Q: &Array2<f64>) -> std::result::Result<f64, OracleError> {
            Ok(0.5 * x.dot(&Q.dot(&x)) - x.sum())
        }

        fn gradient(
            &self,
            x: ArrayView1<f64>,
            Q: &Array2<f64>,
        ) -> std::result::Result<Array1<f64>, OracleError> {
            Ok(Q.dot(&x) - 1.)
        }

        fn hvp(
            &self,
            _x: ArrayView1<f64>,
            v: ArrayView1<f64>,
            Q: &Array2<f64>,
        ) -> std::result::Result<Array1<f64>, OracleError> {
            Ok(Q.dot(&v))
        }
    }

    fn gram(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let G: Array2<f64> = Array::random_using((n, n), StandardNormal, &mut rng);
        G.t().dot(&G) / (n as f64) + Array2::<f64>::eye(n)
    }

    fn labels(n: usize) -> Array1<f64> {
        Array1::from_shape_fn(n, |i| if i % 2 == 0 { 1. } else { -1. })
    }

    fn options() -> NysAdmmOptions {
        NysAdmmOptions {
            step_size: 0.5,
            sketch_size: 5,
            maxiter: 200,
            tol: 1e-4,
            ..NysAdmmOptions::default()
        }
    }

    #[test]
    fn converges_on_box_constrained_qp() {
        let n = 10;
        let Q = gram(n, 21);
        let params = HyperplaneBoxParams {
            coeffs: labels(n),
            upper: 1.,
        };
        let solver = NysAdmm::new(
            Quadratic,
            Ridge::default(),
            HyperplaneBoxProjection::default(),
            options(),
        )
        .unwrap();

        let (x, state) = solver.run(Array1::zeros(n), &Q, &params).unwrap();
        assert_eq!(state.status, Status::Converged);
        assert!(state.iter_num <= 200);
        assert!(state.aux.sketch_rank > 0);

        let z = &state.aux.z;
        assert!(params.coeffs.dot(z).abs() <= 1e-8);
        assert!(z.iter().all(|&v| (0. ..=1.).contains(&v)));
        assert!((&x - z).norm_l2() <= 1e-4);
    }

    #[test]
    fn same_seed_same_run() {
        let n = 10;
        let Q = gram(n, 22);
        let solver = NysAdmm::new(Quadratic, Ridge::new(0.1), BoxProjection::new(0., 1.), options())
            .unwrap();
        let (x1, s1) = solver.run(Array1::zeros(n), &Q, &()).unwrap();
        let (x2, s2) = solver.run(Array1::zeros(n), &Q, &()).unwrap();
        assert_eq!(x1, x2);
        assert_eq!(s1.iter_num, s2.iter_num);
        assert!(s1.converged());
    }

    #[test]
    fn from_closures() {
        let n = 6;
        let solver = NysAdmm::from_fns(
            |x: ArrayView1<f64>, c: &Array1<f64>| Ok(0.5 * (&x - c).mapv(|v| v * v).sum()),
            |x: ArrayView1<f64>, c: &Array1<f64>| Ok(&x - c),
            |_x: ArrayView1<f64>, v: ArrayView1<f64>, _c: &Array1<f64>| Ok(v.to_owned()),
            Ridge::default(),
            BoxProjection::new(0., 1.),
            NysAdmmOptions {
                sketch_size: 2,
                ..NysAdmmOptions::default()
            },
        )
        .unwrap();
        let c = array![-1., 0.5, 2., 0.2, 1., -0.3];
        let (_, state) = solver.run(Array1::zeros(n), &c, &()).unwrap();
        assert!(state.converged());
        let expected = c.mapv(|v: f64| v.max(0.).min(1.));
        assert!((&state.aux.z - &expected).norm_l2() <= 1e-3);
    }

    #[test]
    fn maxiter_is_a_status() {
        let n = 10;
        let Q = gram(n, 23);
        let params = HyperplaneBoxParams {
            coeffs: labels(n),
            upper: 1.,
        };
        let solver = NysAdmm::new(
            Quadratic,
            Ridge::default(),
            HyperplaneBoxProjection::default(),
            NysAdmmOptions {
                maxiter: 2,
                ..options()
            },
        )
        .unwrap();
        let (_, state) = solver.run(Array1::zeros(n), &Q, &params).unwrap();
        assert_eq!(state.status, Status::MaxIterReached);
        assert_eq!(state.iter_num, 2);
        assert!(state.aux.pcg_status.is_some());
    }

    #[test]
    fn capped_inner_solves_still_converge() {
        let n = 10;
        let Q = gram(n, 25);
        let exact = NysAdmm::new(Quadratic, Ridge::new(0.1), BoxProjection::new(0., 1.), options())
            .unwrap();
        let (x_ref, reference) = exact.run(Array1::zeros(n), &Q, &()).unwrap();
        assert!(reference.converged());

        // two CG steps per subproblem never reach the inner tolerance
        let capped = NysAdmm::new(
            Quadratic,
            Ridge::new(0.1),
            BoxProjection::new(0., 1.),
            NysAdmmOptions {
                pcg_tol: 1e-14,
                pcg_maxiter: 2,
                maxiter: 2000,
                ..options()
            },
        )
        .unwrap();
        let (x, state) = capped.run(Array1::zeros(n), &Q, &()).unwrap();
        assert_eq!(state.status, Status::Converged);
        assert_eq!(state.aux.pcg_status, Some(PcgStatus::MaxIterReached));
        assert_eq!(state.aux.pcg_iterations, 2);
        assert!((&x - &x_ref).norm_l2() <= 1e-2);
    }

    #[test]
    fn lazy_sketch_refresh() {
        let n = 10;
        let Q = gram(n, 26);
        let params = HyperplaneBoxParams {
            coeffs: labels(n),
            upper: 1.,
        };
        let run = |sketch_update_freq| {
            NysAdmm::new(
                Quadratic,
                Ridge::default(),
                HyperplaneBoxProjection::default(),
                NysAdmmOptions {
                    sketch_update_freq,
                    ..options()
                },
            )
            .unwrap()
            .run(Array1::zeros(n), &Q, &params)
            .unwrap()
        };

        let (_, every) = run(1);
        let (x, lazy) = run(3);
        assert_eq!(lazy.status, Status::Converged);
        // the sketch was rebuilt at least once inside the loop
        assert!(lazy.iter_num > 3);
        assert!(lazy.aux.sketch_rank > 0);
        assert!(params.coeffs.dot(&lazy.aux.z).abs() <= 1e-8);
        assert!((&lazy.aux.z - &every.aux.z).norm_l2() <= 1e-2);
        assert!((&x - &lazy.aux.z).norm_l2() <= 1e-4);
    }

    #[test]
    fn oracle_errors_propagate() {
        let solver = NysAdmm::from_fns(
            |_x: ArrayView1<f64>, _d: &()| Ok(0.),
            |_x: ArrayView1<f64>, _d: &()| Err("gradient unavailable".into()),
            |_x: ArrayView1<f64>, v: ArrayView1<f64>, _d: &()| Ok(v.to_owned()),
            Ridge::default(),
            BoxProjection::new(0., 1.),
            NysAdmmOptions {
                sketch_size: 2,
                ..NysAdmmOptions::default()
            },
        )
        .unwrap();
        match solver.run(Array1::zeros(4), &(), &()) {
            Err(SolverError::Oracle(err)) => assert_eq!(err.to_string(), "gradient unavailable"),
            other => panic!("unexpected result {:?}", other.map(|(x, _)| x)),
        }

        let failing_hvp = NysAdmm::from_fns(
            |_x: ArrayView1<f64>, _d: &()| Ok(0.),
            |x: ArrayView1<f64>, _d: &()| Ok(x.to_owned()),
            |_x: ArrayView1<f64>, _v: ArrayView1<f64>, _d: &()| Err("no curvature".into()),
            Ridge::default(),
            BoxProjection::new(0., 1.),
            NysAdmmOptions {
                sketch_size: 2,
                ..NysAdmmOptions::default()
            },
        )
        .unwrap();
        match failing_hvp.run(Array1::zeros(4), &(), &()) {
            Err(SolverError::Oracle(err)) => assert_eq!(err.to_string(), "no curvature"),
            other => panic!("unexpected result {:?}", other.map(|(x, _)| x)),
        }
    }

    #[test]
    fn prox_errors_propagate() {
        let solver = NysAdmm::new(
            Quadratic,
            Ridge::default(),
            BoxProjection::new(1., 0.),
            options(),
        )
        .unwrap();
        let res = solver.run(Array1::zeros(10), &gram(10, 24), &());
        assert!(matches!(res, Err(SolverError::Oracle(_))));
    }

    #[test]
    fn rejects_invalid_configuration() {
        let bad = [
            NysAdmmOptions {
                step_size: 0.,
                ..options()
            },
            NysAdmmOptions {
                step_size: -1.,
                ..options()
            },
            NysAdmmOptions {
                sketch_size: 0,
                ..options()
            },
            NysAdmmOptions {
                tol: 0.,
                ..options()
            },
            NysAdmmOptions {
                pcg_tol: -1e-3,
                ..options()
            },
            NysAdmmOptions {
                sketch_update_freq: 0,
                ..options()
            },
        ];
        for opts in bad.iter() {
            assert!(NysAdmm::new(Quadratic, Ridge::default(), BoxProjection::new(0., 1.), opts.clone())
                .is_err());
        }

        let solver = NysAdmm::new(Quadratic, Ridge::default(), BoxProjection::new(0., 1.), options())
            .unwrap();
        assert!(matches!(
            solver.run(Array1::zeros(5), &gram(5, 25), &()),
            Err(SolverError::InvalidSketchSize {
                sketch_size: 5,
                dim: 5
            })
        ));
    }
}
