//! The `ndarray-sketchy` crate provides sketch-preconditioned solvers for
//! composite convex problems over `ndarray` vectors,
//! ```math
//! \min_x f(x; D) + g(x) + h(x)
//! ```
//! where $`f`$ is a smooth loss known through its value, gradient and
//! Hessian-vector products, $`g`$ is a smooth regularizer and $`h`$ is
//! non-smooth with a cheap proximal operator.
//!
//! It includes:
//! - NysADMM, ADMM with Nyström-preconditioned inexact Newton steps
//! - SketchySGD and SketchySVRG
//! - Nyström sketches of implicit PSD operators and Nyström-PCG
//! - proximal operators, among them the projection onto a hyperplane
//!   intersected with a box, as found in the dual of support vector machines
//!
//! All randomness is drawn from a caller supplied `rand::Rng` or from a
//! `StdRng` seeded through the solver options, so runs are reproducible.
//!
//! The crate logs through the `log` facade and never installs a logger.
//! A LAPACK backend has to be selected with one of the `intel-mkl-static`,
//! `openblas-static`, `openblas-system` or `netlib-static` features.

#![cfg_attr(all(rustc_nightly, test), feature(test))]
#[cfg(all(rustc_nightly, test))]
extern crate test;

pub mod error;
pub mod linop;
pub mod linsolve;
pub mod oracle;
pub mod prox;
pub mod solver;

pub use error::{OracleError, Result, SolverError};
pub use linsolve::{nystrom_pcg, NystromSketch, PcgOptions, PcgResult, PcgStatus};
pub use oracle::{FnObjective, Ridge, SmoothObjective, SmoothRegularizer};
pub use prox::{project_hyperplane_box, ProximalOperator};
pub use solver::{NysAdmm, NysAdmmOptions, SketchySgd, SketchySvrg, SolverState, Status};
