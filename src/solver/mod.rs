//! Sketch-preconditioned solvers for composite convex problems
//!
//! The solvers share one outer loop, [`run_loop`], which owns the iteration
//! count, the stopping test on the primal and dual residuals and the
//! progress logging. Each solver only provides its update rule
//! `SolverState<A> -> Result<SolverState<A>>`.
//!
//! - [`NysAdmm`]: ADMM whose smooth subproblem is a Newton system solved by
//!   Nyström-preconditioned CG, for $`f + g + h`$ with $`h`$ non-smooth
//! - [`SketchySgd`] and [`SketchySvrg`]: stochastic gradient methods
//!   preconditioned by a sketch of a subsampled Hessian

mod driver;
pub use driver::*;
mod nysadmm;
pub use nysadmm::*;
mod sketchy;
pub use sketchy::*;
