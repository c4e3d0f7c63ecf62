//! Sketch-Preconditioned Linear Solvers
//!
//! Iterative solvers for shifted symmetric systems
//! ```math
//! (A + \mu I) x = b, \quad A \succeq 0, \quad \mu > 0
//! ```
//! where $`A`$ is only available through matrix-vector products, e.g. the
//! Hessian of a loss evaluated with Hessian-vector products.
//!
//! When the spectrum of $`A`$ decays quickly, a randomized Nyström
//! approximation $`\hat A = U \Lambda U^T`$ of modest rank captures most of
//! it, and $`(\hat A + \mu I)^{-1}`$ makes an excellent preconditioner for
//! conjugate gradient [\[FTU23\]](#references).
//!
//! References
//! ----------
//! \[FTU23\]: [ Frangella Z, Tropp J, Udell M,
//!             "Randomized Nyström Preconditioning",
//!             SIAM J. Matrix Anal. Appl. 44(2), 2023 ](https://arxiv.org/abs/2110.02820)

mod nystrom;
pub use nystrom::*;
mod pcg;
pub use pcg::*;
