//! Private Module

use crate::error::{ensure_positive, Result, SolverError};
use ndarray::prelude::*;

/// Where a run stands; `Converged` and `MaxIterReached` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Initialized,
    Running,
    Converged,
    MaxIterReached,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Converged | Status::MaxIterReached)
    }
}

/// Iterate of an outer solver loop
///
/// `aux` holds what a particular solver carries between iterations on top
/// of the shared bookkeeping, e.g. the splitting variables of ADMM.
#[derive(Debug, Clone)]
pub struct SolverState<A> {
    pub iter_num: usize,
    pub params: Array1<f64>,
    /// smooth part of the objective at `params`
    pub value: f64,
    pub primal_residual: f64,
    pub dual_residual: f64,
    pub status: Status,
    pub aux: A,
}

impl<A> SolverState<A> {
    /// Fresh state at `params`; residuals start at infinity.
    pub fn new(params: Array1<f64>, value: f64, aux: A) -> SolverState<A> {
        SolverState {
            iter_num: 0,
            params,
            value,
            primal_residual: f64::INFINITY,
            dual_residual: f64::INFINITY,
            status: Status::Initialized,
            aux,
        }
    }

    pub fn converged(&self) -> bool {
        self.status == Status::Converged
    }
}

/// Stopping rule and logging cadence of [`run_loop`]
#[derive(Debug, Clone, Copy)]
pub struct LoopControl {
    pub maxiter: usize,
    /// both residuals must fall below `tol`
    pub tol: f64,
    /// log progress every `log_every` iterations, 0 disables
    pub log_every: usize,
}

impl LoopControl {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("tol", self.tol)?;
        if self.maxiter == 0 {
            return Err(SolverError::InvalidParameter(
                "maxiter must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Drive `update` until the residuals meet `control.tol` or
/// `control.maxiter` updates have been made.
///
/// `update` maps one state to the next and only has to fill in the
/// iterate, value, residuals and auxiliary data. The iteration counter and
/// the status are owned by the loop. The first error returned by `update`
/// ends the run and is passed through untouched.
pub fn run_loop<A, F>(
    mut state: SolverState<A>,
    control: &LoopControl,
    mut update: F,
) -> Result<SolverState<A>>
where
    F: FnMut(SolverState<A>) -> Result<SolverState<A>>,
{
    control.validate()?;
    while !state.status.is_terminal() {
        state.status = Status::Running;
        let iter_num = state.iter_num + 1;
        state = update(state)?;
        state.iter_num = iter_num;

        if state.primal_residual <= control.tol && state.dual_residual <= control.tol {
            state.status = Status::Converged;
        } else if iter_num >= control.maxiter {
            state.status = Status::MaxIterReached;
        }

        if control.log_every > 0 && iter_num % control.log_every == 0 {
            log::info!(
                "iter {:>6}  value {:>12.6e}  primal {:>10.3e}  dual {:>10.3e}",
                iter_num,
                state.value,
                state.primal_residual,
                state.dual_residual
            );
        }
    }
    log::info!(
        "{:?} after {} iterations: value {:e}, primal {:e}, dual {:e}",
        state.status,
        state.iter_num,
        state.value,
        state.primal_residual,
        state.dual_residual
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(maxiter: usize, tol: f64) -> LoopControl {
        LoopControl {
            maxiter,
            tol,
            log_every: 1,
        }
    }

    #[test]
    fn stops_at_maxiter() {
        let state = SolverState::new(array![1.], 0., ());
        let mut calls = 0;
        let state = run_loop(state, &control(5, 1e-6), |mut s| {
            calls += 1;
            assert_eq!(s.status, Status::Running);
            s.primal_residual = 1.;
            s.dual_residual = 1.;
            Ok(s)
        })
        .unwrap();
        assert_eq!(calls, 5);
        assert_eq!(state.iter_num, 5);
        assert_eq!(state.status, Status::MaxIterReached);
    }

    #[test]
    fn converges_when_both_residuals_are_small() {
        // halve x each iteration, primal residual lags the dual one
        let state = SolverState::new(array![1.], 0.5, 0usize);
        let state = run_loop(state, &control(100, 1e-3), |mut s| {
            s.params *= 0.5;
            s.value = 0.5 * s.params[0] * s.params[0];
            s.primal_residual = s.params[0];
            s.dual_residual = 1e-9;
            s.aux += 1;
            Ok(s)
        })
        .unwrap();
        assert!(state.converged());
        assert_eq!(state.iter_num, 10);
        assert_eq!(state.aux, 10);
        assert!(state.params[0] <= 1e-3);
    }

    #[test]
    fn update_error_aborts_run() {
        let state = SolverState::new(array![0.], 0., ());
        let res = run_loop(state, &control(10, 1e-3), |s| {
            if s.iter_num == 3 {
                Err(SolverError::InvalidParameter("stop".into()))
            } else {
                Ok(s)
            }
        });
        match res {
            Err(SolverError::InvalidParameter(msg)) => assert_eq!(msg, "stop"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_control() {
        let state = SolverState::new(array![0.], 0., ());
        assert!(run_loop(state.clone(), &control(0, 1e-3), Ok).is_err());
        assert!(run_loop(state, &control(3, 0.), Ok).is_err());
    }
}
