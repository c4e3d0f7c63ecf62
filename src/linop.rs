//! Abstract Linear Operators
//! building upon ndarray_linalg::operator
//!
//! Operators here never materialize their matrix. Each one exposes its
//! [`OperatorShape`] and the matrix-vector product of
//! [`LinearOperator`]; sums of operators are themselves operators.

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::error::{OracleError, Result, SolverError};
use crate::oracle::{SmoothObjective, SmoothRegularizer};
use ndarray::prelude::*;
use ndarray::{Data, DataMut, DataOwned, NdFloat};
pub use ndarray_linalg::operator::LinearOperator;
use ndarray_linalg::Scalar;

/// `(rows, cols)` of an implicit operator
pub trait OperatorShape {
    fn shape(&self) -> (usize, usize);
}

impl<S> OperatorShape for ArrayBase<S, Ix2>
where
    S: Data,
{
    fn shape(&self) -> (usize, usize) {
        self.dim()
    }
}

#[derive(Default)]
pub struct Identity<A> {
    dim: usize,
    phantom: PhantomData<*const A>,
}

impl<A> Identity<A> {
    #[must_use]
    pub fn new(dim: usize) -> Identity<A> {
        Identity {
            dim,
            phantom: PhantomData,
        }
    }
}

impl<A> OperatorShape for Identity<A> {
    fn shape(&self) -> (usize, usize) {
        (self.dim, self.dim)
    }
}

impl<A> LinearOperator for Identity<A>
where
    A: NdFloat + Scalar,
{
    type Elem = A;

    /// Apply operator out-place
    #[inline]
    fn apply<S>(&self, a: &ArrayBase<S, Ix1>) -> Array1<S::Elem>
    where
        S: Data<Elem = Self::Elem>,
    {
        a.to_owned()
    }

    /// Apply operator in-place
    #[inline]
    fn apply_mut<S>(&self, _a: &mut ArrayBase<S, Ix1>)
    where
        S: DataMut<Elem = Self::Elem>,
    {
    }

    /// Apply operator with move
    #[inline]
    fn apply_into<S>(&self, a: ArrayBase<S, Ix1>) -> ArrayBase<S, Ix1>
    where
        S: DataOwned<Elem = Self::Elem> + DataMut,
    {
        a
    }
}

/// $`\alpha I`$, e.g. the ridge term $`\rho I`$ of an ADMM subproblem
#[derive(Debug, Clone, Copy)]
pub struct ScaledIdentity {
    dim: usize,
    alpha: f64,
}

impl ScaledIdentity {
    pub fn new(dim: usize, alpha: f64) -> ScaledIdentity {
        ScaledIdentity { dim, alpha }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

impl OperatorShape for ScaledIdentity {
    fn shape(&self) -> (usize, usize) {
        (self.dim, self.dim)
    }
}

impl LinearOperator for ScaledIdentity {
    type Elem = f64;

    #[inline]
    fn apply<S>(&self, a: &ArrayBase<S, Ix1>) -> Array1<f64>
    where
        S: Data<Elem = f64>,
    {
        a * self.alpha
    }

    #[inline]
    fn apply_mut<S>(&self, a: &mut ArrayBase<S, Ix1>)
    where
        S: DataMut<Elem = f64>,
    {
        *a *= self.alpha;
    }

    fn apply2<S>(&self, a: &ArrayBase<S, Ix2>) -> Array2<f64>
    where
        S: Data<Elem = f64>,
    {
        a * self.alpha
    }
}

/// Sum of two operators, $`(A + B)v = Av + Bv`$
pub struct AddLinearOperator<A, B> {
    lhs: A,
    rhs: B,
}

impl<A, B> AddLinearOperator<A, B>
where
    A: OperatorShape,
    B: OperatorShape,
{
    /// Fails if the two shapes differ.
    pub fn new(lhs: A, rhs: B) -> Result<AddLinearOperator<A, B>> {
        let (la, lb) = (lhs.shape(), rhs.shape());
        if la != lb {
            return Err(SolverError::InvalidParameter(format!(
                "cannot add operators of shape {:?} and {:?}",
                la, lb
            )));
        }
        Ok(AddLinearOperator { lhs, rhs })
    }

    pub fn lhs(&self) -> &A {
        &self.lhs
    }

    pub fn rhs(&self) -> &B {
        &self.rhs
    }
}

impl<A, B> OperatorShape for AddLinearOperator<A, B>
where
    A: OperatorShape,
{
    fn shape(&self) -> (usize, usize) {
        self.lhs.shape()
    }
}

impl<A, B> LinearOperator for AddLinearOperator<A, B>
where
    A: LinearOperator<Elem = f64>,
    B: LinearOperator<Elem = f64>,
{
    type Elem = f64;

    fn apply<S>(&self, a: &ArrayBase<S, Ix1>) -> Array1<f64>
    where
        S: Data<Elem = f64>,
    {
        let mut out = self.lhs.apply(a);
        out += &self.rhs.apply(a);
        out
    }

    fn apply_mut<S>(&self, a: &mut ArrayBase<S, Ix1>)
    where
        S: DataMut<Elem = f64>,
    {
        let out = self.apply(&*a);
        a.assign(&out);
    }

    /// Batched product $`(A + B)M = AM + BM`$, so each side keeps its own
    /// `apply2`.
    fn apply2<S>(&self, a: &ArrayBase<S, Ix2>) -> Array2<f64>
    where
        S: Data<Elem = f64>,
    {
        let mut out = self.lhs.apply2(a);
        out += &self.rhs.apply2(a);
        out
    }
}

/// Hessian of a [`SmoothObjective`] frozen at a point
///
/// ```math
/// v \mapsto \nabla^2 f(x; D) v
/// ```
///
/// [`LinearOperator::apply`] cannot fail, so the first error returned by
/// the oracle is latched: later products return zeros without calling the
/// oracle again, and the error is recovered with [`take_failure`](Self::take_failure)
/// once the consumer (typically an inner CG solve) is done.
pub struct HessianLinearOperator<'a, O, D> {
    oracle: &'a O,
    data: &'a D,
    params: ArrayView1<'a, f64>,
    failure: RefCell<Option<OracleError>>,
}

impl<'a, O, D> HessianLinearOperator<'a, O, D>
where
    O: SmoothObjective<D>,
{
    /// The view `params` may outlive `oracle` and `data`; it is shortened to
    /// their lifetime.
    pub fn new<'p: 'a>(oracle: &'a O, data: &'a D, params: ArrayView1<'p, f64>) -> Self {
        HessianLinearOperator {
            oracle,
            data,
            params: params.reborrow(),
            failure: RefCell::new(None),
        }
    }

    /// Point the Hessian is evaluated at
    pub fn params(&self) -> ArrayView1<'a, f64> {
        self.params
    }

    /// Return `Err` with the first oracle failure seen so far, if any.
    pub fn take_failure(&self) -> std::result::Result<(), OracleError> {
        match self.failure.borrow_mut().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<'a, O, D> OperatorShape for HessianLinearOperator<'a, O, D> {
    fn shape(&self) -> (usize, usize) {
        (self.params.len(), self.params.len())
    }
}

impl<'a, O, D> LinearOperator for HessianLinearOperator<'a, O, D>
where
    O: SmoothObjective<D>,
{
    type Elem = f64;

    fn apply<S>(&self, a: &ArrayBase<S, Ix1>) -> Array1<f64>
    where
        S: Data<Elem = f64>,
    {
        if self.failure.borrow().is_some() {
            return Array1::zeros(a.len());
        }
        match self.oracle.hvp(self.params, a.view(), self.data) {
            Ok(hv) => hv,
            Err(err) => {
                log::debug!("hessian-vector product failed: {}", err);
                *self.failure.borrow_mut() = Some(err);
                Array1::zeros(a.len())
            }
        }
    }

    fn apply_mut<S>(&self, a: &mut ArrayBase<S, Ix1>)
    where
        S: DataMut<Elem = f64>,
    {
        let out = self.apply(&*a);
        a.assign(&out);
    }
}

/// Hessian of a [`SmoothRegularizer`] frozen at a point
pub struct RegularizerHessian<'a, R> {
    reg: &'a R,
    params: ArrayView1<'a, f64>,
}

impl<'a, R> RegularizerHessian<'a, R>
where
    R: SmoothRegularizer,
{
    pub fn new<'p: 'a>(reg: &'a R, params: ArrayView1<'p, f64>) -> Self {
        RegularizerHessian {
            reg,
            params: params.reborrow(),
        }
    }
}

impl<'a, R> OperatorShape for RegularizerHessian<'a, R> {
    fn shape(&self) -> (usize, usize) {
        (self.params.len(), self.params.len())
    }
}

impl<'a, R> LinearOperator for RegularizerHessian<'a, R>
where
    R: SmoothRegularizer,
{
    type Elem = f64;

    fn apply<S>(&self, a: &ArrayBase<S, Ix1>) -> Array1<f64>
    where
        S: Data<Elem = f64>,
    {
        self.reg.hvp(self.params, a.view())
    }

    fn apply_mut<S>(&self, a: &mut ArrayBase<S, Ix1>)
    where
        S: DataMut<Elem = f64>,
    {
        let out = self.apply(&*a);
        a.assign(&out);
    }
}

/// Hessian of $`f + g`$ at a point, the operator NysADMM and the sketchy
/// solvers precondition.
pub type CompositeHessian<'a, O, D, R> =
    AddLinearOperator<HessianLinearOperator<'a, O, D>, RegularizerHessian<'a, R>>;

/// Build the [`CompositeHessian`] of `oracle + reg` at `params`.
///
/// `oracle`, `reg` and `data` are typically borrowed for a single sketch
/// while `params` views the longer lived iterate.
pub fn composite_hessian<'a, 'p: 'a, O, D, R>(
    oracle: &'a O,
    reg: &'a R,
    data: &'a D,
    params: ArrayView1<'p, f64>,
) -> Result<CompositeHessian<'a, O, D, R>>
where
    O: SmoothObjective<D>,
    R: SmoothRegularizer,
{
    AddLinearOperator::new(
        HessianLinearOperator::new(oracle, data, params),
        RegularizerHessian::new(reg, params),
    )
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{FnObjective, Ridge};
    use approx::assert_abs_diff_eq;
    use ndarray_rand::rand::rngs::StdRng;
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::StandardNormal;
    use ndarray_rand::RandomExt;

    #[test]
    fn identity() {
        let I = Identity::new(4);
        let d = array![1., 2., 3., 4.];

        assert!(I.apply(&d) == d);
        assert_eq!(I.shape(), (4, 4));
    }

    #[test]
    fn scaled_identity() {
        let S = ScaledIdentity::new(3, 2.5);
        let mut d = array![1., -2., 4.];
        assert_abs_diff_eq!(S.apply(&d), array![2.5, -5., 10.]);
        S.apply_mut(&mut d);
        assert_abs_diff_eq!(d, array![2.5, -5., 10.]);
    }

    #[test]
    fn add_matches_sum_of_applications() {
        let mut rng = StdRng::seed_from_u64(11);
        let A: Array2<f64> = Array::random_using((6, 6), StandardNormal, &mut rng);
        let B: Array2<f64> = Array::random_using((6, 6), StandardNormal, &mut rng);
        let sum = AddLinearOperator::new(A.clone(), B.clone()).unwrap();
        for _ in 0..5 {
            let v: Array1<f64> = Array::random_using(6, StandardNormal, &mut rng);
            let expected = A.dot(&v) + B.dot(&v);
            assert_abs_diff_eq!(sum.apply(&v), expected, epsilon = 1e-12);
        }

        // closed under composition
        let nested = AddLinearOperator::new(sum, ScaledIdentity::new(6, 3.)).unwrap();
        let v: Array1<f64> = Array::random_using(6, StandardNormal, &mut rng);
        let expected = A.dot(&v) + B.dot(&v) + &v * 3.;
        assert_abs_diff_eq!(nested.apply(&v), expected, epsilon = 1e-12);
    }

    #[test]
    fn add_rejects_shape_mismatch() {
        let res = AddLinearOperator::new(Identity::<f64>::new(3), ScaledIdentity::new(4, 1.));
        assert!(res.is_err());
    }

    #[test]
    fn hessian_operator_uses_frozen_point() {
        // f(x) = sum(x^4)/4, H(x) = diag(3 x^2)
        let f = FnObjective::new(
            |x: ArrayView1<f64>, _: &()| Ok(x.mapv(|t| t.powi(4)).sum() / 4.),
            |x: ArrayView1<f64>, _: &()| Ok(x.mapv(|t| t.powi(3))),
            |x: ArrayView1<f64>, v: ArrayView1<f64>, _: &()| Ok(&x.mapv(|t| 3. * t * t) * &v),
        );
        let x = array![1., 2.];
        let H = HessianLinearOperator::new(&f, &(), x.view());
        assert_eq!(H.shape(), (2, 2));
        assert_abs_diff_eq!(H.apply(&array![1., 1.]), array![3., 12.]);
        assert!(H.take_failure().is_ok());

        let M = H.apply2(&Array2::eye(2));
        assert_abs_diff_eq!(M, array![[3., 0.], [0., 12.]]);
    }

    #[test]
    fn batched_products_match_columnwise() {
        let mut rng = StdRng::seed_from_u64(5);
        let A: Array2<f64> = Array::random_using((5, 5), StandardNormal, &mut rng);
        let M: Array2<f64> = Array::random_using((5, 3), StandardNormal, &mut rng);

        let S = ScaledIdentity::new(5, -2.);
        assert_abs_diff_eq!(S.apply2(&M), &M * -2., epsilon = 1e-14);

        let sum = AddLinearOperator::new(A.clone(), S).unwrap();
        let expected = A.dot(&M) - &M * 2.;
        assert_abs_diff_eq!(sum.apply2(&M), expected, epsilon = 1e-12);
        for (j, col) in M.axis_iter(Axis(1)).enumerate() {
            assert_abs_diff_eq!(sum.apply(&col), expected.column(j), epsilon = 1e-12);
        }
    }

    // Oracle and data are borrowed for a shorter scope than the iterate,
    // the way a minibatch Hessian is built inside a solver loop.
    fn sketch_local_hessian<O>(oracle: &O, x: ArrayView1<f64>) -> Result<Array1<f64>>
    where
        O: SmoothObjective<Array2<f64>>,
    {
        let ridge = Ridge::new(1.);
        let batch = Array2::eye(x.len()) * 2.;
        let H = composite_hessian(oracle, &ridge, &batch, x)?;
        let hv = H.apply(&x);
        H.lhs().take_failure()?;
        Ok(hv)
    }

    #[test]
    fn hessian_of_locally_borrowed_data() {
        let f = FnObjective::new(
            |x: ArrayView1<f64>, q: &Array2<f64>| Ok(0.5 * x.dot(&q.dot(&x))),
            |x: ArrayView1<f64>, q: &Array2<f64>| Ok(q.dot(&x)),
            |_x: ArrayView1<f64>, v: ArrayView1<f64>, q: &Array2<f64>| Ok(q.dot(&v)),
        );
        let x = array![1., -1., 2.];
        let hv = sketch_local_hessian(&f, x.view()).unwrap();
        assert_abs_diff_eq!(hv, array![3., -3., 6.], epsilon = 1e-14);

        let hv2 = {
            let local = x.clone();
            sketch_local_hessian(&f, local.view()).unwrap()
        };
        assert_abs_diff_eq!(hv, hv2);
    }

    #[test]
    fn hessian_operator_latches_failure() {
        let f = FnObjective::new(
            |_x: ArrayView1<f64>, _: &()| Ok(0.),
            |x: ArrayView1<f64>, _: &()| Ok(x.to_owned()),
            |_x: ArrayView1<f64>, _v: ArrayView1<f64>, _: &()| Err("no hessian".into()),
        );
        let x = array![1., 2.];
        let H = HessianLinearOperator::new(&f, &(), x.view());
        assert_abs_diff_eq!(H.apply(&array![1., 1.]), array![0., 0.]);
        assert_abs_diff_eq!(H.apply(&array![1., 1.]), array![0., 0.]);
        let err = H.take_failure().unwrap_err();
        assert_eq!(err.to_string(), "no hessian");
        assert!(H.take_failure().is_ok());
    }

    #[test]
    fn composite_hessian_adds_ridge() {
        let f = FnObjective::new(
            |x: ArrayView1<f64>, q: &Array2<f64>| Ok(0.5 * x.dot(&q.dot(&x))),
            |x: ArrayView1<f64>, q: &Array2<f64>| Ok(q.dot(&x)),
            |_x: ArrayView1<f64>, v: ArrayView1<f64>, q: &Array2<f64>| Ok(q.dot(&v)),
        );
        let q = array![[2., 1.], [1., 2.]];
        let ridge = Ridge::new(0.5);
        let x = array![0., 0.];
        let H = composite_hessian(&f, &ridge, &q, x.view()).unwrap();
        assert_abs_diff_eq!(H.apply(&array![1., 0.]), array![2.5, 1.]);
    }
}
