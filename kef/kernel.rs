//! # Gaussian Kernel Derivatives
//!
//! Every quantity the estimator needs is a derivative of the Gaussian kernel
//!
//! k(x, y) = exp(-‖x - y‖² / (2σ))
//!
//! taken with respect to the coordinates of the first argument `x` (the
//! training point) and/or the second argument `y` (the point being evaluated).
//! Writing u = x - y and r² = ‖u‖², all derivatives are the kernel value times
//! a polynomial in u, so each function below computes `u`, `r²` and `k` once
//! and assembles the closed form.
//!
//! Naming follows the order of differentiation: `dx_dy` is ∂ₓ∂ᵧk, `dx_dx` is
//! the Laplacian in x (Σᵢ ∂²k/∂xᵢ²), `dx_dx_dy` is the gradient in y of that
//! Laplacian, and so on.
//!
//! ## Small bandwidths
//!
//! For σ much smaller than the squared spacing between points, every
//! off-diagonal kernel value underflows to exactly zero. Every derivative of
//! such a pair is then exactly zero as well, even where its polynomial factor
//! would overflow. The resulting system carries no coupling between points
//! and, without the ridge term, would be singular. `kernel_matrix` exists so
//! the system builder can detect and report this.

use crate::estimator::ValidationError;
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};

/// Radially symmetric Gaussian kernel with bandwidth `sigma`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianKernel {
    sigma: f64,
}

impl GaussianKernel {
    /// Creates a kernel, rejecting non-positive or non-finite bandwidths.
    pub fn new(sigma: f64) -> Result<Self, ValidationError> {
        if !(sigma > 0.0 && sigma.is_finite()) {
            return Err(ValidationError::InvalidSigma(sigma));
        }
        Ok(Self { sigma })
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// k(x, y).
    pub fn value(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
        let pair = internal::Pair::new(x, y, self.sigma);
        pair.k
    }

    /// Gradient of k with respect to `x`: -(u/σ) k.
    pub fn dx(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> Array1<f64> {
        let pair = internal::Pair::new(x, y, self.sigma);
        pair.u.mapv(|v| pair.weigh(-v / self.sigma))
    }

    /// Cross-Hessian ∂ₓ∂ᵧk as a D×D block: (I/σ - u uᵀ/σ²) k.
    ///
    /// This block is the RKHS inner product ⟨∂ᵢk(x,·), ∂ⱼk(y,·)⟩ and is
    /// symmetric in (i, j) as well as in the exchange of `x` and `y`.
    pub fn dx_dy(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> Array2<f64> {
        let pair = internal::Pair::new(x, y, self.sigma);
        let s = self.sigma;
        let d = pair.u.len();
        Array2::from_shape_fn((d, d), |(i, j)| {
            let delta = if i == j { 1.0 / s } else { 0.0 };
            pair.weigh(delta - pair.u[i] * pair.u[j] / (s * s))
        })
    }

    /// Laplacian of k in `x`: (r²/σ² - D/σ) k.
    pub fn dx_dx(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
        let pair = internal::Pair::new(x, y, self.sigma);
        pair.weigh(pair.laplacian_factor())
    }

    /// Gradient in `y` of the Laplacian in `x`:
    /// -(2u/σ² - (r²/σ² - D/σ) u/σ) k.
    pub fn dx_dx_dy(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> Array1<f64> {
        let pair = internal::Pair::new(x, y, self.sigma);
        let s = self.sigma;
        let factor = -(2.0 / (s * s) - pair.laplacian_factor() / s);
        pair.u.mapv(|v| pair.weigh(factor * v))
    }

    /// Hessian in `y` of the Laplacian in `x`, a D×D block:
    /// (2I/σ² - 4uuᵀ/σ³ + (r²/σ² - D/σ)(uuᵀ/σ² - I/σ)) k.
    pub fn dx_dx_dy_dy(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> Array2<f64> {
        let pair = internal::Pair::new(x, y, self.sigma);
        let s = self.sigma;
        let c = pair.laplacian_factor();
        let d = pair.u.len();
        Array2::from_shape_fn((d, d), |(l, m)| {
            let outer = pair.u[l] * pair.u[m];
            let delta = if l == m { 1.0 } else { 0.0 };
            let poly = 2.0 * delta / (s * s) - 4.0 * outer / (s * s * s)
                + c * (outer / (s * s) - delta / s);
            pair.weigh(poly)
        })
    }

    /// Trace of [`Self::dx_dx_dy_dy`], i.e. the fourth-order mixed term
    /// Σᵢⱼ ∂²ₓᵢ ∂²ᵧⱼ k = (2D/σ² - 4r²/σ³ + (r²/σ² - D/σ)²) k.
    pub fn dx_dx_dy_dy_sum(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
        let pair = internal::Pair::new(x, y, self.sigma);
        let s = self.sigma;
        let d = pair.u.len() as f64;
        let c = pair.laplacian_factor();
        pair.weigh(2.0 * d / (s * s) - 4.0 * pair.r2 / (s * s * s) + c * c)
    }

    /// Third-order term Σⱼ βⱼ ∂ₓⱼ ∂ᵧ∂ᵧ k contracted against `beta`, a D×D block:
    /// ((β uᵀ + u βᵀ + (β·u) I)/σ² - (β·u) u uᵀ/σ³) k.
    ///
    /// This is the Hessian in `y` of `dx(x, y) · beta`.
    pub fn dx_dy_dy_contract(
        &self,
        x: ArrayView1<f64>,
        y: ArrayView1<f64>,
        beta: ArrayView1<f64>,
    ) -> Array2<f64> {
        let pair = internal::Pair::new(x, y, self.sigma);
        let s = self.sigma;
        let u = &pair.u;
        let beta_u = beta.dot(u);
        let d = u.len();
        Array2::from_shape_fn((d, d), |(l, m)| {
            let delta = if l == m { beta_u } else { 0.0 };
            let poly = (beta[l] * u[m] + u[l] * beta[m] + delta) / (s * s)
                - beta_u * u[l] * u[m] / (s * s * s);
            pair.weigh(poly)
        })
    }

    /// Assembles every pairwise cross-Hessian block of the observations.
    ///
    /// `data` is D×N with one point per column. The result is ND×ND with block
    /// (a, b) at rows `a*D..(a+1)*D` and columns `b*D..(b+1)*D` holding
    /// `dx_dy(x_a, x_b)`. Only blocks with b ≥ a are evaluated; the rest are
    /// mirrored, which is exact because every block is itself symmetric.
    pub fn all_dx_dy(&self, data: ArrayView2<f64>) -> Array2<f64> {
        let d = data.nrows();
        let n = data.ncols();
        let nd = n * d;
        let mut out = Array2::<f64>::zeros((nd, nd));

        out.axis_chunks_iter_mut(Axis(0), d)
            .into_par_iter()
            .enumerate()
            .for_each(|(a, mut rows)| {
                let x_a = data.column(a);
                for b in a..n {
                    let block = self.dx_dy(x_a, data.column(b));
                    rows.slice_mut(s![.., b * d..(b + 1) * d]).assign(&block);
                }
            });

        for a in 1..n {
            for b in 0..a {
                let upper = out
                    .slice(s![b * d..(b + 1) * d, a * d..(a + 1) * d])
                    .to_owned();
                out.slice_mut(s![a * d..(a + 1) * d, b * d..(b + 1) * d])
                    .assign(&upper.t());
            }
        }

        out
    }

    /// N×N Gram matrix of kernel values between all pairs of columns of `data`.
    pub fn kernel_matrix(&self, data: ArrayView2<f64>) -> Array2<f64> {
        let n = data.ncols();
        Array2::from_shape_fn((n, n), |(a, b)| self.value(data.column(a), data.column(b)))
    }
}

mod internal {
    use super::*;

    /// The shared ingredients of every derivative for one (x, y) pair.
    pub(super) struct Pair {
        pub u: Array1<f64>,
        pub r2: f64,
        pub k: f64,
        sigma: f64,
    }

    impl Pair {
        pub(super) fn new(x: ArrayView1<f64>, y: ArrayView1<f64>, sigma: f64) -> Self {
            debug_assert_eq!(x.len(), y.len(), "kernel arguments differ in dimension");
            let u = &x - &y;
            let r2 = u.dot(&u);
            let k = (-r2 / (2.0 * sigma)).exp();
            Self { u, r2, k, sigma }
        }

        /// `poly * k`, exactly zero once k has underflowed. For tiny σ the
        /// polynomial overflows to infinity on the same pairs, and inf·0 is NaN.
        pub(super) fn weigh(&self, poly: f64) -> f64 {
            if self.k == 0.0 { 0.0 } else { poly * self.k }
        }

        /// r²/σ² - D/σ, the polynomial factor of the Laplacian.
        pub(super) fn laplacian_factor(&self) -> f64 {
            let d = self.u.len() as f64;
            self.r2 / (self.sigma * self.sigma) - d / self.sigma
        }
    }
}
