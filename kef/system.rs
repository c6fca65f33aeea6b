//! # Score-Matching System Assembly and Solve
//!
//! Fitting a kernel exponential family by score matching reduces to one dense
//! linear system. With the representer
//!
//! f = θ₀ ξ̂ + Σ_{a,i} θ_(a,i) ∂ᵢk(x_a, ·),   ξ̂ = (1/N) Σ_a Σᵢ ∂²ᵢk(x_a, ·),
//!
//! the regularized score-matching loss is a quadratic in θ whose normal
//! equations are A θ = b with
//!
//! - A₀₀ = hᵀh/N + λ‖ξ̂‖²
//! - A₀,rest = G h/N + λ h
//! - A_rest,rest = G G/N + λ G + λ I
//! - b = -(‖ξ̂‖², h)
//!
//! where G is the ND×ND matrix of all pairwise cross-Hessians ∂ₓ∂ᵧk(x_a, x_b)
//! and h_(a,i) = ∂ᵢξ̂(x_a). The λ I ridge on the kernel block keeps A positive
//! definite even when G is rank deficient, so a Cholesky solve applies.

use crate::estimator::EstimatorError;
use crate::kernel::GaussianKernel;
use crate::types::AlphaBeta;
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{FactorizeCInto, SolveC, UPLO};

/// The assembled normal equations A θ = b.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    pub matrix: Array2<f64>,
    pub vector: Array1<f64>,
    /// Bandwidth and ridge the system was assembled with.
    pub sigma: f64,
    pub lambda: f64,
}

/// Kernel sums over the training set from which the system is assembled.
#[derive(Debug, Clone)]
pub struct SystemTerms {
    /// ∂ᵢξ̂ evaluated at every training point, point-major (length ND).
    pub h: Array1<f64>,
    /// ‖ξ̂‖² in the RKHS.
    pub xi_norm_2: f64,
    /// All pairwise cross-Hessian blocks (ND×ND).
    pub all_hessians: Array2<f64>,
    sigma: f64,
    num_points: usize,
    num_dimensions: usize,
}

impl SystemTerms {
    /// Evaluates h, ‖ξ̂‖² and the all-Hessians tensor for a D×N training set.
    pub fn compute(kernel: &GaussianKernel, data: ArrayView2<f64>) -> Self {
        let num_dimensions = data.nrows();
        let num_points = data.ncols();

        internal::warn_on_kernel_underflow(kernel, data);

        log::debug!("Computing h for {num_points} points in {num_dimensions} dimensions");
        let h = compute_h(kernel, data);

        log::debug!("Computing the RKHS norm of xi");
        let xi_norm_2 = compute_xi_norm_2(kernel, data);

        log::debug!("Computing all {num_points}x{num_points} kernel cross-Hessian blocks");
        let all_hessians = kernel.all_dx_dy(data);

        Self {
            h,
            xi_norm_2,
            all_hessians,
            sigma: kernel.sigma(),
            num_points,
            num_dimensions,
        }
    }

    /// Populates A and b for ridge strength `lambda`.
    pub fn assemble(&self, lambda: f64) -> LinearSystem {
        let nd = self.h.len();
        let n = self.num_points as f64;
        let g = &self.all_hessians;

        log::debug!("Populating the {}x{} system matrix", nd + 1, nd + 1);
        let mut matrix = Array2::<f64>::zeros((nd + 1, nd + 1));

        matrix[[0, 0]] = self.h.dot(&self.h) / n + lambda * self.xi_norm_2;

        let mut coupling = g.dot(&self.h) / n;
        coupling.scaled_add(lambda, &self.h);
        matrix.slice_mut(s![1.., 0]).assign(&coupling);
        matrix.slice_mut(s![0, 1..]).assign(&coupling);

        {
            let mut block = matrix.slice_mut(s![1.., 1..]);
            block.assign(&g.dot(g));
            block /= n;
            block.scaled_add(lambda, g);
            let mut diagonal = block.diag_mut();
            diagonal += lambda;
        }
        internal::mirror_lower_triangle(&mut matrix);

        let mut vector = Array1::<f64>::zeros(nd + 1);
        vector[0] = -self.xi_norm_2;
        vector.slice_mut(s![1..]).assign(&self.h.mapv(|v| -v));

        LinearSystem {
            matrix,
            vector,
            sigma: self.sigma,
            lambda,
        }
    }

    /// The score-matching loss (without the regularizer) of `alpha_beta` on
    /// the training set, in closed form: (1/2N)‖Cθ‖² - bᵀθ with C = [h | G].
    pub fn training_objective(&self, alpha_beta: &AlphaBeta) -> f64 {
        let n = self.num_points as f64;
        let fitted_scores = self.all_hessians.dot(&alpha_beta.beta()) + &self.h * alpha_beta.alpha();
        let quadratic = fitted_scores.dot(&fitted_scores) / (2.0 * n);
        let linear = self.xi_norm_2 * alpha_beta.alpha() + self.h.dot(&alpha_beta.beta());
        quadratic + linear
    }

    /// Diagonal of the hat matrix H = (1/N) C A⁻¹ Cᵀ, summed over the D
    /// dimensions of each training point.
    ///
    /// Each row of C is solved against a single Cholesky factor of A, so only
    /// one ND + 1 buffer per worker is live at a time.
    pub fn leverage(&self, lambda: f64) -> Result<Array1<f64>, EstimatorError> {
        let nd = self.h.len();
        let n = self.num_points as f64;
        let d = self.num_dimensions;
        let sigma = self.sigma;
        let system = self.assemble(lambda);
        let factor = system
            .matrix
            .factorizec_into(UPLO::Lower)
            .map_err(|source| EstimatorError::Numerical {
                size: nd + 1,
                sigma,
                lambda,
                source,
            })?;

        log::debug!("Solving {nd} hat-matrix rows");
        let per_row: Vec<f64> = (0..nd)
            .into_par_iter()
            .map(|row| -> Result<f64, LinalgError> {
                let mut c = Array1::<f64>::zeros(nd + 1);
                c[0] = self.h[row];
                c.slice_mut(s![1..]).assign(&self.all_hessians.row(row));
                let solved = factor.solvec(&c)?;
                Ok(c.dot(&solved) / n)
            })
            .collect::<Result<_, LinalgError>>()
            .map_err(|source| EstimatorError::Numerical {
                size: nd + 1,
                sigma,
                lambda,
                source,
            })?;

        Ok(Array1::from_shape_fn(self.num_points, |a| {
            per_row[a * d..(a + 1) * d].iter().sum()
        }))
    }
}

/// h_(a,i) = (1/N) Σ_b ∂ᵧᵢ Δₓk(x_b, x_a), the gradient of ξ̂ at each training point.
pub fn compute_h(kernel: &GaussianKernel, data: ArrayView2<f64>) -> Array1<f64> {
    let d = data.nrows();
    let n = data.ncols();
    let mut h = Array1::<f64>::zeros(n * d);

    h.axis_chunks_iter_mut(Axis(0), d)
        .into_par_iter()
        .enumerate()
        .for_each(|(a, mut chunk)| {
            let x_a = data.column(a);
            for x_b in data.axis_iter(Axis(1)) {
                chunk += &kernel.dx_dx_dy(x_b, x_a);
            }
            chunk /= n as f64;
        });

    h
}

/// ‖ξ̂‖² = (1/N²) Σ_{a,b} Σᵢⱼ ∂²ₓᵢ ∂²ᵧⱼ k(x_a, x_b).
pub fn compute_xi_norm_2(kernel: &GaussianKernel, data: ArrayView2<f64>) -> f64 {
    let n = data.ncols();
    // Per-row partial sums are reduced sequentially so repeated fits agree bit for bit.
    let row_sums: Vec<f64> = data
        .axis_iter(Axis(1))
        .into_par_iter()
        .map(|x_a| {
            data.axis_iter(Axis(1))
                .map(|x_b| kernel.dx_dx_dy_dy_sum(x_a, x_b))
                .sum::<f64>()
        })
        .collect();
    row_sums.iter().sum::<f64>() / (n * n) as f64
}

/// Assembles the system for `data` without solving it.
pub fn build_system(kernel: &GaussianKernel, data: ArrayView2<f64>, lambda: f64) -> LinearSystem {
    SystemTerms::compute(kernel, data).assemble(lambda)
}

/// Solves the system with a lower Cholesky factorization, consuming it.
pub fn solve_system(system: LinearSystem) -> Result<AlphaBeta, EstimatorError> {
    let LinearSystem {
        matrix,
        vector,
        sigma,
        lambda,
    } = system;
    let size = vector.len();
    log::debug!("Factorizing the {size}x{size} system matrix");
    let factor = matrix
        .factorizec_into(UPLO::Lower)
        .map_err(|source| EstimatorError::Numerical {
            size,
            sigma,
            lambda,
            source,
        })?;
    let solution = factor
        .solvec_into(vector)
        .map_err(|source| EstimatorError::Numerical {
            size,
            sigma,
            lambda,
            source,
        })?;
    Ok(AlphaBeta::new(solution))
}

mod internal {
    use super::*;

    /// Copies the lower triangle over the upper one so A is exactly symmetric
    /// regardless of summation order inside the matrix product.
    pub(super) fn mirror_lower_triangle(matrix: &mut Array2<f64>) {
        let size = matrix.nrows();
        for i in 0..size {
            for j in (i + 1)..size {
                matrix[[i, j]] = matrix[[j, i]];
            }
        }
    }

    pub(super) fn warn_on_kernel_underflow(kernel: &GaussianKernel, data: ArrayView2<f64>) {
        if data.ncols() < 2 {
            return;
        }
        let gram = kernel.kernel_matrix(data);
        let coupled = gram
            .indexed_iter()
            .any(|((a, b), &value)| a != b && value > 0.0);
        if !coupled {
            log::warn!(
                "Every off-diagonal kernel value underflowed to zero (sigma = {:e}). \
                 The bandwidth is far below the spacing of the points; the fit is \
                 held together by the ridge term alone.",
                kernel.sigma()
            );
        }
    }
}
