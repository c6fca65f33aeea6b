//! # Kernel Exponential Family Estimator
//!
//! `KernelExpFamily` owns a D×N training set, a Gaussian kernel and a ridge
//! strength. `fit` solves the score-matching system once; afterwards the
//! unnormalized log-density, its gradient and Hessian can be evaluated at the
//! points of the active query set.
//!
//! The query set is the training set until `set_test_data` installs another
//! matrix, and becomes the training set again on `reset_test_data`. Quantities
//! that are only defined over the training data (leverage, the system matrix
//! and vector) refuse to run while an explicit query set is active.

use crate::config::EstimatorConfig;
use crate::kernel::GaussianKernel;
use crate::memory::{MemoryBudget, ResourceLimitError};
use crate::system::{self, SystemTerms};
use crate::types::AlphaBeta;
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Malformed arguments, reported at the call that introduced them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Given observations cannot be empty.")]
    EmptyObservations,

    #[error("Dimension of given observations ({0}) must be positive.")]
    NonPositiveDimension(usize),

    #[error("Number of given observations ({0}) must be positive.")]
    NonPositiveCount(usize),

    #[error("Observation at dimension {dimension}, point {point} is not finite ({value}).")]
    NonFiniteObservation {
        dimension: usize,
        point: usize,
        value: f64,
    },

    #[error("Given sigma ({0}) must be positive and finite.")]
    InvalidSigma(f64),

    #[error("Given lambda ({0}) must be positive and finite.")]
    InvalidLambda(f64),

    #[error("Given memory limit ({0} GiB) must be positive.")]
    InvalidMemoryLimit(f64),

    #[error("Dimension of given observations ({found}) must match the estimator's ({expected}).")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("No matrix or vector with the given name ({0}).")]
    UnknownSelector(String),
}

/// Operations invoked in a state that does not support them.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("The estimator has not been fitted yet. Call fit() first.")]
    NotFitted,

    #[error("Cannot proceed with test data. Reset test data first.")]
    TestDataActive,
}

/// Every failure the estimator can report.
#[derive(Error, Debug)]
pub enum EstimatorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    ResourceLimit(#[from] ResourceLimitError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Given test data index ({index}) must be in [0, {len}).")]
    Index { index: usize, len: usize },

    #[error(
        "The regularized {size}x{size} system is not positive definite (sigma = {sigma:e}, lambda = {lambda:e}). Error: {source}"
    )]
    Numerical {
        size: usize,
        sigma: f64,
        lambda: f64,
        #[source]
        source: ndarray_linalg::error::LinalgError,
    },
}

/// The points queries are evaluated at.
#[derive(Debug, Clone, PartialEq)]
pub enum QuerySet {
    /// Queries run against the training points themselves.
    TrainingSet,
    /// Queries run against an explicit D×M matrix.
    Explicit(Array2<f64>),
}

/// Selects a matrix exposed for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixSelector {
    /// The regularized system matrix A.
    System,
}

/// Selects a vector exposed for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorSelector {
    /// The fitted coefficients.
    AlphaBeta,
    /// The right-hand side b of the system.
    System,
}

impl FromStr for MatrixSelector {
    type Err = ValidationError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "A" | "system" => Ok(Self::System),
            other => Err(ValidationError::UnknownSelector(other.to_string())),
        }
    }
}

impl FromStr for VectorSelector {
    type Err = ValidationError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "alpha_beta" => Ok(Self::AlphaBeta),
            "b" | "system" => Ok(Self::System),
            other => Err(ValidationError::UnknownSelector(other.to_string())),
        }
    }
}

impl fmt::Display for MatrixSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "A"),
        }
    }
}

impl fmt::Display for VectorSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlphaBeta => write!(f, "alpha_beta"),
            Self::System => write!(f, "b"),
        }
    }
}

/// Score-matching density estimator in a Gaussian RKHS.
#[derive(Debug, Clone)]
pub struct KernelExpFamily {
    data: Array2<f64>,
    kernel: GaussianKernel,
    lambda: f64,
    memory_limit_gib: f64,
    query: QuerySet,
    alpha_beta: Option<AlphaBeta>,
}

impl KernelExpFamily {
    /// Validates the inputs and checks the projected memory footprint.
    ///
    /// # Arguments
    ///
    /// * `data`: Observations, one point per column (D rows × N columns).
    /// * `sigma`: Kernel bandwidth, k(x, y) = exp(-‖x - y‖² / (2σ)).
    /// * `lambda`: Ridge strength.
    /// * `memory_limit_gib`: Ceiling for the dense assembly; see [`MemoryBudget`].
    pub fn new(
        data: Array2<f64>,
        sigma: f64,
        lambda: f64,
        memory_limit_gib: f64,
    ) -> Result<Self, EstimatorError> {
        internal::validate_observations(data.view())?;
        let kernel = GaussianKernel::new(sigma)?;
        internal::validate_lambda(lambda)?;
        internal::validate_memory_limit(memory_limit_gib)?;

        let (d, n) = data.dim();
        MemoryBudget::for_problem(n, d).enforce(memory_limit_gib)?;

        log::info!(
            "Kernel exponential family over {n} points in {d} dimensions (sigma = {sigma}, lambda = {lambda})"
        );

        Ok(Self {
            data,
            kernel,
            lambda,
            memory_limit_gib,
            query: QuerySet::TrainingSet,
            alpha_beta: None,
        })
    }

    pub fn from_config(data: Array2<f64>, config: &EstimatorConfig) -> Result<Self, EstimatorError> {
        Self::new(data, config.sigma, config.lambda, config.memory_limit_gib)
    }

    /// Solves the score-matching system and stores the coefficients.
    ///
    /// On failure the estimator keeps whatever coefficients it had before.
    pub fn fit(&mut self) -> Result<(), EstimatorError> {
        MemoryBudget::for_problem(self.num_lhs(), self.num_dimensions())
            .enforce(self.memory_limit_gib)?;

        log::info!(
            "Fitting: assembling a {0}x{0} system",
            self.num_lhs() * self.num_dimensions() + 1
        );
        let system = system::build_system(&self.kernel, self.data.view(), self.lambda);
        let alpha_beta = system::solve_system(system)?;
        log::info!("Fit complete (alpha = {:.6e})", alpha_beta.alpha());

        self.alpha_beta = Some(alpha_beta);
        Ok(())
    }

    pub fn is_fitted(&self) -> bool {
        self.alpha_beta.is_some()
    }

    /// Unnormalized log-density at query point `index`.
    pub fn log_pdf(&self, index: usize) -> Result<f64, EstimatorError> {
        let x = self.query_point(index)?;
        let alpha_beta = self.fitted()?;
        Ok(internal::log_pdf_at(&self.kernel, self.data.view(), alpha_beta, x))
    }

    /// Unnormalized log-density at every query point.
    pub fn log_pdf_multiple(&self) -> Result<Array1<f64>, EstimatorError> {
        let alpha_beta = self.fitted()?;
        let values: Vec<f64> = self
            .query_points()
            .axis_iter(Axis(1))
            .into_par_iter()
            .map(|x| internal::log_pdf_at(&self.kernel, self.data.view(), alpha_beta, x))
            .collect();
        Ok(Array1::from_vec(values))
    }

    /// Gradient of the log-density at query point `index` (length D).
    pub fn grad(&self, index: usize) -> Result<Array1<f64>, EstimatorError> {
        let x = self.query_point(index)?;
        let alpha_beta = self.fitted()?;
        Ok(internal::grad_at(&self.kernel, self.data.view(), alpha_beta, x))
    }

    /// Gradients at every query point, one per column (D × M).
    pub fn grad_multiple(&self) -> Result<Array2<f64>, EstimatorError> {
        let alpha_beta = self.fitted()?;
        let points = self.query_points();
        let gradients: Vec<Array1<f64>> = points
            .axis_iter(Axis(1))
            .into_par_iter()
            .map(|x| internal::grad_at(&self.kernel, self.data.view(), alpha_beta, x))
            .collect();

        let mut out = Array2::<f64>::zeros(points.dim());
        for (mut column, gradient) in out.axis_iter_mut(Axis(1)).zip(gradients.iter()) {
            column.assign(gradient);
        }
        Ok(out)
    }

    /// Hessian of the log-density at query point `index` (D × D).
    pub fn hessian(&self, index: usize) -> Result<Array2<f64>, EstimatorError> {
        let x = self.query_point(index)?;
        let alpha_beta = self.fitted()?;
        Ok(internal::hessian_at(&self.kernel, self.data.view(), alpha_beta, x))
    }

    /// Diagonal of [`Self::hessian`].
    pub fn hessian_diag(&self, index: usize) -> Result<Array1<f64>, EstimatorError> {
        Ok(self.hessian(index)?.diag().to_owned())
    }

    /// Score-matching loss of the fitted coefficients on the training data.
    pub fn objective(&self) -> Result<f64, EstimatorError> {
        let alpha_beta = self.fitted()?;
        Ok(internal::objective_over(
            &self.kernel,
            self.data.view(),
            alpha_beta,
            self.data.view(),
        ))
    }

    /// Score-matching loss of the fitted coefficients on the active query set.
    pub fn query_objective(&self) -> Result<f64, EstimatorError> {
        let alpha_beta = self.fitted()?;
        Ok(internal::objective_over(
            &self.kernel,
            self.data.view(),
            alpha_beta,
            self.query_points(),
        ))
    }

    /// The raw coefficient vector (length N·D + 1).
    pub fn alpha_beta(&self) -> Result<&AlphaBeta, EstimatorError> {
        self.fitted()
    }

    /// Hat-matrix diagonal summed per training point (length N).
    pub fn leverage(&self) -> Result<Array1<f64>, EstimatorError> {
        self.require_training_queries()?;
        self.fitted()?;
        MemoryBudget::for_problem(self.num_lhs(), self.num_dimensions())
            .enforce(self.memory_limit_gib)?;
        SystemTerms::compute(&self.kernel, self.data.view()).leverage(self.lambda)
    }

    /// Exposes an intermediate matrix of the fit.
    pub fn matrix(&self, selector: MatrixSelector) -> Result<Array2<f64>, EstimatorError> {
        self.require_training_queries()?;
        self.fitted()?;
        log::debug!("Rebuilding matrix {selector} from the training data");
        match selector {
            MatrixSelector::System => {
                Ok(system::build_system(&self.kernel, self.data.view(), self.lambda).matrix)
            }
        }
    }

    /// Exposes an intermediate vector of the fit.
    pub fn vector(&self, selector: VectorSelector) -> Result<Array1<f64>, EstimatorError> {
        self.require_training_queries()?;
        let alpha_beta = self.fitted()?;
        log::debug!("Exposing vector {selector}");
        match selector {
            VectorSelector::AlphaBeta => Ok(Array1::from(alpha_beta.clone())),
            VectorSelector::System => {
                Ok(system::build_system(&self.kernel, self.data.view(), self.lambda).vector)
            }
        }
    }

    /// Replaces the query set with the columns of `points` (D × M).
    pub fn set_test_data(&mut self, points: Array2<f64>) -> Result<(), EstimatorError> {
        let expected = self.num_dimensions();
        if points.nrows() != expected {
            return Err(ValidationError::DimensionMismatch {
                expected,
                found: points.nrows(),
            }
            .into());
        }
        internal::validate_observations(points.view())?;
        log::debug!("Query set replaced by {} explicit points", points.ncols());
        self.query = QuerySet::Explicit(points);
        Ok(())
    }

    /// Replaces the query set with the single point `point` (length D).
    pub fn set_test_point(&mut self, point: Array1<f64>) -> Result<(), EstimatorError> {
        let expected = self.num_dimensions();
        if point.len() != expected {
            return Err(ValidationError::DimensionMismatch {
                expected,
                found: point.len(),
            }
            .into());
        }
        let matrix = point.insert_axis(Axis(1));
        self.set_test_data(matrix)
    }

    /// Makes the training set the query set again.
    pub fn reset_test_data(&mut self) {
        self.query = QuerySet::TrainingSet;
    }

    pub fn is_test_equals_train_data(&self) -> bool {
        matches!(self.query, QuerySet::TrainingSet)
    }

    pub fn query_set(&self) -> &QuerySet {
        &self.query
    }

    pub fn num_dimensions(&self) -> usize {
        self.data.nrows()
    }

    pub fn num_lhs(&self) -> usize {
        self.data.ncols()
    }

    /// Number of points in the active query set.
    pub fn num_rhs(&self) -> usize {
        self.query_points().ncols()
    }

    pub fn sigma(&self) -> f64 {
        self.kernel.sigma()
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn kernel(&self) -> &GaussianKernel {
        &self.kernel
    }

    pub fn training_data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    fn query_points(&self) -> ArrayView2<'_, f64> {
        match &self.query {
            QuerySet::TrainingSet => self.data.view(),
            QuerySet::Explicit(points) => points.view(),
        }
    }

    fn query_point(&self, index: usize) -> Result<ArrayView1<'_, f64>, EstimatorError> {
        let points = self.query_points();
        let len = points.ncols();
        if index >= len {
            return Err(EstimatorError::Index { index, len });
        }
        Ok(points.index_axis_move(Axis(1), index))
    }

    fn fitted(&self) -> Result<&AlphaBeta, EstimatorError> {
        self.alpha_beta
            .as_ref()
            .ok_or(EstimatorError::State(StateError::NotFitted))
    }

    fn require_training_queries(&self) -> Result<(), StateError> {
        if self.is_test_equals_train_data() {
            Ok(())
        } else {
            Err(StateError::TestDataActive)
        }
    }
}

mod internal {
    use super::*;

    pub(super) fn validate_observations(data: ArrayView2<f64>) -> Result<(), ValidationError> {
        let (d, n) = data.dim();
        if d == 0 && n == 0 {
            return Err(ValidationError::EmptyObservations);
        }
        if d == 0 {
            return Err(ValidationError::NonPositiveDimension(d));
        }
        if n == 0 {
            return Err(ValidationError::NonPositiveCount(n));
        }
        if let Some(((dimension, point), &value)) =
            data.indexed_iter().find(|(_, value)| !value.is_finite())
        {
            return Err(ValidationError::NonFiniteObservation {
                dimension,
                point,
                value,
            });
        }
        Ok(())
    }

    pub(super) fn validate_lambda(lambda: f64) -> Result<(), ValidationError> {
        if lambda > 0.0 && lambda.is_finite() {
            Ok(())
        } else {
            Err(ValidationError::InvalidLambda(lambda))
        }
    }

    pub(super) fn validate_memory_limit(limit_gib: f64) -> Result<(), ValidationError> {
        if limit_gib > 0.0 {
            Ok(())
        } else {
            Err(ValidationError::InvalidMemoryLimit(limit_gib))
        }
    }

    /// f(x) = α ξ̂(x) + Σ_a β_aᵀ ∇ₓk(x_a, x).
    pub(super) fn log_pdf_at(
        kernel: &GaussianKernel,
        data: ArrayView2<f64>,
        alpha_beta: &AlphaBeta,
        x: ArrayView1<f64>,
    ) -> f64 {
        let (d, n) = data.dim();
        let mut xi = 0.0;
        let mut beta_sum = 0.0;
        for (a, x_a) in data.axis_iter(Axis(1)).enumerate() {
            xi += kernel.dx_dx(x_a, x);
            beta_sum += kernel.dx(x_a, x).dot(&alpha_beta.beta_block(a, d));
        }
        alpha_beta.alpha() * xi / n as f64 + beta_sum
    }

    pub(super) fn grad_at(
        kernel: &GaussianKernel,
        data: ArrayView2<f64>,
        alpha_beta: &AlphaBeta,
        x: ArrayView1<f64>,
    ) -> Array1<f64> {
        let (d, n) = data.dim();
        let mut xi_grad = Array1::<f64>::zeros(d);
        let mut beta_grad = Array1::<f64>::zeros(d);
        for (a, x_a) in data.axis_iter(Axis(1)).enumerate() {
            xi_grad += &kernel.dx_dx_dy(x_a, x);
            beta_grad += &kernel.dx_dy(x_a, x).dot(&alpha_beta.beta_block(a, d));
        }
        xi_grad * (alpha_beta.alpha() / n as f64) + beta_grad
    }

    pub(super) fn hessian_at(
        kernel: &GaussianKernel,
        data: ArrayView2<f64>,
        alpha_beta: &AlphaBeta,
        x: ArrayView1<f64>,
    ) -> Array2<f64> {
        let (d, n) = data.dim();
        let mut xi_hessian = Array2::<f64>::zeros((d, d));
        let mut beta_hessian = Array2::<f64>::zeros((d, d));
        for (a, x_a) in data.axis_iter(Axis(1)).enumerate() {
            xi_hessian += &kernel.dx_dx_dy_dy(x_a, x);
            beta_hessian += &kernel.dx_dy_dy_contract(x_a, x, alpha_beta.beta_block(a, d));
        }
        xi_hessian * (alpha_beta.alpha() / n as f64) + beta_hessian
    }

    /// (1/M) Σ_x Σₗ [½ (∂ₗ f(x))² + ∂²ₗ f(x)] over the columns of `points`.
    pub(super) fn objective_over(
        kernel: &GaussianKernel,
        data: ArrayView2<f64>,
        alpha_beta: &AlphaBeta,
        points: ArrayView2<f64>,
    ) -> f64 {
        let per_point: Vec<f64> = points
            .axis_iter(Axis(1))
            .into_par_iter()
            .map(|x| {
                let gradient = grad_at(kernel, data, alpha_beta, x);
                let laplacian = hessian_at(kernel, data, alpha_beta, x).diag().sum();
                0.5 * gradient.dot(&gradient) + laplacian
            })
            .collect();
        per_point.iter().sum::<f64>() / points.ncols() as f64
    }
}
