use approx::assert_abs_diff_eq;
use kexfam::{
    DEFAULT_MEMORY_LIMIT_GIB, EstimatorError, KernelExpFamily, MatrixSelector, StateError,
    SystemTerms, ValidationError, VectorSelector,
};
use ndarray::{Array1, Array2, array};

mod common;
use common::gaussian_points;

fn fitted(num_dimensions: usize, num_points: usize, sigma: f64, lambda: f64) -> KernelExpFamily {
    let data = gaussian_points(num_dimensions, num_points, 42);
    let mut estimator =
        KernelExpFamily::new(data, sigma, lambda, DEFAULT_MEMORY_LIMIT_GIB).unwrap();
    estimator.fit().unwrap();
    estimator
}

#[test]
fn small_two_dimensional_scenario() {
    let mut estimator = fitted(2, 5, 1.0, 0.01);

    assert_eq!(estimator.alpha_beta().unwrap().len(), 11);
    assert!(estimator.is_test_equals_train_data());

    let log_pdf = estimator.log_pdf_multiple().unwrap();
    assert_eq!(log_pdf.len(), 5);
    assert!(log_pdf.iter().all(|v| v.is_finite()), "log_pdf: {log_pdf}");

    estimator.set_test_point(array![0.3, -0.4]).unwrap();
    assert!(estimator.log_pdf(0).unwrap().is_finite());
    assert!(!estimator.is_test_equals_train_data());
}

#[test]
fn system_solves_for_random_inputs() {
    let settings = [(0.2, 1e-3), (1.0, 0.01), (4.0, 0.5), (30.0, 2.0)];
    for (seed, &(sigma, lambda)) in settings.iter().enumerate() {
        for (d, n) in [(1, 3), (2, 6), (3, 4)] {
            let data = gaussian_points(d, n, seed as u64 + 100);
            let mut estimator = KernelExpFamily::new(data, sigma, lambda, 1.0).unwrap();
            if let Err(e) = estimator.fit() {
                panic!("fit failed for sigma={sigma}, lambda={lambda}, D={d}, N={n}: {e}");
            }
        }
    }
}

#[test]
fn training_only_accessors_refuse_explicit_query_sets() {
    let mut estimator = fitted(2, 6, 1.0, 0.1);
    estimator.set_test_data(gaussian_points(2, 3, 9)).unwrap();

    assert!(matches!(
        estimator.leverage(),
        Err(EstimatorError::State(StateError::TestDataActive))
    ));
    assert!(matches!(
        estimator.matrix(MatrixSelector::System),
        Err(EstimatorError::State(StateError::TestDataActive))
    ));
    for selector in [VectorSelector::AlphaBeta, VectorSelector::System] {
        assert!(matches!(
            estimator.vector(selector),
            Err(EstimatorError::State(StateError::TestDataActive))
        ));
    }

    estimator.reset_test_data();
    assert!(estimator.is_test_equals_train_data());
    assert!(estimator.leverage().is_ok());
    assert!(estimator.matrix(MatrixSelector::System).is_ok());
    assert!(estimator.vector(VectorSelector::System).is_ok());
    assert!(estimator.vector(VectorSelector::AlphaBeta).is_ok());
}

#[test]
fn dimension_mismatch_is_rejected_for_every_pair() {
    for d in 1..=4 {
        let mut estimator =
            KernelExpFamily::new(gaussian_points(d, 3, d as u64), 1.0, 0.1, 1.0).unwrap();
        for rows in 1..=5 {
            if rows == d {
                continue;
            }
            match estimator.set_test_data(Array2::zeros((rows, 2))) {
                Err(EstimatorError::Validation(ValidationError::DimensionMismatch {
                    expected,
                    found,
                })) => assert_eq!((expected, found), (d, rows)),
                other => panic!("D={d}, rows={rows}: expected DimensionMismatch, got {other:?}"),
            }
            assert!(estimator.is_test_equals_train_data());
        }
    }
}

#[test]
fn query_indices_are_bounded_by_the_active_set() {
    let mut estimator = fitted(2, 4, 1.0, 0.1);

    for i in 0..4 {
        assert!(estimator.log_pdf(i).is_ok());
        assert!(estimator.grad(i).is_ok());
        assert!(estimator.hessian(i).is_ok());
    }
    match estimator.log_pdf(4) {
        Err(EstimatorError::Index { index, len }) => assert_eq!((index, len), (4, 4)),
        other => panic!("Expected Index error, got {other:?}"),
    }

    estimator.set_test_data(gaussian_points(2, 2, 5)).unwrap();
    assert!(estimator.hessian(1).is_ok());
    assert!(matches!(
        estimator.grad(2),
        Err(EstimatorError::Index { index: 2, len: 2 })
    ));
    assert!(matches!(
        estimator.hessian(3),
        Err(EstimatorError::Index { index: 3, len: 2 })
    ));
}

#[test]
fn out_of_range_index_is_reported_before_fit_state() {
    let estimator = KernelExpFamily::new(gaussian_points(2, 3, 1), 1.0, 0.1, 1.0).unwrap();
    assert!(matches!(
        estimator.log_pdf(10),
        Err(EstimatorError::Index { index: 10, len: 3 })
    ));
    assert!(matches!(
        estimator.log_pdf(0),
        Err(EstimatorError::State(StateError::NotFitted))
    ));
}

#[test]
fn tiny_memory_ceiling_fails_construction() {
    let data = gaussian_points(3, 200, 11);
    match KernelExpFamily::new(data, 1.0, 0.1, 1e-9) {
        Err(EstimatorError::ResourceLimit(err)) => {
            assert_eq!((err.n, err.d), (200, 3));
            assert!(err.required_gib > 1e-9);
        }
        other => panic!("Expected ResourceLimit, got {other:?}"),
    }
}

#[test]
fn refitting_reproduces_the_coefficients() {
    let mut estimator = fitted(3, 7, 2.0, 0.05);
    let first = estimator.alpha_beta().unwrap().clone();
    estimator.fit().unwrap();
    let second = estimator.alpha_beta().unwrap();
    let max_diff = (&first.0 - &second.0)
        .iter()
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let scale = first.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
    assert!(
        max_diff <= 1e-12 * scale,
        "refit changed coefficients by {max_diff}"
    );
}

#[test]
fn gradient_matches_finite_differences_of_log_pdf() {
    let mut estimator = fitted(2, 8, 1.5, 0.05);
    let x = array![0.2, -0.1];
    let step = 1e-5;

    estimator.set_test_point(x.clone()).unwrap();
    let grad = estimator.grad(0).unwrap();

    for j in 0..2 {
        let mut forward = x.clone();
        forward[j] += step;
        let mut backward = x.clone();
        backward[j] -= step;

        estimator.set_test_point(forward).unwrap();
        let f_plus = estimator.log_pdf(0).unwrap();
        estimator.set_test_point(backward).unwrap();
        let f_minus = estimator.log_pdf(0).unwrap();

        let numeric = (f_plus - f_minus) / (2.0 * step);
        assert_abs_diff_eq!(grad[j], numeric, epsilon = 1e-5 * (1.0 + numeric.abs()));
    }
}

#[test]
fn hessian_matches_finite_differences_of_gradient() {
    let mut estimator = fitted(3, 6, 2.0, 0.1);
    let x = array![-0.3, 0.5, 0.1];
    let step = 1e-5;

    estimator.set_test_point(x.clone()).unwrap();
    let hessian = estimator.hessian(0).unwrap();
    let diag = estimator.hessian_diag(0).unwrap();

    for l in 0..3 {
        assert_eq!(diag[l], hessian[[l, l]]);
        for m in 0..3 {
            let scale = 1.0 + hessian[[l, m]].abs();
            assert_abs_diff_eq!(hessian[[l, m]], hessian[[m, l]], epsilon = 1e-10 * scale);
        }
    }

    for m in 0..3 {
        let mut forward = x.clone();
        forward[m] += step;
        let mut backward = x.clone();
        backward[m] -= step;

        estimator.set_test_point(forward).unwrap();
        let g_plus: Array1<f64> = estimator.grad(0).unwrap();
        estimator.set_test_point(backward).unwrap();
        let g_minus: Array1<f64> = estimator.grad(0).unwrap();

        for l in 0..3 {
            let numeric = (g_plus[l] - g_minus[l]) / (2.0 * step);
            assert_abs_diff_eq!(hessian[[l, m]], numeric, epsilon = 1e-5 * (1.0 + numeric.abs()));
        }
    }
}

#[test]
fn gradient_columns_match_single_point_queries() {
    let estimator = fitted(2, 5, 1.0, 0.01);
    let gradients = estimator.grad_multiple().unwrap();
    assert_eq!(gradients.dim(), (2, 5));
    for j in 0..5 {
        let single = estimator.grad(j).unwrap();
        for i in 0..2 {
            assert_abs_diff_eq!(gradients[[i, j]], single[i], epsilon = 1e-12);
        }
    }
}

#[test]
fn objective_agrees_with_the_assembled_system() {
    let estimator = fitted(2, 7, 1.0, 0.02);
    let terms = SystemTerms::compute(estimator.kernel(), estimator.training_data());
    let closed_form = terms.training_objective(estimator.alpha_beta().unwrap());
    let pointwise = estimator.objective().unwrap();
    assert_abs_diff_eq!(closed_form, pointwise, epsilon = 1e-8 * (1.0 + pointwise.abs()));
}

#[test]
fn leverage_is_bounded_by_the_parameter_count() {
    let estimator = fitted(2, 6, 1.0, 0.1);
    let leverage = estimator.leverage().unwrap();
    assert_eq!(leverage.len(), 6);
    assert!(leverage.iter().all(|v| v.is_finite() && *v >= -1e-12));
    assert!(leverage.sum() < (6 * 2 + 1) as f64);
}

#[test]
fn fits_when_every_pair_underflows() {
    // Unit-spaced points in one dimension.
    let data = array![[0.0, 1.0, 2.0, 3.0, 4.0]];
    for sigma in [1e-6, 1e-80] {
        let mut estimator = KernelExpFamily::new(data.clone(), sigma, 0.01, 1.0).unwrap();
        if let Err(e) = estimator.fit() {
            panic!("fit failed for sigma={sigma}: {e}");
        }
        let alpha_beta = estimator.alpha_beta().unwrap();
        assert!(
            alpha_beta.iter().all(|v| v.is_finite()),
            "sigma={sigma}: coefficients {alpha_beta:?}"
        );
        let log_pdf = estimator.log_pdf_multiple().unwrap();
        assert!(
            log_pdf.iter().all(|v| v.is_finite()),
            "sigma={sigma}: log_pdf {log_pdf}"
        );
    }
}

#[test]
fn numerical_errors_name_the_bandwidth() {
    let err = EstimatorError::Numerical {
        size: 7,
        sigma: 0.25,
        lambda: 0.5,
        source: ndarray_linalg::error::LinalgError::NotSquare { rows: 7, cols: 6 },
    };
    let message = err.to_string();
    assert!(message.contains("sigma = 2.5e-1"), "message was: {message}");
    assert!(message.contains("lambda = 5e-1"), "message was: {message}");
}
