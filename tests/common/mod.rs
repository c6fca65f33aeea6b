//! Helpers shared by the integration tests. The library's own fixtures module
//! is compiled only for its unit tests, so these builders live here.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// D×N matrix of standard normal draws, one point per column.
pub fn gaussian_points(num_dimensions: usize, num_points: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((num_dimensions, num_points), |_| {
        rng.sample::<f64, _>(StandardNormal)
    })
}
