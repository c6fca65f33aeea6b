use ndarray::{Array1, ArrayView1, s};
use std::ops::Deref;

/// Fitted score-matching coefficients.
///
/// Entry 0 weighs ξ̂, the data term built from kernel Laplacians; entry
/// `1 + a*D + i` weighs ∂ᵢk(x_a, ·) for training point `a` and dimension `i`.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct AlphaBeta(pub Array1<f64>);

impl AlphaBeta {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    /// The weight of ξ̂.
    pub fn alpha(&self) -> f64 {
        self.0[0]
    }

    /// All N·D kernel-derivative weights, point-major.
    pub fn beta(&self) -> ArrayView1<'_, f64> {
        self.0.slice(s![1..])
    }

    /// The D weights belonging to training point `point`.
    pub fn beta_block(&self, point: usize, num_dimensions: usize) -> ArrayView1<'_, f64> {
        let start = 1 + point * num_dimensions;
        self.0.slice(s![start..start + num_dimensions])
    }

}

impl Deref for AlphaBeta {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<AlphaBeta> for Array1<f64> {
    fn from(values: AlphaBeta) -> Self {
        values.0
    }
}
