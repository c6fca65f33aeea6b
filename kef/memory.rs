//! # Pre-flight Memory Budget
//!
//! The dense assembly is quadratic in N·D, so a careless problem size can
//! exhaust memory long before the solver gets to run. This module counts the
//! exact number of `f64` elements the fit will hold at its peak and refuses to
//! proceed when that exceeds a caller-supplied ceiling.
//!
//! Counted buffers (ND = N·D):
//!
//! | buffer                        | elements   |
//! |-------------------------------|------------|
//! | system matrix A               | (ND + 1)²  |
//! | system vector b               | ND + 1     |
//! | all-Hessians tensor G         | (ND)²      |
//! | product G·G (transient)       | (ND)²      |
//! | h vector                      | ND         |
//! | kernel Gram matrix            | N²         |
//! | solution vector               | ND + 1     |
//!
//! The Cholesky factorization consumes A and works in place, so it adds no
//! workspace. Leverage computation reuses the same buffers plus one ND + 1
//! vector per worker thread, which is not counted.

use thiserror::Error;

/// Ceiling applied when the caller does not pick one.
pub const DEFAULT_MEMORY_LIMIT_GIB: f64 = 1.0;

const BYTES_PER_ELEMENT: u128 = std::mem::size_of::<f64>() as u128;
const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// The projected footprint of a fit exceeds the configured ceiling.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "The problem's size (N={n}, D={d}) needs at least {required_gib:.6} GiB of memory, which is above the configured limit of {limit_gib:.6} GiB. Increase the limit or reduce the number of points."
)]
pub struct ResourceLimitError {
    pub n: usize,
    pub d: usize,
    pub required_gib: f64,
    pub limit_gib: f64,
}

/// Element counts of every dense buffer a fit of an N-point, D-dimensional
/// training set allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    num_points: usize,
    num_dimensions: usize,
}

impl MemoryBudget {
    pub fn for_problem(num_points: usize, num_dimensions: usize) -> Self {
        Self {
            num_points,
            num_dimensions,
        }
    }

    /// Named element counts, `None` where the count overflows.
    pub fn buffers(&self) -> [(&'static str, Option<u128>); 7] {
        let n = self.num_points as u128;
        let nd = n.checked_mul(self.num_dimensions as u128);
        let nd_plus_one = nd.and_then(|v| v.checked_add(1));
        let square = |v: Option<u128>| v.and_then(|x| x.checked_mul(x));

        [
            ("system matrix A", square(nd_plus_one)),
            ("system vector b", nd_plus_one),
            ("all-Hessians tensor", square(nd)),
            ("all-Hessians product", square(nd)),
            ("h vector", nd),
            ("kernel matrix", square(Some(n))),
            ("solution vector", nd_plus_one),
        ]
    }

    pub fn total_elements(&self) -> Option<u128> {
        self.buffers()
            .iter()
            .try_fold(0u128, |acc, (_, count)| acc.checked_add((*count)?))
    }

    pub fn required_bytes(&self) -> Option<u128> {
        self.total_elements()?.checked_mul(BYTES_PER_ELEMENT)
    }

    /// Peak requirement in GiB; infinite when the element count overflows.
    pub fn required_gib(&self) -> f64 {
        match self.required_bytes() {
            Some(bytes) => bytes as f64 / BYTES_PER_GIB,
            None => f64::INFINITY,
        }
    }

    /// Fails when the projected footprint is above `limit_gib`.
    pub fn enforce(&self, limit_gib: f64) -> Result<(), ResourceLimitError> {
        let required_gib = self.required_gib();
        for (name, count) in self.buffers() {
            match count {
                Some(count) => log::debug!("Memory budget: {name} holds {count} elements"),
                None => log::debug!("Memory budget: {name} overflows the element count"),
            }
        }

        if required_gib > limit_gib {
            return Err(ResourceLimitError {
                n: self.num_points,
                d: self.num_dimensions,
                required_gib,
                limit_gib,
            });
        }

        log::debug!(
            "Problem (N={}, D={}) needs {:.6} GiB of {:.6} GiB allowed",
            self.num_points,
            self.num_dimensions,
            required_gib,
            limit_gib
        );
        Ok(())
    }
}
