//! Portable loop implementations of the aggregation.
//!
//! These paths favour clarity over performance: every sum is an explicit loop
//! accumulated in `f64`. They serve as the baseline for validating the tensor
//! kernels and pin down the index conventions (`c * H + d` flattening, joint
//! mask counts, floor at one).

pub mod naive;

pub use naive::{naive_outer_product_forward, naive_outer_product_mean, naive_pair_counts};
