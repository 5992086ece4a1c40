//! Building blocks shared by the pair-representation layers.
//!
//! The crate hosts normalisation and affine projection components assembled
//! from Candle primitives, together with the dtype policy and validation
//! helpers they rely on. Every component acts on the last axis of its input
//! and accepts any number of leading axes, so `(batch, seq, residue, channel)`
//! feature tensors can be fed without manual flattening.

pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod norm;

pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit, LinearLayer};
pub use norm::{LayerNorm, NormConfig, NormalizationLayer};
