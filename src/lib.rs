//! `lattice` — CTC loss and decoding for end-to-end recognition models.
//!
//! This crate provides:
//! - The CTC forward-backward loss with gradients over ragged batches
//! - Greedy (best-path) decoding
//! - Prefix beam search with optional language-model rescoring
//! - Pluggable output encoders for decoded hypotheses
//!
//! Emissions are per-timestep log-probability distributions over a fixed
//! [`alphabet::Alphabet`]; sequences in a batch are independent and run in
//! parallel. The library is designed to be driven by both training loops and
//! inference services, with an emphasis on numerical stability and
//! per-sequence error reporting.

// Loss and decoders (most consumers should start here).
pub mod beam;
pub mod greedy;
pub mod loss;

// Shared vocabulary, path handling, and decode results.
pub mod alphabet;
pub mod collapse;
pub mod hypothesis;

// Language-model scoring interface.
pub mod lm;

// Ragged batch layout, validation, and parallel dispatch.
pub mod batch;

// Output selection and encoder interfaces.
pub mod hypothesis_encoder;
pub mod json_array_encoder;

// Logging configuration and control.
#[cfg(feature = "logging")]
pub mod logging;

pub mod error;

mod math;

pub use error::{Error, Result};
