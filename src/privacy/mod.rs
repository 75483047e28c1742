//! Anonymization primitives.
//!
//! # PRIVACY INVARIANT
//! Nothing downstream of `Pseudonymizer::hash_identifier` ever sees a raw identifier,
//! and nothing in the crate maps a digest back to its input.

pub mod anonymize;
pub mod noise;

pub use anonymize::*;
pub use noise::*;
