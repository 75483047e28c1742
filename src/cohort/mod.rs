//! Occasion buffering and cohort aggregation.
//!
//! # PRIVACY INVARIANT
//! A snapshot is only ever built from one whole drain of at least k records.
//! Records carry a digest, an hour bucket, bounded metrics and short tags; nothing else.

pub mod aggregate;
pub mod buffer;
pub mod record;
pub mod snapshot;

pub use aggregate::*;
pub use buffer::*;
pub use record::*;
pub use snapshot::*;
