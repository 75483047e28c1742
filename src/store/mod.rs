//! Durable state: current snapshot, snapshot history, family records, coupling matrix.
//! Each lives in its own file, is written atomically and recovers independently.

pub mod atomic;
pub mod matrix;
pub mod snapshots;

pub use atomic::*;
pub use matrix::*;
pub use snapshots::*;
