//! Organ-coalition emission strategy selector.
//!
//! Four gates run in order, each a pure function over the previous gate's output:
//! intersection -> coherence -> readiness window -> strategy.
//! The coupling matrix is written only by the Hebbian update in `EmissionSelector::select`.

pub mod activation;
pub mod coalition;
pub mod coupling;
pub mod emission;
pub mod strategy;

pub use activation::*;
pub use coalition::*;
pub use coupling::*;
pub use emission::*;
pub use strategy::*;
