//! Engine telemetry.
//!
//! # SAFETY INVARIANT
//! Telemetry is a READ-ONLY side-effect layer.
//! It must **NEVER** be read inside decision logic (selector gates, aggregation, persistence).
//!
//! # PRIVACY INVARIANT
//! Events must **NEVER** contain identifiers, digests, tags or metric values.
//! Only enums and counts are allowed.

pub mod event;
pub mod metrics;
pub mod recorder;

pub use event::*;
pub use metrics::*;
pub use recorder::*;
