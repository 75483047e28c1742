pub mod cohort;
pub mod config;
pub mod engine;
pub mod error;
pub mod privacy;
pub mod selector;
pub mod store;
pub mod telemetry;

// Entry points for embedding the engine.
pub use config::EngineConfig;
pub use engine::{Engine, Occasion};
pub use error::{ConfigError, OccasionError, StoreError};
