//! The asset execution engine: ingest prerequisite sub-planner, planner/
//! runner, decision log, and per-tick memoization over a
//! [`segment_registry::AssetRegistry`] and [`segment_store::Repository`].

pub mod cancellation;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod freshness;
pub mod ingest;
pub mod ingest_planner;
pub mod loop_runner;
pub mod outcome;
pub mod planner;

pub use cancellation::CancellationSignal;
pub use config::EngineConfig;
pub use context::RepositoryAssetContext;
pub use engine::AssetEngine;
pub use error::EngineError;
pub use ingest::{IngestClient, IngestOutcome};
pub use loop_runner::{run_engine_loop, EngineLoopOptions};
pub use outcome::{MaterializeOptions, MaterializeOutcome, OutcomeStatus, TickReport};
