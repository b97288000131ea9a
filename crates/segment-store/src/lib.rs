//! Persistence layer for the asset execution engine. Exposes a
//! single [`Repository`] trait with an in-memory implementation for tests
//! and a PostgreSQL-backed implementation for production, plus the
//! [`LeaseManager`] used to serialize materialization and ingest work.

pub mod error;
pub mod lease;
pub mod memory;
pub mod model;
pub mod postgres_repository;
pub mod repository;

pub use error::StoreError;
pub use lease::{LeaseGuard, LeaseManager};
pub use memory::InMemoryRepository;
pub use model::{
    AssetInstance, AssetInstanceFanoutRoot, AssetInstanceRoot, AssetMaterialization, AssetParamsRow,
    DecisionLogEntry, EventType, FanoutMode, IngestSyncRunSummary, MaterializationErrorPayload,
    MaterializationStatus, PostCorpusEvent, SegmentEvent, SyncMode, SyncRunStatus,
};
pub use postgres_repository::PostgresRepository;
pub use repository::{MaterializationCompletion, MaterializationTransaction, NewMaterialization, Repository};
