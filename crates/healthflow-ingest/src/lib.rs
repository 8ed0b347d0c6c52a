//! HealthFlow Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Fetches a patient's clinical records from a FHIR server, assembles them
//! into one versioned bundle, stores it only when its content is new and
//! notifies downstream consumers.
//!
//! # Components
//!
//! - **Source / Fetcher**: concurrent, per-type lookups with independent timeouts
//! - **Builder**: deterministic FHIR `collection` bundle assembly
//! - **Store**: check-then-insert persistence keyed by content fingerprint
//! - **Publisher**: at-least-once notifications plus best-effort audit events
//! - **Pipeline**: the orchestrator tying the above together
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use healthflow_ingest::{
//!     default_queries, AggregateBuilder, FhirRecordSource, IngestConfig, IngestionNotifier,
//!     IngestionPipeline, InMemoryAggregateStore, InMemoryPublisher, RecordFetcher,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load()?;
//!     let source = Arc::new(FhirRecordSource::new(&config.fhir)?);
//!     let fetcher = RecordFetcher::new(source, default_queries(), config.fhir.timeout());
//!     let notifier = IngestionNotifier::new(
//!         Arc::new(InMemoryPublisher::new()),
//!         &config.broker.raw_topic,
//!         &config.broker.audit_topic,
//!     );
//!     let pipeline = IngestionPipeline::new(
//!         fetcher,
//!         AggregateBuilder::new(&config.pipeline.aggregate_type),
//!         Arc::new(InMemoryAggregateStore::new()),
//!         notifier,
//!     );
//!
//!     let outcome = pipeline.ingest("example", &CancellationToken::new()).await;
//!     println!("{}", outcome.status);
//!     pipeline.flush_audits().await;
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod locks;
pub mod pipeline;
pub mod publisher;
pub mod source;
pub mod store;

pub use builder::{AggregateBuilder, BuiltAggregate};
pub use config::IngestConfig;
pub use error::{IngestError, IngestResult};
pub use fetcher::{FetchOutcome, FetchReport, FetchResult, RecordFetcher};
pub use locks::EntityLocks;
pub use pipeline::{IngestionPipeline, PipelineState};
pub use publisher::{
    EventPublisher, InMemoryPublisher, IngestionNotifier, PublishError, RestProxyPublisher,
};
pub use source::{default_queries, FhirRecordSource, RecordSource, SourceError, SubRecordQuery};
pub use store::{AggregateStore, InMemoryAggregateStore, PgAggregateStore, StoreError};
