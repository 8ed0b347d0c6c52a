//! HealthFlow Ingest - FHIR patient ingestion tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use healthflow_common::logging::{init_logging, ConsoleStream, LogConfig, LogLevel};
use healthflow_common::IngestionStatus;
use healthflow_ingest::store::postgres;
use healthflow_ingest::{
    default_queries, AggregateBuilder, AggregateStore, FhirRecordSource, IngestConfig,
    IngestionNotifier, IngestionPipeline, PgAggregateStore, RecordFetcher, RecordSource,
    RestProxyPublisher,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "healthflow-ingest")]
#[command(author, version, about = "FHIR patient ingestion and deduplication")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest one patient
    Sync {
        /// FHIR patient id
        patient_id: String,
    },

    /// Ingest several patients, one after the other
    SyncBatch {
        /// FHIR patient ids
        #[arg(required = true)]
        patient_ids: Vec<String>,
    },

    /// Show the most recent stored bundle for a patient
    Latest {
        patient_id: String,
    },

    /// List every stored bundle for a patient, newest first
    History {
        patient_id: String,
    },

    /// List every stored bundle of one type, newest first
    Bundles {
        #[arg(long, default_value = "Patient")]
        bundle_type: String,
    },

    /// Check connectivity to the FHIR server and the database
    Status,

    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag. Logs go to stderr
    // so stdout carries only the JSON result.
    let log_config = LogConfig::builder()
        .level(log_level)
        .console_stream(ConsoleStream::Stderr)
        .log_file_prefix("healthflow-ingest")
        .build()
        .merge_env()?;

    init_logging(&log_config)?;

    let config = IngestConfig::load().context("Failed to load configuration")?;

    match cli.command {
        Command::Sync { patient_id } => {
            let pipeline = build_pipeline(&config).await?;
            let cancel = cancel_on_ctrl_c();

            let outcome = pipeline.ingest(&patient_id, &cancel).await;
            print_json(&outcome)?;
            pipeline.flush_audits().await;

            if outcome.status == IngestionStatus::Failed {
                anyhow::bail!(
                    "Ingestion failed for {}: {}",
                    patient_id,
                    outcome.error.unwrap_or_default()
                );
            }
        },
        Command::SyncBatch { patient_ids } => {
            let pipeline = build_pipeline(&config).await?;
            let cancel = cancel_on_ctrl_c();

            let report = pipeline.ingest_batch(&patient_ids, &cancel).await?;
            print_json(&report)?;
            pipeline.flush_audits().await;
        },
        Command::Latest { patient_id } => {
            let store = connect_store(&config).await?;
            match store.find_latest_by_entity_key(&patient_id).await? {
                Some(aggregate) => print_json(&aggregate)?,
                None => anyhow::bail!("No stored bundle for patient {}", patient_id),
            }
        },
        Command::History { patient_id } => {
            let store = connect_store(&config).await?;
            let history = store.list_by_entity_key(&patient_id).await?;
            info!(patient_id = %patient_id, count = history.len(), "Loaded bundle history");
            print_json(&history)?;
        },
        Command::Bundles { bundle_type } => {
            let store = connect_store(&config).await?;
            let bundles = store.list_by_aggregate_type(&bundle_type).await?;
            info!(bundle_type = %bundle_type, count = bundles.len(), "Loaded bundles");
            print_json(&bundles)?;
        },
        Command::Status => {
            let source = FhirRecordSource::new(&config.fhir)?;
            let fhir = source.status().await;

            let database = match connect_store(&config).await {
                Ok(store) => match sqlx::query("SELECT 1").execute(store.pool()).await {
                    Ok(_) => "Connected".to_string(),
                    Err(e) => format!("Error: {}", e),
                },
                Err(e) => format!("Error: {:#}", e),
            };

            print_json(&serde_json::json!({
                "fhirServer": config.fhir.base_url,
                "fhir": fhir,
                "database": database,
            }))?;
        },
        Command::Migrate => {
            let store = connect_store(&config).await?;
            store.migrate().await.context("Failed to run migrations")?;
        },
    }

    Ok(())
}

async fn connect_store(config: &IngestConfig) -> Result<PgAggregateStore> {
    let pool = postgres::connect(&config.database)
        .await
        .context("Failed to connect to database")?;
    Ok(PgAggregateStore::new(pool))
}

async fn build_pipeline(config: &IngestConfig) -> Result<IngestionPipeline> {
    let source = Arc::new(FhirRecordSource::new(&config.fhir)?);
    let fetcher = RecordFetcher::new(source, default_queries(), config.fhir.timeout());

    let store = connect_store(config).await?;
    store.migrate().await.context("Failed to run migrations")?;

    let publisher = Arc::new(RestProxyPublisher::new(&config.broker)?);
    let notifier = IngestionNotifier::new(
        publisher,
        &config.broker.raw_topic,
        &config.broker.audit_topic,
    );

    info!(
        fhir = %config.fhir.base_url,
        broker = %config.broker.rest_url,
        "Ingestion pipeline ready"
    );

    Ok(IngestionPipeline::new(
        fetcher,
        AggregateBuilder::new(&config.pipeline.aggregate_type),
        Arc::new(store),
        notifier,
    )
    .with_serialize_per_entity(config.pipeline.serialize_per_entity)
    .with_audit(config.pipeline.audit_enabled))
}

/// Cancel the returned token on the first Ctrl+C
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received Ctrl+C, cancelling ingestion");
                trigger.cancel();
            },
            Err(e) => tracing::error!("Failed to install Ctrl+C handler: {}", e),
        }
    });

    token
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
