//! Gold CLI - Command-line interface
//!
//! Usage:
//!   gold init-db
//!   gold ingest <kind> <document-id> <file>
//!   gold reconcile <file.jsonl>
//!   gold verify <id>
//!   gold edit <id> --set role=Chair
//!   gold release <id>
//!   gold show <id>
//!   gold log-stats

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use gold_core::{
    AppConfig, EntityId, EntityKind, ExtractionLogFilter, ExtractionLogRepository,
    ExtractionStatistics, FieldMap, GoldEntityRepository, InMemoryExtractionLog,
    InMemoryGoldStore, LoggingConfig, NewExtractionLog, PgStore,
};
use gold_reconciler::{
    build_extractor, BatchReconciler, BatchReport, ExtractionPipeline, ManualOverride, Reconciler,
    SourceDocument,
};

#[derive(Parser)]
#[command(name = "gold")]
#[command(about = "Bronze to Gold reconciliation for political entities")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables take precedence)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use process-local stores instead of PostgreSQL
    #[arg(long, global = true)]
    in_memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    InitDb,
    /// Extract records from a document, log them and reconcile them
    Ingest {
        /// Entity kind to extract
        kind: EntityKind,
        /// Identifier recorded on each log entry
        document_id: String,
        /// Path to the document text
        file: PathBuf,
    },
    /// Append and reconcile extraction records from a JSON-lines file
    Reconcile {
        /// One extraction record per line
        file: PathBuf,
    },
    /// Lock an entity against automated writes
    Verify { id: EntityId },
    /// Edit entity fields by hand (locks the entity)
    Edit {
        id: EntityId,
        /// Field assignment `name=value`; JSON values are parsed, `null` removes
        #[arg(long = "set", required = true)]
        assignments: Vec<String>,
    },
    /// Return an entity to automated control
    Release { id: EntityId },
    /// Retire an entity
    Retire { id: EntityId },
    /// Reinstate a retired entity
    Reinstate { id: EntityId },
    /// Show an entity
    Show { id: EntityId },
    /// Summarise the extraction log
    LogStats {
        /// Only count one entity kind
        #[arg(long)]
        kind: Option<EntityKind>,
        /// Maximum number of entries to read
        #[arg(long, default_value_t = 10_000)]
        limit: usize,
    },
}

struct Stores {
    log: Arc<dyn ExtractionLogRepository>,
    gold: Arc<dyn GoldEntityRepository>,
    postgres: Option<Arc<PgStore>>,
}

impl Stores {
    async fn open(config: &AppConfig, in_memory: bool) -> anyhow::Result<Self> {
        if in_memory {
            return Ok(Self {
                log: Arc::new(InMemoryExtractionLog::new()),
                gold: Arc::new(InMemoryGoldStore::new()),
                postgres: None,
            });
        }

        let store = Arc::new(
            PgStore::connect(&config.database)
                .await
                .context("connecting to PostgreSQL")?,
        );
        Ok(Self {
            log: store.clone(),
            gold: store.clone(),
            postgres: Some(store),
        })
    }

    fn reconciler(&self) -> Arc<Reconciler> {
        Arc::new(Reconciler::new(self.log.clone(), self.gold.clone()))
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.clone().into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse `name=value` pairs; values that are not valid JSON are taken as text
fn parse_assignments(assignments: &[String]) -> anyhow::Result<FieldMap> {
    let mut fields = FieldMap::new();
    for assignment in assignments {
        let Some((name, raw)) = assignment.split_once('=') else {
            bail!("expected name=value, got {assignment:?}");
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("empty field name in {assignment:?}");
        }
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        fields.insert(name.to_string(), value);
    }
    Ok(fields)
}

/// Extraction records read from a JSON-lines file
struct RecordFile {
    records: Vec<NewExtractionLog>,
    /// 1-based numbers of lines that did not parse
    unreadable_lines: Vec<usize>,
}

/// Parse extraction records, one JSON object per line; blank lines are skipped
fn parse_records(content: &str) -> RecordFile {
    let mut file = RecordFile {
        records: Vec::new(),
        unreadable_lines: Vec::new(),
    };
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<NewExtractionLog>(line) {
            Ok(record) => file.records.push(record),
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "Skipping unreadable record");
                file.unreadable_lines.push(line_no + 1);
            }
        }
    }
    file
}

/// Output of `gold reconcile`
#[derive(Serialize)]
struct ReconcileOutput {
    #[serde(flatten)]
    report: BatchReport,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    unreadable_lines: Vec<usize>,
}

/// Append and reconcile the records of a JSON-lines file; no extractor is involved
async fn reconcile_records(stores: &Stores, config: &AppConfig, content: &str) -> ReconcileOutput {
    let RecordFile {
        records,
        unreadable_lines,
    } = parse_records(content);
    info!(
        records = records.len(),
        unreadable = unreadable_lines.len(),
        "Submitting extraction records"
    );

    let version = &config.extraction.pipeline_version;
    let records = records
        .into_iter()
        .map(|record| record.with_default_pipeline_version(version))
        .collect();
    let batch = BatchReconciler::new(stores.reconciler(), config.reconciler.workers);
    ReconcileOutput {
        report: batch.submit(records).await,
        unreadable_lines,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config.logging);

    let stores = Stores::open(&config, cli.in_memory).await?;
    let manual = || ManualOverride::new(stores.gold.clone(), Default::default());

    match cli.command {
        Commands::InitDb => match &stores.postgres {
            Some(pg) => {
                pg.ensure_schema().await?;
                info!("Schema is up to date");
            }
            None => info!("In-memory stores need no schema"),
        },
        Commands::Ingest {
            kind,
            document_id,
            file,
        } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let pipeline = ExtractionPipeline::new(
                build_extractor(&config.extraction)?,
                BatchReconciler::new(stores.reconciler(), config.reconciler.workers),
                config.extraction.pipeline_version.clone(),
            );
            let report = pipeline
                .ingest(kind, &SourceDocument::new(document_id, text))
                .await?;
            print_json(&report)?;
        }
        Commands::Reconcile { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            print_json(&reconcile_records(&stores, &config, &content).await)?;
        }
        Commands::Verify { id } => print_json(&manual().mark_verified(id).await?)?,
        Commands::Edit { id, assignments } => {
            let edits = parse_assignments(&assignments)?;
            print_json(&manual().apply_manual_edit(id, edits).await?)?;
        }
        Commands::Release { id } => print_json(&manual().release_to_automation(id).await?)?,
        Commands::Retire { id } => print_json(&manual().retire(id).await?)?,
        Commands::Reinstate { id } => print_json(&manual().reinstate(id).await?)?,
        Commands::Show { id } => print_json(&stores.gold.get(id).await?)?,
        Commands::LogStats { kind, limit } => {
            let filter = kind
                .map(ExtractionLogFilter::for_kind)
                .unwrap_or_default()
                .with_limit(limit);
            let entries = stores.log.list(&filter).await?;
            print_json(&ExtractionStatistics::from_entries(&entries))?;
        }
    }

    Ok(())
}
