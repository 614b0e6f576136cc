use clap::{Parser, Subcommand};
use sift_retriever::{
    FilterPredicate, Metadata, MetadataValue, SiftSettings,
    index::spawn_checkpointer,
    retrieval::{
        ChunkingStrategy, IngestionConfig, IngestionEngine, QueryBuilder, QueryContext,
        QueryTemplates, RetrievalService,
    },
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use tracing::Level;

/// Index documents and query them for retrieval-augmented generation.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (TOML); defaults are used when it does not exist
    #[arg(short, long, global = true, default_value = "sift.toml")]
    config: PathBuf,

    /// Directory holding the collection databases, overrides index.data_dir
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Collection to operate on, overrides index.collection
    #[arg(long, global = true)]
    collection: Option<String>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the collection database if it does not exist
    Init,
    /// Ingest files or directories (directories are walked recursively)
    Ingest {
        /// Files or directories to ingest
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Metadata attached to every document, as key=value
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Retrieve the passages most relevant to a query
    Search {
        /// Query text
        #[arg(required_unless_present = "template")]
        query: Option<String>,
        /// Number of passages to return
        #[arg(short)]
        k: Option<usize>,
        /// Minimum final score a passage must reach
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Metadata filter: field=value, field=a,b, field^=prefix or field:min..max
        #[arg(long = "filter")]
        filters: Vec<String>,
        /// Build the query from a named template
        #[arg(long, conflicts_with = "query")]
        template: Option<String>,
        /// Template variable, as key=value
        #[arg(long = "var", value_parser = parse_key_value)]
        vars: Vec<(String, String)>,
        /// Re-rank candidates even if disabled in the settings
        #[arg(long, conflicts_with = "no_rerank")]
        rerank: bool,
        /// Skip re-ranking even if enabled in the settings
        #[arg(long)]
        no_rerank: bool,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Remove every chunk of a document
    Delete {
        /// Document ID
        document_id: String,
    },
    /// List indexed documents
    Documents {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show index statistics
    Stats {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Persist a checkpoint and truncate the journal
    Checkpoint,
    /// Check the index and the embedding service
    Health {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// List the available query templates
    Templates,
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Full,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "full" => Ok(OutputFormat::Full),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_logging(settings: &SiftSettings, verbose: u8) -> anyhow::Result<()> {
    let level = match verbose {
        0 => Level::from_str(&settings.logging.level)
            .map_err(|_| anyhow::anyhow!("Invalid logging.level: {}", settings.logging.level))?,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = SiftSettings::load(Some(&args.config))?;
    if let Some(data_dir) = args.data_dir {
        settings = settings.with_data_dir(data_dir);
    }
    if let Some(collection) = args.collection {
        settings = settings.with_collection(collection);
    }
    init_logging(&settings, args.verbose)?;

    if let Commands::Templates = args.command {
        let templates = QueryTemplates::new()?;
        for template in templates.list() {
            println!(
                "  {} (k={}): {}",
                template.name, template.k, template.description
            );
            println!("    {}", template.template);
        }
        return Ok(());
    }

    let client = settings.embedding_client()?;
    let index = Arc::new(settings.open_index(&client).await?);

    match args.command {
        Commands::Init => {
            index.checkpoint().await?;
            println!(
                "Initialized collection '{}' ({})",
                settings.index.collection,
                client.model_id()
            );
            println!("Database location: {}", index.location());
            Ok(())
        }
        Commands::Ingest {
            paths,
            metadata,
            format,
        } => {
            let extra: Metadata = metadata
                .into_iter()
                .map(|(key, value)| (key, MetadataValue::parse_loose(&value)))
                .collect();

            let engine = IngestionEngine::new(
                Arc::clone(&index),
                client,
                ChunkingStrategy::new(settings.chunking.chunker_config())?,
                IngestionConfig::default()
                    .with_checkpoint_after_ingest(settings.index.checkpoint_after_ingest),
            )?;
            let checkpointer = settings
                .checkpoint_interval()
                .map(|interval| spawn_checkpointer(Arc::clone(&index), interval));

            let report = engine.ingest_paths(&paths, &extra).await;
            if let Some(handle) = checkpointer {
                handle.shutdown().await;
            }
            let report = report?;

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Summary | OutputFormat::Full => {
                    println!("Ingestion: {}", report.summary());
                    println!("  Chunks indexed: {}", report.chunks_indexed);
                    println!("  Chunks replaced: {}", report.chunks_replaced);
                    println!("  Elapsed: {:.2?}", report.elapsed);
                    for failure in &report.failures {
                        match &failure.chunk_id {
                            Some(chunk_id) => println!("  Failed: {chunk_id}: {}", failure.reason),
                            None => println!("  Failed: {}: {}", failure.document_id, failure.reason),
                        }
                    }
                }
            }
            Ok(())
        }
        Commands::Search {
            query,
            k,
            threshold,
            filters,
            template,
            vars,
            rerank,
            no_rerank,
            format,
        } => {
            let mut context = QueryContext::new(client, settings.query_limits())?;
            if let Some(schema) = settings.schema() {
                context = context.with_schema(schema);
            }
            let force_rerank = match (rerank, no_rerank) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let service = RetrievalService::new(
                Arc::clone(&index),
                context,
                settings.build_rerank_stage(force_rerank)?,
            );

            let mut builder = match template {
                Some(name) => {
                    let vars: HashMap<String, String> = vars.into_iter().collect();
                    QueryBuilder::from_template(&QueryTemplates::new()?, &name, &vars)?
                }
                None => QueryBuilder::new(query.unwrap_or_default()),
            };
            for raw in &filters {
                builder = builder.filter(FilterPredicate::from_str(raw)?);
            }
            if let Some(k) = k {
                builder = builder.k(k);
            }
            if let Some(threshold) = threshold {
                builder = builder.score_threshold(threshold);
            }

            let result = service.search(builder).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
                OutputFormat::Summary => {
                    println!(
                        "Found {} passages for '{}' (generation {}):",
                        result.len(),
                        result.query,
                        result.generation
                    );
                    for passage in &result.passages {
                        println!(
                            "  Score: {:.3} | ID: {} | Document: {} | Chars: {}-{}",
                            passage.score,
                            passage.chunk_id,
                            passage.document_id,
                            passage.start_offset,
                            passage.end_offset
                        );
                    }
                }
                OutputFormat::Full => println!("{}", result.to_context()),
            }
            Ok(())
        }
        Commands::Delete { document_id } => {
            let removed = index.delete_by_document(&document_id).await?;
            index.checkpoint().await?;
            if removed == 0 {
                println!("Document {document_id} not found");
            } else {
                println!("Deleted document {document_id} ({removed} chunks)");
            }
            Ok(())
        }
        Commands::Documents { format } => {
            let documents = index.list_documents();
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&documents)?),
                OutputFormat::Summary | OutputFormat::Full => {
                    println!("Found {} documents:", documents.len());
                    for document in documents {
                        println!(
                            "  {} | Chunks: {} | Source: {} | Indexed: {}",
                            document.document_id,
                            document.chunks,
                            document.source.as_deref().unwrap_or("-"),
                            document.indexed_at.as_deref().unwrap_or("-")
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::Stats { format } => {
            let stats = index.stats().await;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Summary | OutputFormat::Full => {
                    println!("Index Statistics:");
                    println!("  Collection: {}", stats.collection);
                    println!("  Location: {}", stats.location);
                    println!("  Model: {} ({} dimensions)", stats.model_id, stats.dimension);
                    println!("  Generation: {}", stats.generation);
                    println!("  Documents: {}", stats.documents);
                    println!("  Chunks: {}", stats.chunks);
                    println!("  Pending journal operations: {}", stats.pending_ops);
                    match stats.last_checkpoint {
                        Some(at) => println!("  Last checkpoint: {}", at.to_rfc3339()),
                        None => println!("  Last checkpoint: never"),
                    }
                }
            }
            Ok(())
        }
        Commands::Checkpoint => {
            if index.checkpoint().await? {
                println!("Checkpoint written to {}", index.location());
            } else {
                println!("Nothing to checkpoint");
            }
            Ok(())
        }
        Commands::Health { format } => {
            let service = RetrievalService::new(
                Arc::clone(&index),
                QueryContext::new(client, settings.query_limits())?,
                settings.build_rerank_stage(None)?,
            );
            let report = service.health().await;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Summary | OutputFormat::Full => {
                    println!("Health: {}", if report.healthy { "OK" } else { "DEGRADED" });
                    println!("  Index generation: {}", report.index_generation);
                    println!("  Documents: {}", report.documents);
                    println!("  Chunks: {}", report.chunks);
                    println!(
                        "  Embedding: {} ({})",
                        report.embedding_model,
                        report.embedding_error.as_deref().unwrap_or("reachable")
                    );
                    println!("  Reranker: {}", report.reranker.as_deref().unwrap_or("none"));
                }
            }
            if report.healthy {
                Ok(())
            } else {
                Err(anyhow::anyhow!("embedding service is not reachable"))
            }
        }
        Commands::Templates => Ok(()),
    }
}
