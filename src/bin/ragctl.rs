use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rustyrag::{
    config,
    logging::{self, LogTarget},
    metadata::DocumentFilter,
    pipeline::{BatchOutcome, DirectoryOptions, NewDocument, QueryRequest, RagPipeline},
};
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "ragctl",
    about = "Ingest documents into and query a Rusty RAG knowledge base"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a file, or every .txt/.md file below a directory.
    Ingest {
        path: PathBuf,
        #[arg(long)]
        category: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        /// Only ingest the top level of a directory.
        #[arg(long)]
        no_recursive: bool,
    },
    /// Answer a question from the knowledge base.
    Query {
        question: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        category: Option<String>,
        /// Print only the answer.
        #[arg(long)]
        no_sources: bool,
    },
    /// Show the passages a question would be answered from.
    Retrieve {
        question: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        category: Option<String>,
    },
    /// List documents, newest first.
    List {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Delete a document and its chunks.
    Delete { document_id: String },
    /// Show recent query logs.
    Queries {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show store and index counters.
    Stats,
    /// Delete every document and vector. Query logs are kept.
    ClearIndex {
        /// Confirm the reset.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config().context("Invalid configuration")?;
    logging::init_tracing(LogTarget::Cli);
    let pipeline = RagPipeline::open(&config)
        .await
        .context("Failed to open RAG pipeline")?;

    match cli.command {
        Command::Ingest {
            path,
            category,
            tags,
            no_recursive,
        } => {
            let outcome = if path.is_dir() {
                let options = DirectoryOptions {
                    recursive: !no_recursive,
                    category,
                    tags,
                    ..DirectoryOptions::default()
                };
                pipeline.ingest_directory(&path, &options).await?
            } else {
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let mut document = NewDocument::new(content)
                    .with_source(path.display().to_string())
                    .with_tags(tags);
                document.category = category;
                pipeline.ingest_batch(vec![document]).await
            };
            report_batch(&outcome);
            pipeline.persist().await?;
            if !outcome.failed.is_empty() && outcome.succeeded.is_empty() {
                bail!("no document was ingested");
            }
        }
        Command::Query {
            question,
            top_k,
            category,
            no_sources,
        } => {
            let request = QueryRequest {
                query: question,
                top_k,
                return_sources: !no_sources,
                category,
            };
            let response = pipeline.query(request).await?;
            println!("{}", response.answer);
            for (position, source) in response.sources.iter().enumerate() {
                println!(
                    "  [{}] {:.3} {} ({})",
                    position + 1,
                    source.score,
                    source.chunk_id,
                    source.category
                );
            }
            pipeline.persist().await?;
        }
        Command::Retrieve {
            question,
            top_k,
            category,
        } => {
            let sources = pipeline.retrieve(&question, top_k, category).await?;
            print_json(&sources)?;
        }
        Command::List {
            category,
            tag,
            limit,
        } => {
            let documents = pipeline
                .list_documents(DocumentFilter {
                    category,
                    tag,
                    limit,
                })
                .await?;
            print_json(&documents)?;
        }
        Command::Delete { document_id } => {
            pipeline.delete(&document_id).await?;
            pipeline.persist().await?;
            println!("deleted {document_id}");
        }
        Command::Queries { limit } => {
            print_json(&pipeline.recent_queries(limit).await?)?;
        }
        Command::Stats => {
            print_json(&pipeline.stats().await)?;
        }
        Command::ClearIndex { yes } => {
            if !yes {
                bail!("refusing to clear the index without --yes");
            }
            let outcome = pipeline.clear_index().await?;
            pipeline.persist().await?;
            print_json(&outcome)?;
        }
    }
    Ok(())
}

fn report_batch(outcome: &BatchOutcome) {
    for ingested in &outcome.succeeded {
        println!(
            "{:?}\t{}\t{} chunks",
            ingested.status, ingested.document_id, ingested.chunk_count
        );
    }
    for failure in &outcome.failed {
        eprintln!(
            "failed\t{}\t{}",
            failure.source.as_deref().unwrap_or("<inline>"),
            failure.error
        );
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
