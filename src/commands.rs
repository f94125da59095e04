use anyhow::Context;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::Config;
use crate::database::Database;
use crate::email::read_emails;
use crate::embeddings::{ModelInfo, create_embedder};
use crate::index::{IndexError, VectorIndex};
use crate::indexer::{IndexProgress, Indexer, IndexerOptions, IndexingSummary};
use crate::qa::{Answer, AnswerSupport, AnswerSynthesizer, ChatCompletionClient, SynthesisOptions};
use crate::retriever::{RetrievalResult, Retriever};

const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Build or refresh the index from a mailbox export.
#[inline]
pub async fn index_mailbox(config_dir: &Path, mailbox: &Path, rebuild: bool) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;
    let index_path = config.index_path();

    if rebuild {
        remove_index_files(&index_path)?;
        println!("🗑️  Removed existing index at {}", index_path.display());
    }

    let emails = read_emails(mailbox)?;
    println!(
        "📬 Read {} emails from {}",
        style(emails.len()).bold(),
        mailbox.display()
    );

    let embedder = create_embedder(&config.embedding).await?;
    let index = open_index(&index_path, embedder.model().clone())
        .await?
        .with_warn_threshold(config.retrieval.exact_search_warn_threshold);
    let index = Arc::new(index);

    let indexer = Indexer::new(embedder, Arc::clone(&index), IndexerOptions::from(&config));
    let progress = IndexProgress::new();

    let bar = if console::user_attended_stderr() {
        ProgressBar::new(0).with_style(
            ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} {msg}")
                .expect("style template is valid"),
        )
    } else {
        ProgressBar::hidden()
    };

    let ticker = tokio::spawn(track_progress(progress.clone(), bar.clone()));
    let outcome = indexer.index_emails(emails, &progress).await;
    progress.finish();
    if let Err(e) = ticker.await {
        debug!("Progress display task ended abnormally: {}", e);
    }
    bar.finish_and_clear();

    let summary = outcome?;
    drop(indexer);
    close_index(index).await?;

    print_summary(&summary);
    Ok(())
}

/// Answer a question from the indexed emails.
#[inline]
pub async fn ask(config_dir: &Path, question: &str, top_k: Option<usize>) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;
    let options = config.engine_options();
    let top_k = top_k.unwrap_or(options.top_k);

    let embedder = create_embedder(&config.embedding).await?;
    let index = Arc::new(open_index(&config.index_path(), embedder.model().clone()).await?);
    let retriever = Retriever::new(embedder, Arc::clone(&index), options.similarity_floor);
    let retrieval = retriever.retrieve(question, top_k).await?;
    drop(retriever);
    info!("Retrieved {} emails for question", retrieval.len());

    let client = ChatCompletionClient::new(&config.generation)?;
    let synthesizer =
        AnswerSynthesizer::new(Arc::new(client), SynthesisOptions::from(&config.generation));

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = synthesizer
        .answer_with_cancel(question, &retrieval, &cancel)
        .await;
    interrupt.abort();
    close_index(index).await?;

    match result {
        Ok(answer) => {
            print_answer(&answer);
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            println!("\n📴 Question cancelled");
            Ok(())
        }
        Err(e) => {
            eprintln!(
                "{} {}",
                style("❌ Could not generate an answer:").red().bold(),
                e.reason
            );
            Err(e.into())
        }
    }
}

/// Show the emails a question would retrieve, without generating an answer.
#[inline]
pub async fn search(config_dir: &Path, query: &str, top_k: Option<usize>) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;
    let options = config.engine_options();
    let top_k = top_k.unwrap_or(options.top_k);

    let embedder = create_embedder(&config.embedding).await?;
    let index = Arc::new(open_index(&config.index_path(), embedder.model().clone()).await?);
    let retriever = Retriever::new(embedder, Arc::clone(&index), options.similarity_floor);
    let retrieval = retriever.retrieve(query, top_k).await?;
    drop(retriever);
    close_index(index).await?;

    print_retrieval(&retrieval, options.similarity_floor);
    Ok(())
}

/// Print what is stored in the index without contacting any service.
#[inline]
pub async fn show_status(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;
    let options = config.engine_options();
    let index_path = config.index_path();

    println!("{}", style("📊 Inbox RAG Status").bold().cyan());
    println!("  Config:          {}", config.config_file_path().display());
    println!("  Index:           {}", index_path.display());
    println!("  Embedding model: {}", options.model_id);
    println!("  Top K:           {}", options.top_k);
    println!("  Similarity floor: {:.2}", options.similarity_floor);
    println!("  Prompt budget:   {} tokens", options.prompt_token_budget);
    println!(
        "  Retries:         {} (backoff {:?})",
        options.retry_attempts, options.retry_backoff
    );

    if !index_path.exists() {
        println!();
        println!("No index yet. Use 'inbox-rag index <mailbox.json>' to build one.");
        return Ok(());
    }

    let database = Database::new(&index_path)
        .await
        .context("Failed to open index database")?;
    let meta = database.read_meta().await?;
    let entries = database.entry_count().await?;
    database.close().await;

    println!();
    match meta {
        Some(meta) => {
            println!("  Indexed with:    {}", meta.model_id);
            if let Some(version) = &meta.model_version {
                println!("  Model version:   {}", version);
            }
            println!("  Dimension:       {}", meta.dimension);
            println!("  Entries:         {}", style(entries).bold());
            if let Some(created_at) = meta.created_at {
                println!("  Created:         {}", created_at.format("%Y-%m-%d %H:%M:%S"));
            }
            if meta.model_id != options.model_id {
                println!(
                    "  {} configured model differs from the index; run 'inbox-rag index <PATH> --rebuild'",
                    style("⚠️").yellow()
                );
            }
        }
        None => println!("  Index is empty"),
    }

    Ok(())
}

async fn open_index(path: &Path, model: ModelInfo) -> Result<VectorIndex> {
    match VectorIndex::open(path, model).await {
        Ok(index) => {
            if let Some(version) = index.unverified_version() {
                eprintln!(
                    "{} Index was built with model version {}, but the embedder reports none; the version check was skipped",
                    style("⚠️").yellow(),
                    version
                );
            }
            Ok(index)
        }
        Err(e @ IndexError::VersionMismatch { .. }) => {
            eprintln!("{} {}", style("❌").red(), e);
            eprintln!("   Re-run 'inbox-rag index <PATH> --rebuild' to rebuild it with the current model.");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn close_index(index: Arc<VectorIndex>) -> Result<()> {
    match Arc::try_unwrap(index) {
        Ok(index) => index.close().await?,
        Err(shared) => {
            warn!("Index still shared at shutdown, flushing without closing");
            shared.persist().await?;
        }
    }
    Ok(())
}

fn remove_index_files(index_path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut file = index_path.as_os_str().to_owned();
        file.push(suffix);
        let file = Path::new(&file);
        if file.exists() {
            std::fs::remove_file(file)
                .with_context(|| format!("Failed to remove {}", file.display()))?;
        }
    }
    Ok(())
}

async fn track_progress(progress: IndexProgress, bar: ProgressBar) {
    loop {
        let snapshot = progress.snapshot();
        bar.set_length(snapshot.total as u64);
        bar.set_position(snapshot.processed as u64);
        bar.set_message(format!(
            "{} new, {} unchanged, {} skipped",
            snapshot.indexed, snapshot.unchanged, snapshot.skipped
        ));
        if progress.is_finished() {
            break;
        }
        tokio::time::sleep(PROGRESS_POLL_INTERVAL).await;
    }
}

fn print_summary(summary: &IndexingSummary) {
    println!("{}", style("✅ Indexing complete").green().bold());
    println!("  Emails:     {}", summary.total);
    println!("  Indexed:    {}", summary.indexed);
    println!("  Unchanged:  {}", summary.unchanged);
    println!("  Degraded:   {}", summary.degraded);
    println!("  Skipped:    {}", summary.skipped.len());
    for skipped in &summary.skipped {
        println!("    - {}: {}", skipped.id, skipped.reason);
    }
}

fn print_answer(answer: &Answer) {
    println!();
    println!("{}", answer.text);
    println!();

    match answer.support {
        AnswerSupport::NoSupportingEmails => {
            println!("{}", style("ℹ️  No supporting emails found").yellow());
        }
        AnswerSupport::Grounded => {
            println!("{}", style("📎 Sources").bold());
            for (position, citation) in answer.citations.iter().enumerate() {
                let date = citation
                    .timestamp
                    .map_or_else(|| "unknown date".to_string(), |ts| ts.format("%Y-%m-%d").to_string());
                println!(
                    "  {}. {} | {} | {} (score {:.3})",
                    position + 1,
                    citation.subject,
                    citation.sender,
                    date,
                    citation.score
                );
                println!("     {}", style(&citation.excerpt).dim());
            }
        }
    }
}

fn print_retrieval(retrieval: &RetrievalResult, floor: f32) {
    if retrieval.is_empty() {
        println!("No emails scored above the similarity floor of {:.2}.", floor);
        return;
    }

    for (position, hit) in retrieval.hits().iter().enumerate() {
        let date = hit
            .metadata
            .timestamp
            .map_or_else(|| "unknown date".to_string(), |ts| ts.format("%Y-%m-%d").to_string());
        println!(
            "{}. [{:.3}] {} ({})",
            position + 1,
            hit.score,
            style(&hit.metadata.subject).bold(),
            hit.id
        );
        println!("   From: {} | {}", hit.metadata.sender, date);
    }
}
