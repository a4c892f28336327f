//! # Quarry
//!
//! A research retrieval core for CLI AI assistants.
//!
//! The `qry` binary wires the library against real collaborators (an
//! OpenAI-compatible chat endpoint, an HTTP/Ollama embedder, a reqwest
//! fetcher) and exposes the core operations: ask, sessions, memory, and
//! cache maintenance.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use quarry::cache::SystemClock;
use quarry::client::{Client, Collaborators, TurnRequest};
use quarry::config::{self, Config};
use quarry::embedding;
use quarry::fetch::{FetchPolicy, ReqwestFetcher};
use quarry::llm::OpenAiChatClient;
use quarry::migrate;
use quarry::preload::ShortlistOverride;

#[derive(Parser)]
#[command(
    name = "qry",
    about = "Quarry — a research retrieval core for CLI AI assistants",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/quarry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and data directory
    Init,

    /// Ask a question through the research engine
    Ask {
        /// The question or task
        query: String,

        /// Enable research mode (session, findings, shortlist)
        #[arg(long)]
        research: bool,

        /// Resume a session by id, name, or unique id prefix
        #[arg(long)]
        session: Option<String>,

        /// Local files or directories to ingest for this turn
        #[arg(long = "corpus")]
        corpus: Vec<PathBuf>,

        /// Shortlist behavior: auto, on, or off
        #[arg(long, default_value = "auto")]
        shortlist: String,

        /// Disable all tools, recall, and auxiliary context for this turn
        #[arg(long)]
        lean: bool,

        /// Model alias to use
        #[arg(long)]
        model: Option<String>,

        /// Tools to disable for this turn
        #[arg(long = "disable-tool")]
        disable_tools: Vec<String>,
    },

    /// Manage sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Manage user memories
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List sessions, most recently used first
    List,
    /// Delete a session and everything scoped to it
    Delete {
        /// Session id, name, or unique id prefix
        selector: String,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Save a user memory (near-duplicates update in place)
    Save {
        text: String,
        /// Comma-separated tags
        #[arg(long)]
        tags: Option<String>,
    },
    /// Recall memories similar to a query
    Recall { query: String },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cache row and freshness counts
    Stats,
    /// Delete rows past their TTL
    Expire,
}

fn load_or_default(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(config::default_at(&PathBuf::from("./data")))
    }
}

async fn build_client(cfg: &Config) -> Result<Client> {
    let llm = Arc::new(OpenAiChatClient::new(
        None,
        cfg.engine.request_timeout_secs,
        cfg.engine.max_retries,
        cfg.engine.backoff_initial_secs,
    ));
    let embedder = embedding::shared(&cfg.embedding)?;
    let fetcher = Arc::new(ReqwestFetcher::new(FetchPolicy {
        timeout_secs: cfg.engine.request_timeout_secs,
        max_retries: cfg.engine.max_retries,
        backoff_initial_secs: cfg.engine.backoff_initial_secs,
        backoff_max_secs: cfg.engine.backoff_max_secs,
    })?);

    let client = Client::new(
        cfg.clone(),
        Collaborators {
            llm,
            embedder,
            fetcher,
            search: None,
            vector_backend: None,
            clock: Arc::new(SystemClock),
        },
    )
    .await?;
    Ok(client)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_or_default(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Data directory initialized at {}", cfg.data.dir.display());
        }
        Commands::Ask {
            query,
            research,
            session,
            corpus,
            shortlist,
            lean,
            model,
            disable_tools,
        } => {
            let client = build_client(&cfg).await?;
            let result = client
                .run_turn(TurnRequest {
                    query,
                    model,
                    session,
                    research,
                    local_corpus_paths: corpus,
                    disabled_tools: disable_tools,
                    shortlist: shortlist.parse::<ShortlistOverride>()?,
                    system_prompt_override: None,
                    lean,
                    verbose: 0,
                    params: None,
                    on_event: None,
                })
                .await?;

            println!("{}", result.answer);
            if let Some(session_id) = result.session_id {
                eprintln!("session: {}", session_id);
            }
            for (url, status) in &result.preload_provenance.entries {
                eprintln!("preloaded: {} [{}]", url, status.label());
            }
        }
        Commands::Sessions { action } => {
            let client = build_client(&cfg).await?;
            match action {
                SessionAction::List => {
                    let sessions = client.sessions().list().await?;
                    if sessions.is_empty() {
                        println!("No sessions.");
                    }
                    for s in sessions {
                        println!(
                            "{}  {}  {}{}",
                            &s.session_id[..8],
                            s.name,
                            if s.research_mode { "research" } else { "standard" },
                            s.research_source_mode
                                .as_deref()
                                .map(|m| format!(" ({})", m))
                                .unwrap_or_default(),
                        );
                    }
                }
                SessionAction::Delete { selector } => {
                    let session = client.sessions().resolve(&selector).await?;
                    client.sessions().delete(&session.session_id).await?;
                    println!("Deleted session {}", session.name);
                }
            }
        }
        Commands::Memory { action } => {
            let client = build_client(&cfg).await?;
            match action {
                MemoryAction::Save { text, tags } => {
                    let tags: Vec<String> = tags
                        .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
                        .unwrap_or_default();
                    let (memory, updated) = client.memory().save_memory(&text, &tags).await?;
                    if updated {
                        println!("Updated existing memory {}", memory.memory_id);
                    } else {
                        println!("Saved memory {}", memory.memory_id);
                    }
                }
                MemoryAction::Recall { query } => {
                    let recalled = client.memory().recall_memories(&query).await?;
                    if recalled.is_empty() {
                        println!("No matching memories.");
                    }
                    for r in recalled {
                        println!("[{:.2}] {}", r.score, r.item.text);
                    }
                }
            }
        }
        Commands::Cache { action } => {
            let client = build_client(&cfg).await?;
            match action {
                CacheAction::Stats => {
                    let stats = client.cache().stats().await?;
                    println!("entries: {}", stats.entries);
                    println!("  fresh: {}", stats.fresh);
                    println!("  expired: {}", stats.expired);
                    println!("chunks: {}", stats.chunks);
                    println!("link vectors: {}", stats.link_vectors);
                }
                CacheAction::Expire => {
                    let now = chrono::Utc::now().timestamp();
                    let removed = client.cache().bulk_expire(now).await?;
                    println!("Expired {} rows.", removed);
                }
            }
        }
    }

    Ok(())
}
