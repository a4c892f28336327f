//! # Quarry
//!
//! **A research retrieval core for CLI AI assistants.**
//!
//! Quarry ingests heterogeneous sources (web pages and local documents),
//! normalizes them into a searchable corpus, and serves evidence to a
//! multi-turn LLM tool-calling loop under determinism and freshness
//! constraints.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────────┐
//! │  Sources    │──▶│   Ingest     │──▶│    SQLite      │
//! │ Web / Local │   │ Cache+Chunk  │   │ FTS5 + Vectors │
//! └────────────┘   │ +Embed+Sect. │   └──────┬────────┘
//!                  └──────────────┘          │
//!            ┌───────────────┬───────────────┤
//!            ▼               ▼               ▼
//!      ┌──────────┐   ┌───────────┐   ┌────────────┐
//!      │ Shortlist │   │  Preload  │   │ HybridIndex │
//!      └────┬─────┘   └─────┬─────┘   └─────┬──────┘
//!           └───────────────┴───────────────┘
//!                           ▼
//!                 ┌──────────────────┐
//!                 │ ConversationEngine│──▶ answer
//!                 │  (tools + compact)│
//!                 └──────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. A turn request enters through [`client::Client::run_turn`].
//! 2. The **preload pipeline** ([`preload`]) ingests any local corpus,
//!    fetches explicit seed URLs under a token budget, and optionally
//!    runs the **shortlist** ([`shortlist`]) to rank candidate sources
//!    before the first model call.
//! 3. Ingestion ([`ingest`]) normalizes pages and documents into the
//!    **cache** ([`cache`]), extracts deterministic **sections**
//!    ([`sections`]), chunks with the token-aware **chunker**
//!    ([`chunker`]), and embeds into the **hybrid index** ([`index`]).
//! 4. The **conversation engine** ([`engine`]) loops over the LLM and
//!    the **tool registry** ([`tools`]) until a final answer, compacting
//!    proactively when the context grows.
//! 5. Sessions, history, findings, and user memories persist through
//!    [`session`] and [`memory`].
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: cache rows, chunks, sections, sessions |
//! | [`urlnorm`] | URL canonicalization, seed extraction, corpus handles |
//! | [`cache`] | TTL content/link cache with forward invalidation |
//! | [`chunker`] | Token-aware sentence chunker with char fallback |
//! | [`sections`] | Deterministic section extraction and aliases |
//! | [`embedding`] | Embedding client trait, HTTP providers, vector utils |
//! | [`vector`] | Vector backend trait and metadata filters |
//! | [`index`] | Hybrid dense+lexical retrieval with diversity filtering |
//! | [`memory`] | Session findings and deduplicated user memories |
//! | [`fetch`] | HTTP fetcher with backoff, HTML strip, link harvest |
//! | [`loader`] | Local document loading (text/HTML/JSON/CSV/PDF/EPUB) |
//! | [`ingest`] | Fetch/load → cache → sections → chunk → embed |
//! | [`shortlist`] | Pre-model candidate collection and ranking |
//! | [`preload`] | Deterministic pre-model context assembly |
//! | [`llm`] | LLM client seam, tool-call parsing, usage accounting |
//! | [`tools`] | Tool registry and the built-in retrieval/memory tools |
//! | [`engine`] | Multi-turn loop, compaction, guardrailed exits |
//! | [`session`] | Persistent sessions, history, sticky locks |
//! | [`client`] | `run_turn` facade wiring the core together |
//! | [`db`], [`migrate`] | SQLite pool and idempotent schema |
//! | [`error`] | Typed error taxonomy |

pub mod cache;
pub mod chunker;
pub mod client;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod loader;
pub mod memory;
pub mod migrate;
pub mod models;
pub mod preload;
pub mod sections;
pub mod session;
pub mod shortlist;
pub mod tools;
pub mod urlnorm;
pub mod vector;

#[cfg(test)]
pub(crate) mod testutil;

pub use client::{Client, Collaborators, TurnRequest, TurnResult};
pub use error::Error;
