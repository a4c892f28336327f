//! Ingestion: fetch/load → normalize → cache → sections → chunk → embed.
//!
//! Shared by the tool executors (on-demand URL materialization) and the
//! preload pipeline (local corpus + seed URLs). Every path ends with the
//! same invariant: the cache row, its sections, and its chunks agree on
//! one content hash and one embedding model.

use std::path::Path;

use crate::cache::Cache;
use crate::chunker::{self, ChunkParams};
use crate::error::{Error, Result};
use crate::fetch::{extract_page, HttpFetcher};
use crate::index::{HybridIndex, NewChunk};
use crate::loader::FileLoader;
use crate::models::CacheEntry;
use crate::sections;
use crate::urlnorm;

/// Fetch a URL (respecting cache freshness) and cache the extracted
/// text and links.
///
/// A fetch error on a URL that already has a cached row returns the
/// stale row rather than evicting it; the caller decides how to label
/// that staleness.
pub async fn fetch_into_cache(
    cache: &Cache,
    fetcher: &dyn HttpFetcher,
    url: &str,
) -> Result<CacheEntry> {
    if urlnorm::is_local_target(url) {
        return Err(Error::guardrail(url, "local filesystem target rejected"));
    }

    let existing = cache.get(url).await?;
    if let Some(entry) = &existing {
        if cache.is_fresh(entry) {
            return Ok(entry.clone());
        }
    }

    match fetcher.fetch(url).await {
        Ok(page) => {
            let extract = extract_page(&page.body, &page.url);
            let entry = cache.put(url, &extract.text, &extract.links, None).await?;
            Ok(entry)
        }
        Err(e) => match existing {
            // Stale-but-present beats an error.
            Some(entry) => Ok(entry),
            None => Err(e),
        },
    }
}

/// Read a local document through the loader and cache it under a
/// `corpus://cache/<id>` handle derived from its path.
pub async fn load_into_cache(
    cache: &Cache,
    loader: &dyn FileLoader,
    path: &Path,
) -> Result<CacheEntry> {
    let doc = loader.load(path).await?;
    let cache_id = urlnorm::cache_id_for(&format!("file://{}", doc.path.display()));
    let handle = urlnorm::corpus_handle(&cache_id);
    let entry = cache.put(&handle, &doc.text, &[], None).await?;
    Ok(entry)
}

/// Make sure a cached row is searchable: heal interrupted invalidation,
/// extract and persist sections, chunk with section assignment, embed,
/// and store. A row already indexed with the current model and content
/// hash is left untouched.
pub async fn ensure_indexed(
    cache: &Cache,
    index: &HybridIndex,
    chunking: &ChunkParams,
    entry: &CacheEntry,
) -> Result<()> {
    let healed = cache.heal_if_stale(entry).await?;
    let model_id = index.embedder().model_id().to_string();
    if !healed && index.has_chunks_for_model(&entry.cache_id, &model_id).await? {
        return Ok(());
    }

    let section_list = sections::extract_sections(&entry.content_text);
    sections::store_sections(index.pool(), &entry.cache_id, &section_list).await?;

    let pieces = chunker::chunk_text(&entry.content_text, chunking);
    let chunks: Vec<NewChunk> = pieces
        .into_iter()
        .map(|piece| {
            let section_id = sections::section_at(&section_list, piece.start_byte)
                .map(|s| s.section_id.clone());
            NewChunk {
                text: piece.text,
                token_count: piece.token_count as i64,
                section_id,
            }
        })
        .collect();

    index
        .store_chunks(&entry.cache_id, &chunks, &entry.content_hash)
        .await?;
    Ok(())
}

/// Fetch + index in one step; the common path for URL-oriented tools.
pub async fn materialize_url(
    cache: &Cache,
    index: &HybridIndex,
    fetcher: &dyn HttpFetcher,
    chunking: &ChunkParams,
    url: &str,
) -> Result<CacheEntry> {
    let entry = fetch_into_cache(cache, fetcher, url).await?;
    ensure_indexed(cache, index, chunking, &entry).await?;
    Ok(entry)
}

/// Load + index a local document; the preload path.
pub async fn materialize_local(
    cache: &Cache,
    index: &HybridIndex,
    loader: &dyn FileLoader,
    chunking: &ChunkParams,
    path: &Path,
) -> Result<CacheEntry> {
    let entry = load_into_cache(cache, loader, path).await?;
    ensure_indexed(cache, index, chunking, &entry).await?;
    Ok(entry)
}
