//! Pre-model source shortlist: collect, score, and diversify candidate
//! sources before the first LLM call.
//!
//! Candidates are the union of explicit seed URLs, optional search
//! provider results, and a one-hop expansion of seed page links. Fetches
//! run in parallel under a worker cap, but the final ranking is
//! deterministic for identical inputs: stable sort by
//! `(score desc, first_seen_index asc)`.
//!
//! Explicit seed URLs always appear in the output, even when ranked
//! below the cutoff.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::cache::Cache;
use crate::config::{QueryExpansionConfig, ShortlistConfig};
use crate::embedding::{cosine_similarity, EmbeddingClient};
use crate::error::Result;
use crate::fetch::{HttpFetcher, SearchProvider};
use crate::ingest;
use crate::models::ShortlistEntry;
use crate::urlnorm;

/// Penalized URL path fragments: utility/auth pages rarely carry
/// evidence.
const UTILITY_PATTERNS: &[&str] = &[
    "login", "signin", "sign-in", "signup", "sign-up", "register", "privacy", "terms", "cookie",
    "account", "cart", "checkout", "subscribe", "unsubscribe",
];

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "of", "in", "on", "for", "to", "with", "about", "is",
    "are", "was", "were", "be", "been", "this", "that", "these", "those", "it", "its", "as", "at",
    "by", "from", "how", "what", "which", "who", "when", "where", "why", "can", "could", "should",
    "would", "do", "does", "did", "please", "me", "my", "our", "your", "their",
];

/// Words above this length trigger keyphrase extraction instead of
/// using every token.
const LONG_QUERY_WORDS: usize = 12;
const MAX_KEYPHRASES: usize = 6;
/// Characters of extracted text embedded per candidate.
const EMBED_TEXT_CHARS: usize = 2000;
/// Extracted text below this length is penalized as short/noisy.
const SHORT_PAGE_CHARS: usize = 400;
/// Selection cap per domain during diversity selection.
const PER_DOMAIN_CAP: usize = 2;

pub struct Shortlist {
    cache: Arc<Cache>,
    embedder: Arc<dyn EmbeddingClient>,
    fetcher: Arc<dyn HttpFetcher>,
    search: Option<Arc<dyn SearchProvider>>,
    config: ShortlistConfig,
    expansion: QueryExpansionConfig,
}

/// Full result of a shortlist run.
#[derive(Debug, Clone)]
pub struct ShortlistOutput {
    pub entries: Vec<ShortlistEntry>,
    /// Compact model-facing context block.
    pub context_block: String,
    /// The prompt with URLs stripped.
    pub query_text: String,
    pub seeds: Vec<String>,
}

struct Candidate {
    url: String,
    first_seen: usize,
    is_seed: bool,
    seed_domain: bool,
}

impl Shortlist {
    pub fn new(
        cache: Arc<Cache>,
        embedder: Arc<dyn EmbeddingClient>,
        fetcher: Arc<dyn HttpFetcher>,
        search: Option<Arc<dyn SearchProvider>>,
        config: ShortlistConfig,
        expansion: QueryExpansionConfig,
    ) -> Self {
        Self {
            cache,
            embedder,
            fetcher,
            search,
            config,
            expansion,
        }
    }

    pub async fn run(&self, prompt: &str) -> Result<ShortlistOutput> {
        let seeds = urlnorm::extract_seed_urls(prompt);
        let query_text = urlnorm::strip_urls(prompt);
        let keyphrases = extract_keyphrases(&query_text);

        let candidates = self
            .collect_candidates(&seeds, &query_text, &keyphrases)
            .await?;
        debug!(count = candidates.len(), "shortlist candidates collected");

        let fetched = self.fetch_candidates(&candidates).await;

        let query_vec = self
            .embedder
            .embed_one(if query_text.is_empty() {
                prompt
            } else {
                query_text.as_str()
            })
            .await
            .map_err(crate::error::Error::Other)?;

        let mut scored: Vec<(ShortlistEntry, usize, bool)> = Vec::new();
        for (candidate, extract) in candidates.iter().zip(fetched.into_iter()) {
            let Some((title, text)) = extract else {
                if candidate.is_seed {
                    // Seeds stay visible even when their fetch failed.
                    scored.push((
                        ShortlistEntry {
                            url: candidate.url.clone(),
                            score: 0.0,
                            title: String::new(),
                            extracted_text: String::new(),
                            reasons: vec!["seed_url".to_string(), "fetch_error".to_string()],
                        },
                        candidate.first_seen,
                        true,
                    ));
                }
                continue;
            };

            let entry = self
                .score_candidate(candidate, &title, &text, &query_vec, &keyphrases)
                .await?;
            scored.push((entry, candidate.first_seen, candidate.is_seed));
        }

        // Deterministic ranking: score desc, first-seen asc.
        scored.sort_by(|a, b| {
            b.0.score
                .partial_cmp(&a.0.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });

        let entries = select_with_domain_diversity(scored, self.config.top_k);
        let context_block = render_context_block(&entries);

        Ok(ShortlistOutput {
            entries,
            context_block,
            query_text,
            seeds,
        })
    }

    async fn collect_candidates(
        &self,
        seeds: &[String],
        query_text: &str,
        keyphrases: &[String],
    ) -> Result<Vec<Candidate>> {
        let seed_domains: HashSet<String> = seeds.iter().filter_map(|u| domain_of(u)).collect();

        let mut seen: HashSet<String> = HashSet::new();
        let mut out: Vec<Candidate> = Vec::new();
        let mut push = |url: String, is_seed: bool, seed_domains: &HashSet<String>| -> usize {
            let canonical = urlnorm::canonicalize(&url);
            if seen.insert(canonical.clone()) {
                let seed_domain = domain_of(&canonical)
                    .map(|d| seed_domains.contains(&d))
                    .unwrap_or(false);
                out.push(Candidate {
                    url: canonical,
                    first_seen: seen.len() - 1,
                    is_seed,
                    seed_domain,
                });
            }
            out.len()
        };

        for seed in seeds {
            push(seed.clone(), true, &seed_domains);
        }

        // Search-provider results, unless seeds alone are requested.
        let run_search = self.search.is_some()
            && !query_text.trim().is_empty()
            && (seeds.is_empty() || self.config.search_with_seed_urls);
        if run_search {
            if let Some(provider) = &self.search {
                for sub_query in self.expanded_queries(query_text, keyphrases) {
                    match provider.search(&sub_query, self.config.max_candidates).await {
                        Ok(hits) => {
                            for hit in hits {
                                push(hit.url, false, &seed_domains);
                            }
                        }
                        Err(e) => debug!(error = %e, "search provider failed, continuing"),
                    }
                }
            }
        }

        // One-hop expansion of seed page links.
        if self.config.seed_link_expansion_enabled {
            for seed in seeds {
                let Ok(entry) =
                    ingest::fetch_into_cache(&self.cache, self.fetcher.as_ref(), seed).await
                else {
                    continue;
                };
                for link in &entry.links {
                    let len = push(link.url.clone(), false, &seed_domains);
                    if len >= self.config.max_candidates {
                        break;
                    }
                }
            }
        }

        out.truncate(self.config.max_candidates);
        Ok(out)
    }

    /// Deterministic sub-queries: the original text plus keyphrase
    /// pairs, capped at `max_sub_queries`. LLM-mode expansion needs a
    /// model the shortlist does not hold, so it degrades to the
    /// deterministic form.
    fn expanded_queries(&self, query_text: &str, keyphrases: &[String]) -> Vec<String> {
        let mut queries = vec![query_text.to_string()];
        if !self.expansion.enabled {
            return queries;
        }
        for pair in keyphrases.windows(2) {
            if queries.len() > self.expansion.max_sub_queries {
                break;
            }
            queries.push(pair.join(" "));
        }
        queries.truncate(self.expansion.max_sub_queries.max(1));
        queries
    }

    /// Fetch candidate main text in parallel under the worker cap.
    /// Order of results matches the candidate order.
    async fn fetch_candidates(&self, candidates: &[Candidate]) -> Vec<Option<(String, String)>> {
        let semaphore = Arc::new(Semaphore::new(self.config.fetch_workers.max(1)));
        let mut handles = Vec::with_capacity(candidates.len());

        for (i, candidate) in candidates.iter().enumerate() {
            if i >= self.config.max_fetch_urls {
                break;
            }
            let sem = Arc::clone(&semaphore);
            let cache = Arc::clone(&self.cache);
            let fetcher = Arc::clone(&self.fetcher);
            let url = candidate.url.clone();

            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire().await.ok()?;
                let entry = ingest::fetch_into_cache(&cache, fetcher.as_ref(), &url)
                    .await
                    .ok()?;
                let title = entry
                    .content_text
                    .lines()
                    .next()
                    .unwrap_or("")
                    .chars()
                    .take(120)
                    .collect::<String>();
                Some((title, entry.content_text))
            }));
        }

        let mut results = Vec::with_capacity(candidates.len());
        for handle in handles {
            results.push(handle.await.ok().flatten());
        }
        results.resize_with(candidates.len(), || None);
        results
    }

    async fn score_candidate(
        &self,
        candidate: &Candidate,
        title: &str,
        text: &str,
        query_vec: &[f32],
        keyphrases: &[String],
    ) -> Result<ShortlistEntry> {
        let mut reasons = Vec::new();
        let embed_text: String = text.chars().take(EMBED_TEXT_CHARS).collect();
        let doc_vec = self
            .embedder
            .embed_one(&embed_text)
            .await
            .map_err(crate::error::Error::Other)?;

        let mut score = f64::from(cosine_similarity(query_vec, &doc_vec));
        reasons.push(format!("semantic={:.3}", score));

        if !keyphrases.is_empty() {
            let lower = text.to_lowercase();
            let hits = keyphrases.iter().filter(|k| lower.contains(*k)).count();
            let bonus = 0.1 * hits as f64 / keyphrases.len() as f64;
            if bonus > 0.0 {
                score += bonus;
                reasons.push(format!("keyphrases={}/{}", hits, keyphrases.len()));
            }
        }

        if candidate.is_seed {
            reasons.push("seed_url".to_string());
        }
        if candidate.seed_domain && !candidate.is_seed {
            score += 0.05;
            reasons.push("same_domain_as_seed".to_string());
        }

        if text.chars().count() < SHORT_PAGE_CHARS {
            score -= 0.2;
            reasons.push("short_page".to_string());
        }
        if is_utility_url(&candidate.url) {
            score -= 0.3;
            reasons.push("utility_pattern".to_string());
        }

        Ok(ShortlistEntry {
            url: candidate.url.clone(),
            score,
            title: title.to_string(),
            extracted_text: embed_text,
            reasons,
        })
    }
}

/// Greedy top-k selection capping picks per domain; explicit seeds are
/// always included.
fn select_with_domain_diversity(
    ranked: Vec<(ShortlistEntry, usize, bool)>,
    top_k: usize,
) -> Vec<ShortlistEntry> {
    let mut per_domain: HashMap<String, usize> = HashMap::new();
    let mut selected: Vec<ShortlistEntry> = Vec::new();
    let mut deferred_seeds: Vec<ShortlistEntry> = Vec::new();

    for (entry, _, is_seed) in ranked {
        if selected.len() >= top_k {
            if is_seed && !selected.iter().any(|e| e.url == entry.url) {
                deferred_seeds.push(entry);
            }
            continue;
        }
        let domain = domain_of(&entry.url).unwrap_or_default();
        let count = per_domain.entry(domain).or_insert(0);
        if *count >= PER_DOMAIN_CAP && !is_seed {
            continue;
        }
        *count += 1;
        selected.push(entry);
    }

    selected.extend(deferred_seeds);
    selected
}

fn render_context_block(entries: &[ShortlistEntry]) -> String {
    let mut out = String::new();
    for (i, entry) in entries.iter().enumerate() {
        out.push_str(&format!(
            "[source {} | score {:.2}] {}\n{}\n{}\n\n",
            i + 1,
            entry.score,
            entry.url,
            entry.title,
            crate::chunker::summarize_extractive(&entry.extracted_text, 150),
        ));
    }
    out.trim_end().to_string()
}

/// Stopword-filtered keyphrases. Long queries keep only the most
/// frequent tokens; short queries keep every content token.
pub fn extract_keyphrases(query_text: &str) -> Vec<String> {
    let tokens: Vec<String> = query_text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect();

    if tokens.len() <= LONG_QUERY_WORDS {
        let mut seen = HashSet::new();
        return tokens
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();
    }

    let mut freq: HashMap<String, (usize, usize)> = HashMap::new();
    for (i, token) in tokens.iter().enumerate() {
        let entry = freq.entry(token.clone()).or_insert((0, i));
        entry.0 += 1;
    }
    let mut ranked: Vec<(String, usize, usize)> = freq
        .into_iter()
        .map(|(t, (count, first))| (t, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.truncate(MAX_KEYPHRASES);
    ranked.into_iter().map(|(t, _, _)| t).collect()
}

fn domain_of(url: &str) -> Option<String> {
    let rest = url.split_once("://")?.1;
    let host = rest.split('/').next()?;
    Some(host.to_string())
}

fn is_utility_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    UTILITY_PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::error::Error;
    use crate::fetch::{FetchedPage, SearchHit};
    use crate::index::HybridIndex;
    use crate::testutil::{self, ManualClock};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MapFetcher(Mutex<HashMap<String, String>>);

    #[async_trait]
    impl HttpFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage> {
            let map = self.0.lock().unwrap();
            match map.get(url) {
                Some(body) => Ok(FetchedPage {
                    url: url.to_string(),
                    status: 200,
                    content_type: "text/html".to_string(),
                    body: body.clone(),
                }),
                None => Err(Error::transport(format!("HTTP 404 from {}", url), false)),
            }
        }
    }

    struct FixedSearch(Vec<SearchHit>);

    #[async_trait]
    impl SearchProvider for FixedSearch {
        async fn search(&self, _query: &str, _k: usize) -> Result<Vec<SearchHit>> {
            Ok(self.0.clone())
        }
    }

    fn page(body: &str) -> String {
        format!("<html><body><p>{}</p></body></html>", body)
    }

    async fn shortlist_with(
        pages: &[(&str, &str)],
        search: Option<Vec<SearchHit>>,
        config: ShortlistConfig,
    ) -> Shortlist {
        let pool = testutil::memory_pool().await;
        let embedder = testutil::fake_embedder();
        let index = Arc::new(HybridIndex::new(
            pool.clone(),
            None,
            Arc::clone(&embedder),
            RetrievalConfig::default(),
        ));
        let cache = Arc::new(Cache::new(
            pool,
            index,
            Arc::new(ManualClock::at(1_000)),
            24,
        ));
        Shortlist::new(
            cache,
            embedder,
            Arc::new(MapFetcher(Mutex::new(
                pages
                    .iter()
                    .map(|(u, b)| (u.to_string(), b.to_string()))
                    .collect(),
            ))),
            search.map(|hits| Arc::new(FixedSearch(hits)) as Arc<dyn SearchProvider>),
            config,
            QueryExpansionConfig::default(),
        )
    }

    #[tokio::test]
    async fn seeds_always_present_in_output() {
        let long_filler = "completely unrelated filler text about cooking pasta recipes. "
            .repeat(20);
        let relevant = "rust async runtime internals explained with executor details. ".repeat(20);
        let shortlist = shortlist_with(
            &[
                ("https://seed.org/offtopic", page(&long_filler).as_str()),
                ("https://hit.org/ontopic", page(&relevant).as_str()),
            ],
            Some(vec![SearchHit {
                url: "https://hit.org/ontopic".to_string(),
                title: "On topic".to_string(),
                snippet: String::new(),
            }]),
            ShortlistConfig {
                top_k: 1,
                ..Default::default()
            },
        )
        .await;

        let output = shortlist
            .run("rust async runtime internals https://seed.org/offtopic")
            .await
            .unwrap();

        assert!(output
            .entries
            .iter()
            .any(|e| e.url == "https://seed.org/offtopic"));
        assert!(output
            .entries
            .iter()
            .any(|e| e.reasons.contains(&"seed_url".to_string())));
    }

    #[tokio::test]
    async fn seed_with_failed_fetch_still_listed() {
        let shortlist = shortlist_with(&[], None, ShortlistConfig::default()).await;
        let output = shortlist
            .run("summarize https://gone.org/page please")
            .await
            .unwrap();
        let seed = output
            .entries
            .iter()
            .find(|e| e.url == "https://gone.org/page")
            .expect("seed must be listed");
        assert!(seed.reasons.contains(&"fetch_error".to_string()));
    }

    #[tokio::test]
    async fn ranking_is_deterministic() {
        let pages: Vec<(String, String)> = (0..6)
            .map(|i| {
                (
                    format!("https://site{}.org/doc", i),
                    page(&format!(
                        "{} database indexing strategies overview number {}",
                        "content ".repeat(80),
                        i
                    )),
                )
            })
            .collect();
        let page_refs: Vec<(&str, &str)> = pages
            .iter()
            .map(|(u, b)| (u.as_str(), b.as_str()))
            .collect();
        let hits: Vec<SearchHit> = pages
            .iter()
            .map(|(u, _)| SearchHit {
                url: u.clone(),
                title: String::new(),
                snippet: String::new(),
            })
            .collect();

        let shortlist =
            shortlist_with(&page_refs, Some(hits.clone()), ShortlistConfig::default()).await;
        let a = shortlist.run("database indexing strategies").await.unwrap();
        let b = shortlist.run("database indexing strategies").await.unwrap();
        let urls_a: Vec<&str> = a.entries.iter().map(|e| e.url.as_str()).collect();
        let urls_b: Vec<&str> = b.entries.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls_a, urls_b);
    }

    #[tokio::test]
    async fn domain_diversity_caps_one_host() {
        let body = format!("{} shared relevant topic content", "filler ".repeat(100));
        let mut pages: Vec<(String, String)> = (0..5)
            .map(|i| (format!("https://same.org/page{}", i), page(&body)))
            .collect();
        pages.push(("https://other.org/page".to_string(), page(&body)));
        let page_refs: Vec<(&str, &str)> = pages
            .iter()
            .map(|(u, b)| (u.as_str(), b.as_str()))
            .collect();
        let hits: Vec<SearchHit> = pages
            .iter()
            .map(|(u, _)| SearchHit {
                url: u.clone(),
                title: String::new(),
                snippet: String::new(),
            })
            .collect();

        let shortlist = shortlist_with(
            &page_refs,
            Some(hits),
            ShortlistConfig {
                top_k: 4,
                ..Default::default()
            },
        )
        .await;
        let output = shortlist.run("shared relevant topic").await.unwrap();

        let same_count = output
            .entries
            .iter()
            .filter(|e| e.url.starts_with("https://same.org"))
            .count();
        assert!(same_count <= PER_DOMAIN_CAP, "got {}", same_count);
        assert!(output
            .entries
            .iter()
            .any(|e| e.url.starts_with("https://other.org")));
    }

    #[tokio::test]
    async fn utility_pages_are_penalized() {
        let body = format!("{} shared relevant topic content", "filler ".repeat(100));
        let shortlist = shortlist_with(
            &[
                ("https://a.org/login", page(&body).as_str()),
                ("https://b.org/article", page(&body).as_str()),
            ],
            Some(vec![
                SearchHit {
                    url: "https://a.org/login".to_string(),
                    title: String::new(),
                    snippet: String::new(),
                },
                SearchHit {
                    url: "https://b.org/article".to_string(),
                    title: String::new(),
                    snippet: String::new(),
                },
            ]),
            ShortlistConfig::default(),
        )
        .await;
        let output = shortlist.run("shared relevant topic").await.unwrap();
        let login_pos = output
            .entries
            .iter()
            .position(|e| e.url.contains("login"))
            .unwrap();
        let article_pos = output
            .entries
            .iter()
            .position(|e| e.url.contains("article"))
            .unwrap();
        assert!(article_pos < login_pos);
    }

    #[test]
    fn keyphrases_short_query_keeps_content_words() {
        let phrases = extract_keyphrases("how does the rust borrow checker work");
        assert!(phrases.contains(&"rust".to_string()));
        assert!(phrases.contains(&"borrow".to_string()));
        assert!(!phrases.contains(&"the".to_string()));
        assert!(!phrases.contains(&"how".to_string()));
    }

    #[test]
    fn keyphrases_long_query_picks_frequent() {
        let query = "compare database database database indexing indexing btree lsm \
                     storage engine engine performance tradeoffs compaction writes reads";
        let phrases = extract_keyphrases(query);
        assert!(phrases.len() <= MAX_KEYPHRASES);
        assert_eq!(phrases[0], "database");
        assert_eq!(phrases[1], "indexing");
    }

    #[test]
    fn context_block_numbers_sources() {
        let entries = vec![ShortlistEntry {
            url: "https://a.org".to_string(),
            score: 0.9,
            title: "Title A".to_string(),
            extracted_text: "Some body sentence.".to_string(),
            reasons: vec![],
        }];
        let block = render_context_block(&entries);
        assert!(block.starts_with("[source 1"));
        assert!(block.contains("https://a.org"));
    }

    #[tokio::test]
    async fn expansion_adds_keyphrase_pair_queries() {
        let mut expansion = QueryExpansionConfig::default();
        expansion.enabled = true;
        expansion.max_sub_queries = 3;
        let shortlist = {
            let pool = testutil::memory_pool().await;
            let embedder = testutil::fake_embedder();
            let index = Arc::new(HybridIndex::new(
                pool.clone(),
                None,
                Arc::clone(&embedder),
                RetrievalConfig::default(),
            ));
            let cache = Arc::new(Cache::new(
                pool,
                index,
                Arc::new(ManualClock::at(1_000)),
                24,
            ));
            Shortlist::new(
                cache,
                embedder,
                Arc::new(MapFetcher(Mutex::new(HashMap::new()))),
                None,
                ShortlistConfig::default(),
                expansion,
            )
        };

        let keyphrases = vec![
            "database".to_string(),
            "indexing".to_string(),
            "btree".to_string(),
        ];
        let queries = shortlist.expanded_queries("database indexing btree", &keyphrases);
        assert_eq!(queries.len(), 3);
        assert_eq!(queries[0], "database indexing btree");
        assert_eq!(queries[1], "database indexing");
        assert_eq!(queries[2], "indexing btree");
    }
}
