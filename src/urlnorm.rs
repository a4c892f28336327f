//! URL canonicalization, seed extraction, and corpus handles.
//!
//! Two inputs with identical canonical form share one cache row, so the
//! canonicalizer is the identity layer of the whole cache: lowercase
//! scheme/host, default ports stripped, tracking params dropped, fragment
//! removed, query keys sorted. Canonicalization is idempotent.
//!
//! Local documents and other non-URL sources are addressed by safe
//! handles `corpus://cache/<id>`, optionally scoped to a section with
//! `#section=<section-id>` (legacy `corpus://cache/<id>/<section-id>` is
//! accepted on read).

use sha2::{Digest, Sha256};

/// Query parameters that never change page identity.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "utm_id",
    "fbclid",
    "gclid",
    "msclkid",
    "mc_cid",
    "mc_eid",
    "ref_src",
    "igshid",
];

pub const CORPUS_PREFIX: &str = "corpus://cache/";

/// Canonicalize a URL or bare domain. Bare domains get `https://`.
pub fn canonicalize(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with(CORPUS_PREFIX) {
        return trimmed.to_string();
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let (scheme, rest) = match with_scheme.split_once("://") {
        Some((s, r)) => (s.to_ascii_lowercase(), r),
        None => return with_scheme,
    };

    // Drop the fragment first
    let rest = rest.split('#').next().unwrap_or(rest);

    let (authority_path, query) = match rest.split_once('?') {
        Some((ap, q)) => (ap, Some(q)),
        None => (rest, None),
    };

    let (authority, path) = match authority_path.split_once('/') {
        Some((a, p)) => (a, format!("/{}", p)),
        None => (authority_path, String::new()),
    };

    let host = strip_default_port(&authority.to_ascii_lowercase(), &scheme);
    let path = if path.is_empty() || path == "/" {
        String::new()
    } else if path.len() > 1 && path.ends_with('/') {
        path[..path.len() - 1].to_string()
    } else {
        path
    };

    let query = query.map(normalize_query).filter(|q| !q.is_empty());

    match query {
        Some(q) => format!("{}://{}{}?{}", scheme, host, path, q),
        None => format!("{}://{}{}", scheme, host, path),
    }
}

fn strip_default_port(authority: &str, scheme: &str) -> String {
    let default = match scheme {
        "https" => ":443",
        "http" => ":80",
        _ => return authority.to_string(),
    };
    authority
        .strip_suffix(default)
        .unwrap_or(authority)
        .to_string()
}

fn normalize_query(query: &str) -> String {
    let mut pairs: Vec<&str> = query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .filter(|kv| {
            let key = kv.split('=').next().unwrap_or(kv);
            !TRACKING_PARAMS.contains(&key.to_ascii_lowercase().as_str())
        })
        .collect();
    pairs.sort_by_key(|kv| kv.split('=').next().unwrap_or(kv).to_string());
    pairs.join("&")
}

/// Stable internal id for a canonical source: first 16 hex chars of its
/// SHA-256.
pub fn cache_id_for(canonical_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_url.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

pub fn corpus_handle(cache_id: &str) -> String {
    format!("{}{}", CORPUS_PREFIX, cache_id)
}

pub fn section_ref(cache_id: &str, section_id: &str) -> String {
    format!("{}{}#section={}", CORPUS_PREFIX, cache_id, section_id)
}

/// Parse a corpus handle, returning `(cache_id, section_id?)`.
///
/// Accepts `corpus://cache/<id>`, `corpus://cache/<id>#section=<sid>`,
/// and the legacy path form `corpus://cache/<id>/<sid>`.
pub fn parse_handle(handle: &str) -> Option<(String, Option<String>)> {
    let rest = handle.strip_prefix(CORPUS_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    if let Some((id, frag)) = rest.split_once('#') {
        let section = frag.strip_prefix("section=")?;
        if id.is_empty() || section.is_empty() {
            return None;
        }
        return Some((id.to_string(), Some(section.to_string())));
    }
    if let Some((id, section)) = rest.split_once('/') {
        if id.is_empty() || section.is_empty() {
            return None;
        }
        return Some((id.to_string(), Some(section.to_string())));
    }
    Some((rest.to_string(), None))
}

pub fn is_corpus_handle(input: &str) -> bool {
    input.starts_with(CORPUS_PREFIX)
}

/// True for targets URL tools must refuse: non-HTTP schemes and
/// local-path-like strings.
pub fn is_local_target(input: &str) -> bool {
    let t = input.trim();
    if t.starts_with("file://") {
        return true;
    }
    if let Some((scheme, _)) = t.split_once("://") {
        return !matches!(scheme.to_ascii_lowercase().as_str(), "http" | "https");
    }
    t.starts_with('/') || t.starts_with("~/") || t.starts_with("./") || t.starts_with("..")
}

/// Extract seed URLs from prompt text in first-seen order, deduplicated
/// by canonical form. Accepts `http(s)://…` tokens and bare domains.
pub fn extract_seed_urls(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for token in text.split_whitespace() {
        let token = token.trim_start_matches(|c: char| matches!(c, '(' | '<' | '[' | '"' | '\''));
        let candidate = trim_trailing_punct(token);
        if candidate.is_empty() {
            continue;
        }

        let is_url = candidate.starts_with("http://") || candidate.starts_with("https://");
        let is_bare = !is_url && looks_like_domain(candidate);
        if !is_url && !is_bare {
            continue;
        }

        let canonical = canonicalize(candidate);
        if seen.insert(canonical.clone()) {
            out.push(canonical);
        }
    }

    out
}

fn trim_trailing_punct(token: &str) -> &str {
    token.trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | ')' | ']' | '"' | '\''))
}

/// Bare-domain heuristic: at least one dot, a plausible TLD, no spaces,
/// and nothing that looks like a filename or version number.
fn looks_like_domain(token: &str) -> bool {
    let host = token.split('/').next().unwrap_or(token);
    if !host.contains('.') || host.starts_with('.') || host.ends_with('.') {
        return false;
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    let tld = labels.last().unwrap();
    if tld.len() < 2 || !tld.chars().all(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    labels[..labels.len() - 1].iter().all(|l| {
        !l.is_empty()
            && l.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

/// Remove every extracted URL token from the text, leaving the query.
pub fn strip_urls(text: &str) -> String {
    text.split_whitespace()
        .filter(|token| {
            let t = trim_trailing_punct(token);
            !(t.starts_with("http://") || t.starts_with("https://") || looks_like_domain(t))
        })
        .collect::<Vec<_>>()
        .join(" ")
}
