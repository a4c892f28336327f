//! HTTP fetching with retry/backoff, HTML stripping, and link harvest.
//!
//! [`HttpFetcher`] is the trait seam the core consumes; [`ReqwestFetcher`]
//! is the production implementation. Retries honor `Retry-After`, back
//! off exponentially with deterministic jitter, retry 429/5xx and
//! network errors, and fail fast on other 4xx.
//!
//! Every fetch path rejects non-HTTP(S) schemes and local-path-like
//! targets before any I/O happens.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::Link;
use crate::urlnorm;

/// A fetched page after transport, before normalization.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

/// A hit from the configured web search provider.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// Web search seam; the concrete provider is configured by the caller.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>>;
}

/// Transport settings shared by the production fetcher.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_initial_secs: f64,
    pub backoff_max_secs: f64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_retries: 5,
            backoff_initial_secs: 1.0,
            backoff_max_secs: 32.0,
        }
    }
}

pub struct ReqwestFetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
}

impl ReqwestFetcher {
    pub fn new(policy: FetchPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(policy.timeout_secs))
            .user_agent("quarry-research/0.3")
            .build()
            .map_err(|e| Error::transport(e.to_string(), false))?;
        Ok(Self { client, policy })
    }

    fn backoff_delay(&self, url: &str, attempt: u32) -> Duration {
        let base = self.policy.backoff_initial_secs * f64::from(1u32 << attempt.min(8));
        let capped = base.min(self.policy.backoff_max_secs);
        // Deterministic jitter in [0, 25%) derived from the target and
        // attempt, so concurrent retries against one host spread out.
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update(attempt.to_le_bytes());
        let digest = hasher.finalize();
        let jitter = f64::from(u16::from_le_bytes([digest[0], digest[1]])) / f64::from(u16::MAX);
        Duration::from_secs_f64(capped * (1.0 + 0.25 * jitter))
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        if urlnorm::is_local_target(url) {
            return Err(Error::guardrail(url, "local filesystem target rejected"));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::guardrail(url, "only http(s) URLs are fetchable"));
        }

        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff_delay(url, attempt - 1)).await;
            }

            let resp = self.client.get(url).send().await;
            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let final_url = response.url().to_string();
                        let content_type = response
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("text/html")
                            .to_string();
                        let body = response
                            .text()
                            .await
                            .map_err(|e| Error::transport(e.to_string(), true))?;
                        return Ok(FetchedPage {
                            url: final_url,
                            status: status.as_u16(),
                            content_type,
                            body,
                        });
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        // Honor Retry-After when the server names a delay.
                        if let Some(secs) = response
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                        {
                            tokio::time::sleep(Duration::from_secs(
                                secs.min(self.policy.backoff_max_secs as u64),
                            ))
                            .await;
                        }
                        last_err = Some(Error::transport(
                            format!("HTTP {} from {}", status, url),
                            true,
                        ));
                        continue;
                    }

                    return Err(Error::transport(
                        format!("HTTP {} from {}", status, url),
                        false,
                    ));
                }
                Err(e) => {
                    last_err = Some(Error::transport(e.to_string(), true));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::transport("fetch failed after retries", true)))
    }
}

// ============ HTML normalization ============

/// Title, main text, and links pulled from an HTML document.
#[derive(Debug, Clone, Default)]
pub struct PageExtract {
    pub title: String,
    pub text: String,
    pub links: Vec<Link>,
}

/// Strip an HTML document to text and harvest anchors.
///
/// A small state machine rather than a DOM: real-world pages are rarely
/// well-formed enough for an XML parser. Script/style contents are
/// skipped, block tags become newlines, entities are decoded, and
/// relative hrefs are resolved against `base_url`.
pub fn extract_page(html: &str, base_url: &str) -> PageExtract {
    let mut out = PageExtract::default();
    let mut text = String::new();

    let mut in_title = false;
    let mut current_href: Option<String> = None;
    let mut current_anchor = String::new();

    let mut i = 0usize;
    while i < html.len() {
        if html.as_bytes()[i] == b'<' {
            let Some(close) = html[i..].find('>') else { break };
            let tag_body = &html[i + 1..i + close];
            let name = tag_name_of(tag_body).to_ascii_lowercase();
            let is_closing = tag_body.trim_start().starts_with('/');
            i += close + 1;

            match name.as_str() {
                "script" | "style" | "noscript" if !is_closing => {
                    // Skip everything up to the matching close tag.
                    let closer = format!("</{}", name);
                    let lower = html[i..].to_ascii_lowercase();
                    match lower.find(&closer) {
                        Some(pos) => {
                            let after = i + pos;
                            i = match html[after..].find('>') {
                                Some(p) => after + p + 1,
                                None => html.len(),
                            };
                        }
                        None => i = html.len(),
                    }
                }
                "title" => in_title = !is_closing,
                "a" => {
                    if is_closing {
                        if let Some(href) = current_href.take() {
                            let anchor = collapse_whitespace(&current_anchor);
                            if !anchor.is_empty() {
                                if let Some(url) = resolve_href(&href, base_url) {
                                    out.links.push(Link {
                                        url,
                                        anchor_text: anchor,
                                    });
                                }
                            }
                        }
                        current_anchor.clear();
                    } else {
                        current_href = attr_value(tag_body, "href");
                        current_anchor.clear();
                    }
                }
                "p" | "div" | "br" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6"
                | "section" | "article" | "blockquote" | "pre" => {
                    if !text.ends_with('\n') {
                        text.push('\n');
                    }
                }
                _ => {}
            }
        } else {
            let run_end = html[i..].find('<').map(|p| i + p).unwrap_or(html.len());
            let decoded = decode_entities(&html[i..run_end]);
            if in_title {
                out.title.push_str(decoded.trim());
            } else {
                if current_href.is_some() {
                    current_anchor.push_str(&decoded);
                }
                text.push_str(&decoded);
            }
            i = run_end;
        }
    }

    out.text = collapse_whitespace(&text);
    out
}

fn tag_name_of(tag_body: &str) -> &str {
    let trimmed = tag_body.trim_start_matches('/');
    trimmed
        .split(|c: char| c.is_whitespace() || c == '/' || c == '>')
        .next()
        .unwrap_or("")
}

/// Pull a quoted attribute value out of a tag body.
fn attr_value(tag_body: &str, name: &str) -> Option<String> {
    let lower = tag_body.to_ascii_lowercase();
    let pos = lower.find(&format!("{}=", name))?;
    let rest = &tag_body[pos + name.len() + 1..];
    let quote = rest.chars().next()?;
    if quote == '"' || quote == '\'' {
        let inner = &rest[1..];
        let end = inner.find(quote)?;
        Some(inner[..end].to_string())
    } else {
        Some(
            rest.split(|c: char| c.is_whitespace() || c == '>')
                .next()?
                .to_string(),
        )
    }
}

fn resolve_href(href: &str, base_url: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(urlnorm::canonicalize(href));
    }
    if href.starts_with("//") {
        return Some(urlnorm::canonicalize(&format!("https:{}", href)));
    }

    let (scheme, rest) = base_url.split_once("://")?;
    let host = rest.split('/').next()?;
    if let Some(stripped) = href.strip_prefix('/') {
        return Some(urlnorm::canonicalize(&format!(
            "{}://{}/{}",
            scheme, host, stripped
        )));
    }
    // Relative path: resolve against the base directory.
    let base_dir = match rest.rsplit_once('/') {
        Some((dir, _)) if dir.len() >= host.len() => dir,
        _ => rest,
    };
    Some(urlnorm::canonicalize(&format!(
        "{}://{}/{}",
        scheme, base_dir, href
    )))
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_lines = 0usize;
    for line in text.lines() {
        let collapsed: Vec<&str> = line.split_whitespace().collect();
        if collapsed.is_empty() {
            blank_lines += 1;
            if blank_lines > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank_lines = 0;
            out.push_str(&collapsed.join(" "));
            out.push('\n');
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"<html><head><title>Test &amp; Title</title>
<style>body { color: red; }</style>
<script>var x = "<div>";</script></head>
<body>
<h1>Heading One</h1>
<p>First paragraph with <a href="/docs/guide">a guide link</a> inside.</p>
<p>Second &quot;paragraph&quot; here.</p>
<a href="https://other.org/page?utm_source=x">External</a>
<a href="#top">Skip me</a>
</body></html>"##;

    #[test]
    fn title_is_extracted() {
        let page = extract_page(PAGE, "https://example.org/docs/index.html");
        assert_eq!(page.title, "Test & Title");
    }

    #[test]
    fn text_drops_script_and_style() {
        let page = extract_page(PAGE, "https://example.org/");
        assert!(page.text.contains("Heading One"));
        assert!(page.text.contains("First paragraph"));
        assert!(page.text.contains("Second \"paragraph\" here."));
        assert!(!page.text.contains("color: red"));
        assert!(!page.text.contains("var x"));
    }

    #[test]
    fn links_resolve_and_canonicalize() {
        let page = extract_page(PAGE, "https://example.org/docs/index.html");
        let urls: Vec<&str> = page.links.iter().map(|l| l.url.as_str()).collect();
        assert!(urls.contains(&"https://example.org/docs/guide"), "{urls:?}");
        assert!(urls.contains(&"https://other.org/page"), "{urls:?}");
        // Fragment-only links are dropped.
        assert_eq!(page.links.len(), 2);
        let guide = page
            .links
            .iter()
            .find(|l| l.url.ends_with("/docs/guide"))
            .unwrap();
        assert_eq!(guide.anchor_text, "a guide link");
    }

    #[test]
    fn attr_value_handles_quote_styles() {
        assert_eq!(
            attr_value(r#"a href="https://x.org""#, "href").as_deref(),
            Some("https://x.org")
        );
        assert_eq!(
            attr_value(r#"a href='/y' class="z""#, "href").as_deref(),
            Some("/y")
        );
        assert_eq!(attr_value("a href=/plain>", "href").as_deref(), Some("/plain"));
        assert_eq!(attr_value("a class=x", "href"), None);
    }

    #[test]
    fn relative_href_resolution() {
        assert_eq!(
            resolve_href("sibling.html", "https://e.org/docs/index.html").as_deref(),
            Some("https://e.org/docs/sibling.html")
        );
        assert_eq!(
            resolve_href("/abs", "https://e.org/docs/index.html").as_deref(),
            Some("https://e.org/abs")
        );
        assert_eq!(resolve_href("javascript:void(0)", "https://e.org"), None);
    }

    #[test]
    fn collapse_whitespace_limits_blank_runs() {
        let text = "a\n\n\n\nb   c\n";
        assert_eq!(collapse_whitespace(text), "a\n\nb c");
    }

    #[tokio::test]
    async fn fetcher_rejects_local_targets_without_io() {
        let fetcher = ReqwestFetcher::new(FetchPolicy::default()).unwrap();
        let err = fetcher.fetch("file:///etc/passwd").await.unwrap_err();
        assert!(matches!(err, Error::Guardrail { .. }));
        let err = fetcher.fetch("/etc/passwd").await.unwrap_err();
        assert!(matches!(err, Error::Guardrail { .. }));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let fetcher = ReqwestFetcher::new(FetchPolicy {
            timeout_secs: 1,
            max_retries: 8,
            backoff_initial_secs: 1.0,
            backoff_max_secs: 8.0,
        })
        .unwrap();
        let d0 = fetcher.backoff_delay("https://e.org", 0);
        let d3 = fetcher.backoff_delay("https://e.org", 3);
        assert!(d0 < d3);
        // Cap plus at most 25% jitter.
        assert!(d3 <= Duration::from_secs_f64(8.0 * 1.25));
    }
}
