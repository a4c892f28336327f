//! Deterministic section extraction and canonicalization.
//!
//! Headings are identified by a scoring heuristic over uppercase ratio,
//! length, and line isolation. Identical input bytes always produce
//! identical `section-NNN` ids. Case/punctuation variants and
//! table-of-contents entries collapse onto the canonical section as
//! aliases. Sections below the size threshold, and boilerplate regions
//! like references, are kept addressable but marked non-canonical so
//! summarization refuses them.

use std::collections::HashMap;

use crate::models::Section;

/// Body smaller than this marks a section non-canonical.
pub const TINY_SECTION_BYTES: usize = 200;

/// Headings naming non-body regions are never canonical.
const NON_BODY_TITLES: &[&str] = &[
    "references",
    "bibliography",
    "acknowledgments",
    "acknowledgements",
    "index",
];

/// Extract sections from a document. Deterministic for identical bytes.
pub fn extract_sections(text: &str) -> Vec<Section> {
    let lines = collect_lines(text);
    let candidates = heading_candidates(&lines);

    // Group candidates by folded title: the last occurrence is the real
    // section start, earlier ones (table-of-contents entries) become
    // aliases of it.
    let mut last_by_key: HashMap<String, usize> = HashMap::new();
    for (idx, cand) in candidates.iter().enumerate() {
        last_by_key.insert(fold_title(&cand.title), idx);
    }
    let mut toc_aliases: HashMap<String, Vec<String>> = HashMap::new();
    let mut heads: Vec<&Candidate> = Vec::new();
    for (idx, cand) in candidates.iter().enumerate() {
        let key = fold_title(&cand.title);
        if last_by_key.get(&key) == Some(&idx) {
            heads.push(cand);
        } else {
            toc_aliases.entry(key).or_default().push(cand.title.clone());
        }
    }

    let mut sections = Vec::with_capacity(heads.len());
    for (i, head) in heads.iter().enumerate() {
        let start_byte = head.line_start;
        let end_byte = heads
            .get(i + 1)
            .map(|next| next.line_start)
            .unwrap_or(text.len());
        let body_len = end_byte.saturating_sub(head.line_end);

        let key = fold_title(&head.title);
        let mut aliases = vec![head.title.to_lowercase(), key.clone()];
        if let Some(extra) = toc_aliases.get(&key) {
            aliases.extend(extra.iter().map(|a| a.to_lowercase()));
        }
        aliases.sort();
        aliases.dedup();

        let canonical =
            body_len >= TINY_SECTION_BYTES && !NON_BODY_TITLES.contains(&key.as_str());

        sections.push(Section {
            section_id: format!("section-{:03}", i + 1),
            title: head.title.clone(),
            ordinal: (i + 1) as i64,
            start_byte,
            end_byte,
            canonical,
            aliases,
        });
    }

    sections
}

/// Resolve a user-supplied name (id, title, alias, or variant) against
/// extracted sections.
pub fn resolve<'a>(sections: &'a [Section], name: &str) -> Option<&'a Section> {
    let trimmed = name.trim();
    if let Some(s) = sections.iter().find(|s| s.section_id == trimmed) {
        return Some(s);
    }
    let key = fold_title(trimmed);
    sections
        .iter()
        .find(|s| fold_title(&s.title) == key || s.aliases.iter().any(|a| fold_title(a) == key))
}

/// Find the section containing a byte offset.
pub fn section_at<'a>(sections: &'a [Section], byte: usize) -> Option<&'a Section> {
    sections
        .iter()
        .find(|s| byte >= s.start_byte && byte < s.end_byte)
}

/// Case-fold, strip punctuation and leading numbering.
fn fold_title(title: &str) -> String {
    let lowered = title.to_lowercase();
    let stripped: String = lowered
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    let words: Vec<&str> = stripped
        .split_whitespace()
        .skip_while(|w| w.chars().all(|c| c.is_ascii_digit()))
        .collect();
    words.join(" ")
}

struct Line<'a> {
    text: &'a str,
    start: usize,
    end: usize,
}

fn collect_lines(text: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut start = 0usize;
    for (idx, ch) in text.char_indices() {
        if ch == '\n' {
            lines.push(Line {
                text: &text[start..idx],
                start,
                end: idx,
            });
            start = idx + 1;
        }
    }
    if start < text.len() {
        lines.push(Line {
            text: &text[start..],
            start,
            end: text.len(),
        });
    }
    lines
}

struct Candidate {
    title: String,
    line_start: usize,
    line_end: usize,
}

fn heading_candidates(lines: &[Line<'_>]) -> Vec<Candidate> {
    let mut out = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if is_rejected(trimmed) {
            continue;
        }

        let blank_before = i == 0 || lines[i - 1].text.trim().is_empty();
        let blank_after =
            i + 1 >= lines.len() || lines[i + 1].text.trim().is_empty();

        if heading_score(trimmed, blank_before, blank_after) >= 3 {
            let title = trimmed.trim_start_matches('#').trim().to_string();
            out.push(Candidate {
                title,
                line_start: line.start,
                line_end: line.end,
            });
        }
    }

    out
}

/// Scoring over uppercase ratio, length, and isolation.
fn heading_score(line: &str, blank_before: bool, blank_after: bool) -> i32 {
    let mut score = 0i32;

    if line.starts_with('#') {
        score += 3;
    }
    if starts_with_numbering(line) {
        score += 2;
    }

    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    if !letters.is_empty() {
        let upper = letters.iter().filter(|c| c.is_uppercase()).count();
        let ratio = upper as f64 / letters.len() as f64;
        if ratio >= 0.9 {
            score += 3;
        } else if title_case_ratio(line) >= 0.8 {
            score += 1;
        }
    }

    let word_count = line.split_whitespace().count();
    if word_count > 12 || line.len() > 120 {
        return 0;
    }
    if line.len() <= 60 {
        score += 1;
    }
    if blank_before {
        score += 1;
    }
    if blank_after {
        score += 1;
    }
    // A heading does not end a sentence.
    if line.ends_with('.') || line.ends_with(',') {
        score -= 2;
    }

    score
}

fn starts_with_numbering(line: &str) -> bool {
    let first = match line.split_whitespace().next() {
        Some(w) => w.trim_end_matches('.'),
        None => return false,
    };
    !first.is_empty()
        && first
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.')
}

fn title_case_ratio(line: &str) -> f64 {
    let words: Vec<&str> = line
        .split_whitespace()
        .filter(|w| w.chars().next().is_some_and(|c| c.is_alphabetic()))
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let capitalized = words
        .iter()
        .filter(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
        .count();
    capitalized as f64 / words.len() as f64
}

/// Rejections: citation-like lines, statistical notation, lone non-ASCII
/// tokens.
fn is_rejected(line: &str) -> bool {
    if line.contains(';') {
        return true;
    }
    if line.split_whitespace().count() <= 3 && has_stat_notation(line) {
        return true;
    }
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.len() == 1 && words[0].chars().any(|c| !c.is_ascii()) {
        return true;
    }
    false
}

/// Matches `word(digit` anywhere in the line, e.g. `F(1,38)` or `t(24)`.
fn has_stat_notation(line: &str) -> bool {
    let bytes: Vec<char> = line.chars().collect();
    for i in 0..bytes.len() {
        if bytes[i] == '(' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
            // Walk back over the preceding alphabetic run.
            let mut j = i;
            let mut run = 0usize;
            while j > 0 && bytes[j - 1].is_ascii_alphabetic() {
                j -= 1;
                run += 1;
            }
            let word_boundary = j == 0 || !bytes[j - 1].is_alphanumeric();
            if run > 0 && word_boundary {
                return true;
            }
        }
    }
    false
}

/// Persist extracted sections for a cache row (replace-all).
pub async fn store_sections(
    pool: &sqlx::SqlitePool,
    cache_id: &str,
    sections: &[Section],
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM sections WHERE cache_id = ?")
        .bind(cache_id)
        .execute(&mut *tx)
        .await?;
    for s in sections {
        sqlx::query(
            r#"
            INSERT INTO sections (cache_id, section_id, title, ordinal, start_byte, end_byte, canonical, aliases_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(cache_id)
        .bind(&s.section_id)
        .bind(&s.title)
        .bind(s.ordinal)
        .bind(s.start_byte as i64)
        .bind(s.end_byte as i64)
        .bind(s.canonical)
        .bind(serde_json::to_string(&s.aliases)?)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Load persisted sections for a cache row in ordinal order.
pub async fn load_sections(
    pool: &sqlx::SqlitePool,
    cache_id: &str,
) -> anyhow::Result<Vec<Section>> {
    use sqlx::Row;
    let rows = sqlx::query(
        r#"
        SELECT section_id, title, ordinal, start_byte, end_byte, canonical, aliases_json
        FROM sections WHERE cache_id = ? ORDER BY ordinal
        "#,
    )
    .bind(cache_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let aliases_json: String = row.get("aliases_json");
            Section {
                section_id: row.get("section_id"),
                title: row.get("title"),
                ordinal: row.get("ordinal"),
                start_byte: row.get::<i64, _>("start_byte") as usize,
                end_byte: row.get::<i64, _>("end_byte") as usize,
                canonical: row.get("canonical"),
                aliases: serde_json::from_str(&aliases_json).unwrap_or_default(),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> String {
        let body = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. \
                    Sed do eiusmod tempor incididunt ut labore et dolore magna aliqua. "
            .repeat(4);
        format!(
            "Contents\n\nIntroduction\nMethods\nResults\n\n\
             INTRODUCTION\n\n{body}\n\
             Methods\n\n{body}\n\
             Results\n\n{body}\n\
             References\n\nSmith, J. (2020). A paper; a journal.\n"
        )
    }

    #[test]
    fn extracts_canonical_sections_in_order() {
        let sections = extract_sections(&doc());
        let canonical: Vec<&Section> = sections.iter().filter(|s| s.canonical).collect();
        assert!(canonical.len() >= 3, "got {:?}", sections.len());
        let titles: Vec<&str> = canonical.iter().map(|s| s.title.as_str()).collect();
        assert!(titles.iter().any(|t| t.eq_ignore_ascii_case("introduction")));
        assert!(titles.iter().any(|t| t.eq_ignore_ascii_case("methods")));
        assert!(titles.iter().any(|t| t.eq_ignore_ascii_case("results")));
    }

    #[test]
    fn ids_are_deterministic() {
        let text = doc();
        let a = extract_sections(&text);
        let b = extract_sections(&text);
        let ids_a: Vec<&str> = a.iter().map(|s| s.section_id.as_str()).collect();
        let ids_b: Vec<&str> = b.iter().map(|s| s.section_id.as_str()).collect();
        assert_eq!(ids_a, ids_b);
        assert!(ids_a[0].starts_with("section-00"));
    }

    #[test]
    fn toc_entries_collapse_to_body_heading() {
        let sections = extract_sections(&doc());
        let intro_count = sections
            .iter()
            .filter(|s| fold_title(&s.title) == "introduction")
            .count();
        assert_eq!(intro_count, 1, "TOC line must not create a second section");
    }

    #[test]
    fn references_are_non_canonical() {
        let sections = extract_sections(&doc());
        if let Some(refs) = sections
            .iter()
            .find(|s| fold_title(&s.title) == "references")
        {
            assert!(!refs.canonical);
        }
    }

    #[test]
    fn tiny_sections_are_non_canonical() {
        let text = "FIRST HEADING\n\nShort.\n\nSECOND HEADING\n\n";
        let sections = extract_sections(text);
        for s in &sections {
            assert!(!s.canonical, "{} should be tiny", s.title);
        }
    }

    #[test]
    fn citation_lines_rejected() {
        let text = "Smith, J.; Jones, K.\n\nbody text follows here".to_string();
        let sections = extract_sections(&text);
        assert!(sections.iter().all(|s| !s.title.contains(';')));
    }

    #[test]
    fn stat_notation_rejected() {
        assert!(is_rejected("F(1,38)=4.20"));
        assert!(is_rejected("t(24) p"));
        assert!(!is_rejected("Results and Analysis (2020 Edition)"));
    }

    #[test]
    fn lone_non_ascii_token_rejected() {
        assert!(is_rejected("第一章"));
        assert!(!is_rejected("Chapter One"));
    }

    #[test]
    fn resolve_by_id_title_and_alias() {
        let sections = extract_sections(&doc());
        let intro = sections
            .iter()
            .find(|s| fold_title(&s.title) == "introduction")
            .unwrap();
        assert_eq!(
            resolve(&sections, &intro.section_id).unwrap().section_id,
            intro.section_id
        );
        assert_eq!(
            resolve(&sections, "introduction").unwrap().section_id,
            intro.section_id
        );
        assert_eq!(
            resolve(&sections, "INTRODUCTION").unwrap().section_id,
            intro.section_id
        );
        assert!(resolve(&sections, "nonexistent heading").is_none());
    }

    #[test]
    fn numbered_headings_fold_to_plain_titles() {
        assert_eq!(fold_title("2. Methods"), "methods");
        assert_eq!(fold_title("2.3 Methods"), fold_title("Methods"));
    }

    #[test]
    fn section_at_locates_body_bytes() {
        let text = doc();
        let sections = extract_sections(&text);
        let intro = sections
            .iter()
            .find(|s| fold_title(&s.title) == "introduction")
            .unwrap();
        let mid = (intro.start_byte + intro.end_byte) / 2;
        assert_eq!(
            section_at(&sections, mid).unwrap().section_id,
            intro.section_id
        );
    }
}
