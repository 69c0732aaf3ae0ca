//! Lexical scoring and highlight helpers shared by the search strategies.

use std::collections::HashSet;

/// Words ignored when extracting keywords
pub const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
    "are", "was", "were", "be", "been", "being", "have", "has", "had", "do", "does", "did", "will",
    "would", "could", "should", "may", "might", "must", "can", "shall", "this", "that", "these",
    "those", "i", "you", "he", "she", "it", "we", "they",
];

/// Default highlight length in characters
pub const HIGHLIGHT_LENGTH: usize = 200;

/// Characters of trimmed content compared when deduplicating results
pub const DEDUP_PREFIX: usize = 200;

const ELLIPSIS: &str = "...";

/// Lowercase, collapse whitespace and blank out punctuation other than `-` and `_`
pub fn preprocess_query(text: &str) -> String {
    let collapsed = text
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    collapsed
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || c == '_' || c == '-' {
                c
            } else {
                ' '
            }
        })
        .collect()
}

/// Query words longer than two characters that are not stop words
pub fn extract_keywords(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Occurrence score normalized by content length and keyword count, clamped to 1
pub fn keyword_score(content: &str, keywords: &[String]) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }
    let word_count = content.split_whitespace().count();
    if word_count == 0 {
        return 0.0;
    }

    let lowered = content.to_lowercase();
    let mut total = 0.0f32;
    for keyword in keywords {
        let occurrences = lowered.matches(keyword.as_str()).count();
        total += occurrences as f32;
        if occurrences > 0 {
            total += 0.5;
        }
    }

    let normalized = total / (word_count * keywords.len()) as f32;
    (normalized * 10.0).min(1.0)
}

/// Weighted mix of character sequence similarity and word set overlap
pub fn fuzzy_score(content: &str, query: &str) -> f32 {
    let query = query.to_lowercase();
    let content = content.to_lowercase();

    let q: Vec<char> = query.chars().collect();
    let c: Vec<char> = content.chars().collect();
    let similarity = sequence_ratio(&q, &c);

    let query_words: HashSet<&str> = query.split_whitespace().collect();
    let content_words: HashSet<&str> = content.split_whitespace().collect();
    if query_words.is_empty() || content_words.is_empty() {
        return similarity;
    }

    let overlap = query_words.intersection(&content_words).count();
    let union = query_words.union(&content_words).count();
    let word_similarity = overlap as f32 / union as f32;

    similarity * 0.3 + word_similarity * 0.7
}

/// Ratcliff/Obershelp similarity: twice the matched characters over the total length
pub fn sequence_ratio(a: &[char], b: &[char]) -> f32 {
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    let mut matched = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];
    while let Some((a_lo, a_hi, b_lo, b_hi)) = pending.pop() {
        let (i, j, size) = longest_match(a, b, a_lo, a_hi, b_lo, b_hi);
        if size == 0 {
            continue;
        }
        matched += size;
        if a_lo < i && b_lo < j {
            pending.push((a_lo, i, b_lo, j));
        }
        if i + size < a_hi && j + size < b_hi {
            pending.push((i + size, a_hi, j + size, b_hi));
        }
    }

    2.0 * matched as f32 / total as f32
}

/// Longest common run in `a[a_lo..a_hi]` and `b[b_lo..b_hi]`, earliest on ties
fn longest_match(
    a: &[char],
    b: &[char],
    a_lo: usize,
    a_hi: usize,
    b_lo: usize,
    b_hi: usize,
) -> (usize, usize, usize) {
    let width = b_hi - b_lo;
    let mut best = (a_lo, b_lo, 0);
    let mut previous = vec![0usize; width + 1];
    let mut current = vec![0usize; width + 1];

    for i in a_lo..a_hi {
        for j in b_lo..b_hi {
            let col = j - b_lo + 1;
            if a[i] == b[j] {
                current[col] = previous[col - 1] + 1;
                if current[col] > best.2 {
                    best = (i + 1 - current[col], j + 1 - current[col], current[col]);
                }
            } else {
                current[col] = 0;
            }
        }
        std::mem::swap(&mut previous, &mut current);
    }
    best
}

/// Key used to drop results whose leading text is identical
pub fn dedup_key(content: &str) -> String {
    content.trim().chars().take(DEDUP_PREFIX).collect()
}

/// First `max_len` characters, ellipsized when the content is longer
pub fn head(content: &str, max_len: usize) -> String {
    let mut out: String = content.chars().take(max_len).collect();
    if content.chars().count() > max_len {
        out.push_str(ELLIPSIS);
    }
    out
}

/// Window around the first case-insensitive occurrence of `needle`, or the head
/// of the content when it does not occur.
pub fn highlight(content: &str, needle: &str, max_len: usize) -> String {
    let chars: Vec<char> = content.chars().collect();
    let needle_len = needle.chars().count();
    match find_case_insensitive(&chars, needle) {
        Some(pos) if needle_len > 0 => {
            let start = pos.saturating_sub(max_len / 4);
            let end = (pos + needle_len + max_len / 2).min(chars.len());
            window(&chars, start, end)
        }
        _ => head(content, max_len),
    }
}

/// Window starting shortly before the earliest keyword occurrence
pub fn keyword_highlight(content: &str, keywords: &[String], max_len: usize) -> String {
    let chars: Vec<char> = content.chars().collect();
    let earliest = keywords
        .iter()
        .filter_map(|k| find_case_insensitive(&chars, k))
        .min();

    match earliest {
        Some(pos) => {
            let start = pos.saturating_sub(max_len / 4);
            let end = (pos + max_len).min(chars.len());
            window(&chars, start, end)
        }
        None => head(content, max_len),
    }
}

/// Prefer the longer of two highlights
pub fn merge_highlights(first: String, second: String) -> String {
    if first.is_empty() {
        return second;
    }
    if second.chars().count() > first.chars().count() {
        second
    } else {
        first
    }
}

fn window(chars: &[char], start: usize, end: usize) -> String {
    let mut out = String::new();
    if start > 0 {
        out.push_str(ELLIPSIS);
    }
    out.extend(&chars[start..end]);
    if end < chars.len() {
        out.push_str(ELLIPSIS);
    }
    out
}

/// Character index in `haystack` where `needle` first occurs, ignoring case
fn find_case_insensitive(haystack: &[char], needle: &str) -> Option<usize> {
    let needle: Vec<char> = needle.chars().flat_map(char::to_lowercase).collect();
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }

    let lowered: Vec<char> = haystack.iter().map(|c| fold(*c)).collect();
    lowered
        .windows(needle.len())
        .position(|w| w == needle.as_slice())
}

/// Single-character lowercase, keeping the index aligned with the original text
fn fold(c: char) -> char {
    let mut lower = c.to_lowercase();
    match (lower.next(), lower.next()) {
        (Some(l), None) => l,
        _ => c,
    }
}
