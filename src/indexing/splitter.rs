use std::collections::VecDeque;

/// Separators tried in order, coarsest first
pub const DEFAULT_SEPARATORS: &[&str] = &[
    "\n\n", "\n", "。", "！", "？", ";", ":", ".", "!", "?",
];

/// Chunks shorter than this (in characters, after trimming) are dropped
pub const MIN_CHUNK_LENGTH: usize = 10;

/// Recursive separator splitter.
///
/// Text is cut on the coarsest separator it contains; pieces still longer than
/// `chunk_size` are cut again on the next separator, and as a last resort by
/// characters. Pieces are then merged back up to `chunk_size` characters with
/// `chunk_overlap` characters carried between neighbouring chunks.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_separators(mut self, separators: Vec<String>) -> Self {
        self.separators = separators;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split `text` into trimmed chunks of at most `chunk_size` characters
    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, &self.separators)
            .into_iter()
            .filter(|c| c.chars().count() >= MIN_CHUNK_LENGTH)
            .collect()
    }

    fn split_with(&self, text: &str, separators: &[String]) -> Vec<String> {
        let position = separators
            .iter()
            .position(|sep| !sep.is_empty() && text.contains(sep.as_str()));

        let Some(position) = position else {
            return self.split_chars(text);
        };
        let separator = separators[position].as_str();
        let finer = &separators[position + 1..];

        let mut chunks = Vec::new();
        let mut pending: Vec<&str> = Vec::new();
        for piece in text.split_inclusive(separator) {
            if char_len(piece) <= self.chunk_size {
                pending.push(piece);
                continue;
            }
            if !pending.is_empty() {
                chunks.extend(self.merge(&pending));
                pending.clear();
            }
            chunks.extend(self.split_with(piece, finer));
        }
        if !pending.is_empty() {
            chunks.extend(self.merge(&pending));
        }
        chunks
    }

    fn merge(&self, pieces: &[&str]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0;

        for piece in pieces {
            let len = char_len(piece);
            if total + len > self.chunk_size && !window.is_empty() {
                push_trimmed(&mut chunks, window.iter().copied().collect::<String>());

                while total > self.chunk_overlap || (total + len > self.chunk_size && total > 0) {
                    match window.pop_front() {
                        Some(front) => total -= char_len(front),
                        None => break,
                    }
                }
            }
            window.push_back(piece);
            total += len;
        }

        if !window.is_empty() {
            push_trimmed(&mut chunks, window.iter().copied().collect::<String>());
        }
        chunks
    }

    fn split_chars(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let step = self.chunk_size - self.chunk_overlap;
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let end = (start + self.chunk_size).min(chars.len());
            push_trimmed(&mut chunks, chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start += step;
        }
        chunks
    }
}

fn push_trimmed(chunks: &mut Vec<String>, chunk: String) {
    let trimmed = chunk.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_one_chunk() {
        let splitter = TextSplitter::new(1000, 200);
        let chunks = splitter.split("the quick brown fox");
        assert_eq!(chunks, vec!["the quick brown fox".to_string()]);
    }

    #[test]
    fn test_tiny_fragments_are_dropped() {
        let splitter = TextSplitter::new(1000, 200);
        assert!(splitter.split("short").is_empty());
        assert!(splitter.split("   \n\n  ").is_empty());
    }

    #[test]
    fn test_chunks_respect_size() {
        let splitter = TextSplitter::new(50, 10);
        let text = (0..30)
            .map(|i| format!("Sentence number {} is here.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = splitter.split(&text);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 50, "chunk too long: {:?}", chunk);
        }
    }

    #[test]
    fn test_paragraphs_split_before_sentences() {
        let splitter = TextSplitter::new(40, 0);
        let text = "First paragraph is right here.\n\nSecond paragraph is over here.";
        let chunks = splitter.split(text);
        assert_eq!(
            chunks,
            vec![
                "First paragraph is right here.".to_string(),
                "Second paragraph is over here.".to_string()
            ]
        );
    }

    #[test]
    fn test_overlap_carries_text_forward() {
        let splitter = TextSplitter::new(30, 15);
        let text = "alpha beta.gamma delta.epsilon zeta.eta theta.";
        let chunks = splitter.split(text);
        assert!(chunks.len() >= 2);
        assert!(chunks[1].starts_with("gamma delta"));
    }

    #[test]
    fn test_unbroken_text_falls_back_to_characters() {
        let splitter = TextSplitter::new(20, 5);
        let text = "x".repeat(50);
        let chunks = splitter.split(&text);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 20));
    }

    #[test]
    fn test_multibyte_text() {
        let splitter = TextSplitter::new(20, 0);
        let text = "第一句话在这里。第二句话在那里。第三句话也在这里。";
        let chunks = splitter.split(text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.chars().count() <= 20));
    }
}
