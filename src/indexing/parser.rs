use crate::core::config::IndexingSettings;
use crate::core::error::{Error, Result};
use crate::indexing::splitter::TextSplitter;
use crate::storage::cache::Metadata;
use pulldown_cmark::{Event, Parser as MarkdownParser, Tag, TagEnd};
use serde_json::Value;
use std::path::Path;

/// Extensions read as Markdown
const MARKDOWN_EXTENSIONS: &[&str] = &["md", "markdown"];

/// Extensions read as plain text or source code
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "text", "log", "csv", "json", "xml", "html", "htm", "css", "yaml", "yml", "toml",
    "py", "js", "ts", "java", "c", "cpp", "h", "hpp", "rs", "go", "sh",
];

/// A chunk of extracted text, the unit of embedding and retrieval
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub content: String,
    /// Position of the chunk within its document
    pub chunk_id: String,
    pub source: String,
    pub metadata: Metadata,
}

/// Extracts chunks from a file.
///
/// Files of a type the parser does not handle yield `Ok(vec![])`.
pub trait Parser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<Vec<TextChunk>>;
}

/// Metadata extracted from frontmatter
#[derive(Debug, Clone, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub custom: std::collections::BTreeMap<String, String>,
}

/// A run of Markdown text under one heading path
#[derive(Debug, Clone)]
struct Section {
    text: String,
    context: String,
    start_line: usize,
    end_line: usize,
}

/// Built-in parser for Markdown, plain text and source files
#[derive(Debug, Clone)]
pub struct DocumentParser {
    splitter: TextSplitter,
}

impl DocumentParser {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            splitter: TextSplitter::new(chunk_size, chunk_overlap),
        }
    }

    pub fn from_settings(settings: &IndexingSettings) -> Self {
        Self::new(settings.chunk_size, settings.chunk_overlap)
    }

    fn parse_markdown(&self, content: &str, path: &Path) -> Vec<TextChunk> {
        let (frontmatter, body, body_line) = extract_frontmatter(content);
        let doc_meta = parse_frontmatter(frontmatter);
        let (heading_title, sections) = parse_structure(body, body_line);

        let title = doc_meta
            .title
            .clone()
            .or(heading_title)
            .unwrap_or_else(|| file_stem(path));
        let tags: Vec<Value> = doc_meta.tags.iter().cloned().map(Value::String).collect();

        let mut chunks = Vec::new();
        for section in sections {
            for piece in self.splitter.split(&section.text) {
                let mut metadata = base_metadata(path, "markdown");
                metadata.insert("title".to_string(), Value::String(title.clone()));
                metadata.insert("section".to_string(), Value::String(section.context.clone()));
                metadata.insert("start_line".to_string(), Value::from(section.start_line));
                metadata.insert("end_line".to_string(), Value::from(section.end_line));
                metadata.insert("tags".to_string(), Value::Array(tags.clone()));
                for (key, value) in &doc_meta.custom {
                    metadata
                        .entry(key.clone())
                        .or_insert_with(|| Value::String(value.clone()));
                }

                chunks.push(TextChunk {
                    content: piece,
                    chunk_id: chunks.len().to_string(),
                    source: path_string(path),
                    metadata,
                });
            }
        }
        chunks
    }

    fn parse_text(&self, content: &str, path: &Path, file_type: &str) -> Vec<TextChunk> {
        self.splitter
            .split(content)
            .into_iter()
            .enumerate()
            .map(|(i, piece)| TextChunk {
                content: piece,
                chunk_id: i.to_string(),
                source: path_string(path),
                metadata: base_metadata(path, file_type),
            })
            .collect()
    }
}

impl Default for DocumentParser {
    fn default() -> Self {
        Self::from_settings(&IndexingSettings::default())
    }
}

impl Parser for DocumentParser {
    fn parse(&self, path: &Path) -> Result<Vec<TextChunk>> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        let is_markdown = MARKDOWN_EXTENSIONS.contains(&ext.as_str());
        if !is_markdown && !TEXT_EXTENSIONS.contains(&ext.as_str()) {
            return Ok(Vec::new());
        }

        let bytes = std::fs::read(path)?;
        let content = String::from_utf8(bytes).map_err(|_| {
            Error::Parsing(format!("{} is not valid UTF-8 text", path.display()))
        })?;

        if is_markdown {
            Ok(self.parse_markdown(&content, path))
        } else {
            Ok(self.parse_text(&content, path, &ext))
        }
    }
}

fn base_metadata(path: &Path, file_type: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("file_type".to_string(), Value::String(file_type.to_string()));
    metadata.insert(
        "file_name".to_string(),
        Value::String(
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string(),
        ),
    );
    metadata
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Untitled")
        .to_string()
}

/// Split YAML frontmatter off the document. Returns the frontmatter, the
/// body and the 1-based line the body starts on.
fn extract_frontmatter(content: &str) -> (Option<&str>, &str, usize) {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    if let Some(rest) = content.strip_prefix("---\n") {
        if let Some(end) = rest.find("\n---\n") {
            let frontmatter = &rest[..end];
            let body = &rest[end + 5..];
            let body_line = frontmatter.lines().count() + 3;
            return (Some(frontmatter), body, body_line);
        }
    }
    (None, content, 1)
}

/// Parse frontmatter YAML into metadata
fn parse_frontmatter(frontmatter: Option<&str>) -> DocumentMetadata {
    let mut metadata = DocumentMetadata::default();

    let Some(fm) = frontmatter else {
        return metadata;
    };
    let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(fm) else {
        return metadata;
    };
    let Some(map) = value.as_mapping() else {
        return metadata;
    };

    if let Some(title) = map.get("title").and_then(|v| v.as_str()) {
        metadata.title = Some(title.to_string());
    }

    if let Some(tags) = map.get("tags") {
        if let Some(tag_array) = tags.as_sequence() {
            metadata.tags = tag_array
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect();
        } else if let Some(tag_str) = tags.as_str() {
            // Comma-separated tags
            metadata.tags = tag_str
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    for (key, value) in map.iter() {
        if let (Some(k), Some(v)) = (key.as_str(), value.as_str()) {
            if !matches!(k, "title" | "tags") {
                metadata.custom.insert(k.to_string(), v.to_string());
            }
        }
    }

    metadata
}

/// Walk the Markdown events and group text by heading.
/// Returns the first H1 (if any) and the sections in document order.
fn parse_structure(body: &str, first_line: usize) -> (Option<String>, Vec<Section>) {
    let line_at = |offset: usize| first_line + body[..offset.min(body.len())].matches('\n').count();

    let mut title: Option<String> = None;
    let mut header_stack: Vec<String> = Vec::new();
    let mut sections = Vec::new();
    let mut current_text = String::new();
    let mut section_start: Option<usize> = None;
    let mut section_end = first_line;
    let mut in_heading = false;
    let mut heading_level = 0;
    let mut heading_text = String::new();

    for (event, range) in MarkdownParser::new(body).into_offset_iter() {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                flush_section(
                    &mut sections,
                    &mut current_text,
                    &header_stack,
                    section_start.take(),
                    section_end,
                );
                in_heading = true;
                heading_level = level as usize;
                heading_text.clear();
            }
            Event::End(TagEnd::Heading(_)) if in_heading => {
                in_heading = false;
                let heading = heading_text.trim().to_string();
                header_stack.truncate(heading_level.saturating_sub(1));
                header_stack.push(heading.clone());

                // First H1 becomes the title
                if heading_level == 1 && title.is_none() {
                    title = Some(heading);
                }
            }
            Event::Text(text) | Event::Code(text) => {
                if in_heading {
                    heading_text.push_str(&text);
                } else {
                    section_start.get_or_insert_with(|| line_at(range.start));
                    section_end = line_at(range.end.saturating_sub(1));
                    current_text.push_str(&text);
                }
            }
            Event::SoftBreak | Event::HardBreak if !in_heading => {
                current_text.push('\n');
            }
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Item)
            | Event::End(TagEnd::CodeBlock) => {
                current_text.push_str("\n\n");
            }
            _ => {}
        }
    }

    flush_section(
        &mut sections,
        &mut current_text,
        &header_stack,
        section_start,
        section_end,
    );
    (title, sections)
}

fn flush_section(
    sections: &mut Vec<Section>,
    text: &mut String,
    header_stack: &[String],
    start_line: Option<usize>,
    end_line: usize,
) {
    let trimmed = text.trim();
    if let Some(start_line) = start_line {
        if !trimmed.is_empty() {
            sections.push(Section {
                text: trimmed.to_string(),
                context: header_stack.join(" > "),
                start_line,
                end_line: end_line.max(start_line),
            });
        }
    }
    text.clear();
}
