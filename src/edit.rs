//! Fuzzy text replacement for file edits
//!
//! An edit names the text to replace as the caller remembers it, which often
//! differs from the file in whitespace or indentation. Matching runs an
//! ordered chain of strategies and the first one that finds the text wins:
//!
//! 1. exact substring
//! 2. line-trimmed: same lines, trailing whitespace ignored
//! 3. block anchor: first and last lines match exactly (trimmed), the lines
//!    in between are similar enough by Levenshtein ratio
//! 4. whitespace-normalized: runs of whitespace compare equal
//! 5. indentation-flexible: same lines after removing common indentation
//!
//! [`FileEditor`] applies the edit on disk, hands the change to the
//! ingestion queue before returning and then publishes a `FileModified`
//! event. Re-ingestion itself happens asynchronously, but a search issued
//! after the edit returns already sees it as pending work.

use crate::events::{EventBus, EventEmitter, GraphEvent};
use crate::ingest::{ChangeEvent, ChangeType, IngestionQueue};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Mean Levenshtein ratio the inner lines of a block-anchor match need
const BLOCK_SIMILARITY: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    LineTrimmed,
    BlockAnchor,
    WhitespaceNormalized,
    IndentationFlexible,
}

type StrategyFn = fn(&str, &str) -> Option<Range<usize>>;

/// The chain, in order
pub const STRATEGIES: [(MatchStrategy, StrategyFn); 5] = [
    (MatchStrategy::Exact, exact),
    (MatchStrategy::LineTrimmed, line_trimmed),
    (MatchStrategy::BlockAnchor, block_anchor),
    (MatchStrategy::WhitespaceNormalized, whitespace_normalized),
    (MatchStrategy::IndentationFlexible, indentation_flexible),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditMatch {
    /// Byte range in the searched content
    pub range: Range<usize>,
    pub strategy: MatchStrategy,
}

/// Run the chain; `None` when no strategy finds `search`.
pub fn find_match(content: &str, search: &str) -> Option<EditMatch> {
    if search.trim().is_empty() {
        return None;
    }
    STRATEGIES.iter().find_map(|(strategy, f)| {
        f(content, search).map(|range| EditMatch {
            range,
            strategy: *strategy,
        })
    })
}

pub fn exact(content: &str, search: &str) -> Option<Range<usize>> {
    content.find(search).map(|pos| pos..pos + search.len())
}

/// Byte spans of each line, newline excluded
fn line_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            spans.push(start..i);
            start = i + 1;
        }
    }
    if start < text.len() {
        spans.push(start..text.len());
    }
    spans
}

fn search_lines(search: &str) -> Vec<&str> {
    search.trim_end_matches(['\n', '\r']).lines().collect()
}

/// First window of `content` lines where `eq` holds for every line pair
fn find_line_window<F>(content: &str, search: &str, eq: F) -> Option<Range<usize>>
where
    F: Fn(&[&str], &[&str]) -> bool,
{
    let needle = search_lines(search);
    let spans = line_spans(content);
    if needle.is_empty() || spans.len() < needle.len() {
        return None;
    }
    (0..=spans.len() - needle.len()).find_map(|i| {
        let window: Vec<&str> = spans[i..i + needle.len()]
            .iter()
            .map(|s| &content[s.clone()])
            .collect();
        eq(&window, &needle).then(|| spans[i].start..spans[i + needle.len() - 1].end)
    })
}

pub fn line_trimmed(content: &str, search: &str) -> Option<Range<usize>> {
    find_line_window(content, search, |window, needle| {
        window
            .iter()
            .zip(needle)
            .all(|(a, b)| a.trim_end() == b.trim_end())
    })
}

pub fn block_anchor(content: &str, search: &str) -> Option<Range<usize>> {
    let needle = search_lines(search);
    let n = needle.len();
    if n < 3 {
        return None;
    }
    let spans = line_spans(content);
    if spans.len() < n {
        return None;
    }
    let line = |i: usize| content[spans[i].clone()].trim();

    let mut best: Option<(f64, Range<usize>)> = None;
    for i in 0..=spans.len() - n {
        if line(i) != needle[0].trim() || line(i + n - 1) != needle[n - 1].trim() {
            continue;
        }
        let inner = &needle[1..n - 1];
        let similarity = inner
            .iter()
            .enumerate()
            .map(|(k, l)| strsim::normalized_levenshtein(line(i + 1 + k), l.trim()))
            .sum::<f64>()
            / inner.len() as f64;
        if similarity >= BLOCK_SIMILARITY && best.as_ref().map_or(true, |(s, _)| similarity > *s) {
            best = Some((similarity, spans[i].start..spans[i + n - 1].end));
        }
    }
    best.map(|(_, range)| range)
}

/// Collapse whitespace runs to one space, keeping for every output byte the
/// source byte range of the character it came from.
fn normalize_with_map(text: &str) -> (String, Vec<Range<usize>>) {
    let mut out = String::with_capacity(text.len());
    let mut map = Vec::with_capacity(text.len());
    let mut in_space = false;
    for (idx, ch) in text.char_indices() {
        let span = idx..idx + ch.len_utf8();
        if ch.is_whitespace() {
            if !in_space {
                out.push(' ');
                map.push(span);
            }
            in_space = true;
        } else {
            in_space = false;
            out.push(ch);
            for _ in 0..ch.len_utf8() {
                map.push(span.clone());
            }
        }
    }
    (out, map)
}

pub fn whitespace_normalized(content: &str, search: &str) -> Option<Range<usize>> {
    let (needle, _) = normalize_with_map(search.trim());
    if needle.is_empty() {
        return None;
    }
    let (haystack, map) = normalize_with_map(content);
    let pos = haystack.find(&needle)?;
    let last = pos + needle.len() - 1;
    Some(map[pos].start..map[last].end)
}

fn indent_width(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn min_indent(lines: &[&str]) -> usize {
    lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| indent_width(l))
        .min()
        .unwrap_or(0)
}

fn dedent(lines: &[&str]) -> Vec<String> {
    let min = min_indent(lines);
    lines
        .iter()
        .map(|l| l.get(min..).unwrap_or_else(|| l.trim_start()).trim_end().to_string())
        .collect()
}

pub fn indentation_flexible(content: &str, search: &str) -> Option<Range<usize>> {
    find_line_window(content, search, |window, needle| dedent(window) == dedent(needle))
}

/// Shift `replacement` from the indentation of `search` to the indentation
/// of the matched block.
fn reindent(replacement: &str, search: &str, matched: &str) -> String {
    let needle = search_lines(search);
    let matched_lines: Vec<&str> = matched.lines().collect();
    let from = min_indent(&needle);
    let to_width = min_indent(&matched_lines);
    let to = matched_lines
        .iter()
        .find(|l| !l.trim().is_empty() && indent_width(l) == to_width)
        .map(|l| &l[..to_width])
        .unwrap_or("");

    replacement
        .lines()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                let body = line.get(from..).filter(|_| indent_width(line) >= from);
                format!("{}{}", to, body.unwrap_or_else(|| line.trim_start()))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Replace `search` with `replacement` in `content`. An exact search text
/// occurring more than once is ambiguous and rejected.
pub fn apply_edit(content: &str, search: &str, replacement: &str) -> Result<(String, EditMatch)> {
    let Some(found) = find_match(content, search) else {
        bail!("text to replace was not found");
    };
    if found.strategy == MatchStrategy::Exact && content.matches(search).nth(1).is_some() {
        bail!("text to replace occurs more than once; include more context");
    }

    let matched = &content[found.range.clone()];
    let replacement = match found.strategy {
        MatchStrategy::Exact | MatchStrategy::WhitespaceNormalized => replacement.to_string(),
        _ => reindent(replacement, search, matched),
    };

    let mut edited = String::with_capacity(content.len() + replacement.len());
    edited.push_str(&content[..found.range.start]);
    edited.push_str(&replacement);
    edited.push_str(&content[found.range.end..]);
    Ok((edited, found))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditOutcome {
    pub path: PathBuf,
    pub strategy: MatchStrategy,
    /// 1-based line where the replaced text started
    pub line: usize,
}

/// Applies edits to files, queues them for ingestion and announces them on
/// the event bus.
pub struct FileEditor {
    events: EventBus,
    queue: Option<Arc<IngestionQueue>>,
}

impl FileEditor {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            queue: None,
        }
    }

    pub fn with_queue(mut self, queue: Arc<IngestionQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Queue the change, if there is a queue, then publish it.
    fn announce(&self, path: &Path, change_type: ChangeType) {
        let event = GraphEvent::file_modified(path, change_type);
        match &self.queue {
            Some(queue) => {
                queue.enqueue(ChangeEvent::new(path, change_type));
                self.events.emit(event.already_queued());
            }
            None => self.events.emit(event),
        }
    }

    /// Replace text in a file. Returns once the file is written and queued;
    /// the graph catches up through the ingestion queue.
    pub async fn replace(&self, path: &Path, search: &str, replacement: &str) -> Result<EditOutcome> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let (edited, found) = apply_edit(&content, search, replacement)
            .with_context(|| format!("Cannot edit {}", path.display()))?;
        tokio::fs::write(path, edited)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        let line = content[..found.range.start].matches('\n').count() + 1;
        debug!(path = %path.display(), strategy = ?found.strategy, line, "File edited");
        self.announce(path, ChangeType::Updated);
        Ok(EditOutcome {
            path: path.to_path_buf(),
            strategy: found.strategy,
            line,
        })
    }

    /// Create or overwrite a whole file.
    pub async fn write(&self, path: &Path, content: &str) -> Result<()> {
        let existed = tokio::fs::try_exists(path).await.unwrap_or(false);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        let change_type = if existed {
            ChangeType::Updated
        } else {
            ChangeType::Created
        };
        self.announce(path, change_type);
        Ok(())
    }
}
