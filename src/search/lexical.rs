//! Lexical matching
//!
//! A query matches a node when its phrase occurs in one of the text fields,
//! when some query token matches a field token within the fuzzy tolerance, or,
//! in regex mode, when the expression matches a field. Scores are in `(0, 1]`:
//! field weight (relative to the heaviest field) times query coverage.

use super::models::MatchedRange;
use crate::error::CoreError;
use crate::neo4j::models::{props, GraphNode};
use regex::{Regex, RegexBuilder};

/// Text fields searched, with their weight
const FIELD_WEIGHTS: &[(&str, f64)] = &[
    (props::NAME, 3.0),
    (props::TITLE, 3.0),
    (props::SIGNATURE, 2.0),
    (props::FILE_PATH, 1.5),
    (props::DESCRIPTION, 1.5),
    (props::CONTENT, 1.0),
];
const MAX_WEIGHT: f64 = 3.0;

/// Credit of a fuzzy token match relative to an exact one
const FUZZY_CREDIT: f64 = 0.8;

/// Tokens shorter than this only match exactly
const MIN_FUZZY_LEN: usize = 3;

pub const MAX_FUZZY_DISTANCE: u8 = 2;

/// Lowercased alphanumeric tokens (`_` counts as alphanumeric)
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whether two lowercased tokens match within `max_distance` edits.
/// Exact containment always matches.
pub fn fuzzy_token_match(query_token: &str, text_token: &str, max_distance: u8) -> bool {
    if text_token.contains(query_token) {
        return true;
    }
    if max_distance == 0 || query_token.chars().count() < MIN_FUZZY_LEN {
        return false;
    }
    let d = max_distance as usize;
    if query_token.chars().count().abs_diff(text_token.chars().count()) > d {
        return false;
    }
    strsim::levenshtein(query_token, text_token) <= d
}

enum Mode {
    Plain {
        phrase: String,
        tokens: Vec<String>,
        fuzzy: u8,
    },
    Regex(Regex),
}

/// Compiled lexical query.
pub struct LexicalMatcher {
    mode: Mode,
    context_lines: usize,
}

impl LexicalMatcher {
    pub fn new(
        query: &str,
        regex: bool,
        fuzzy_distance: u8,
        context_lines: usize,
    ) -> Result<Self, CoreError> {
        if fuzzy_distance > MAX_FUZZY_DISTANCE {
            return Err(CoreError::InvalidQuery(format!(
                "fuzzy distance must be 0, 1 or 2, got {}",
                fuzzy_distance
            )));
        }
        let query = query.trim();
        if query.is_empty() {
            return Err(CoreError::InvalidQuery("empty query".into()));
        }

        let mode = if regex {
            let re = RegexBuilder::new(query)
                .case_insensitive(true)
                .size_limit(1 << 20)
                .build()
                .map_err(|e| CoreError::InvalidQuery(format!("bad regex: {}", e)))?;
            Mode::Regex(re)
        } else {
            let tokens = tokenize(query);
            if tokens.is_empty() {
                return Err(CoreError::InvalidQuery(
                    "query has no searchable characters".into(),
                ));
            }
            Mode::Plain {
                phrase: query.to_lowercase(),
                tokens,
                fuzzy: fuzzy_distance,
            }
        };
        Ok(Self {
            mode,
            context_lines,
        })
    }

    /// Lowercased substrings such that every node this matcher scores holds
    /// at least one of them in a text field. `None` in regex mode.
    ///
    /// A token within `d` edits of a text token keeps one of its `d + 1`
    /// contiguous pieces intact, so fuzzy tokens contribute their pieces.
    pub fn prefilter_terms(&self) -> Option<Vec<String>> {
        let Mode::Plain { tokens, fuzzy, .. } = &self.mode else {
            return None;
        };
        let mut terms = Vec::new();
        for token in tokens {
            let chars: Vec<char> = token.chars().collect();
            if *fuzzy == 0 || chars.len() < MIN_FUZZY_LEN {
                terms.push(token.clone());
                continue;
            }
            let pieces = *fuzzy as usize + 1;
            let (base, extra) = (chars.len() / pieces, chars.len() % pieces);
            let mut start = 0;
            for i in 0..pieces {
                let len = base + usize::from(i < extra);
                terms.push(chars[start..start + len].iter().collect());
                start += len;
            }
        }
        terms.sort();
        terms.dedup();
        Some(terms)
    }

    /// Score a node, `None` when nothing matches.
    pub fn score(&self, node: &GraphNode) -> Option<(f64, Option<MatchedRange>)> {
        let mut best: Option<f64> = None;
        let mut content_line: Option<usize> = None;

        for (field, weight) in FIELD_WEIGHTS {
            let Some(text) = node.text(field) else {
                continue;
            };
            let Some((coverage, line)) = self.match_field(text) else {
                continue;
            };
            let score = weight / MAX_WEIGHT * coverage;
            if best.map_or(true, |b| score > b) {
                best = Some(score);
            }
            if *field == props::CONTENT {
                content_line = line;
            }
        }

        let score = best?;
        let range = content_line.and_then(|line| self.matched_range(node, line));
        Some((score, range))
    }

    /// Coverage in `(0, 1]` and the 0-based line of the first hit.
    fn match_field(&self, text: &str) -> Option<(f64, Option<usize>)> {
        match &self.mode {
            Mode::Regex(re) => {
                let m = re.find(text)?;
                Some((1.0, Some(line_of(text, m.start()))))
            }
            Mode::Plain {
                phrase,
                tokens,
                fuzzy,
            } => {
                let lower = text.to_lowercase();
                if let Some(pos) = lower.find(phrase.as_str()) {
                    return Some((1.0, Some(line_of(&lower, pos))));
                }

                let mut credit = 0.0;
                let mut first_line: Option<usize> = None;
                for query_token in tokens {
                    let mut token_credit: f64 = 0.0;
                    for (line_idx, line) in lower.lines().enumerate() {
                        for text_token in tokenize(line) {
                            let c = if text_token.contains(query_token.as_str()) {
                                1.0
                            } else if fuzzy_token_match(query_token, &text_token, *fuzzy) {
                                FUZZY_CREDIT
                            } else {
                                continue;
                            };
                            if c > token_credit {
                                token_credit = c;
                            }
                            first_line = Some(first_line.map_or(line_idx, |l| l.min(line_idx)));
                        }
                        if token_credit >= 1.0 {
                            break;
                        }
                    }
                    credit += token_credit;
                }
                (credit > 0.0).then(|| (credit / tokens.len() as f64, first_line))
            }
        }
    }

    fn matched_range(&self, node: &GraphNode, line: usize) -> Option<MatchedRange> {
        let content = node.text(props::CONTENT)?;
        let lines: Vec<&str> = content.lines().collect();
        if lines.is_empty() {
            return None;
        }
        let line = line.min(lines.len() - 1);
        let from = line.saturating_sub(self.context_lines);
        let to = (line + self.context_lines).min(lines.len() - 1);
        let base = node.start_line().unwrap_or(1);
        Some(MatchedRange {
            start_line: base + from as u64,
            end_line: base + to as u64,
            text: lines[from..=to].join("\n"),
        })
    }
}

fn line_of(text: &str, byte_offset: usize) -> usize {
    text[..byte_offset.min(text.len())]
        .bytes()
        .filter(|b| *b == b'\n')
        .count()
}
