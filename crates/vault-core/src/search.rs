//! Keyword and regex search over cached documents.

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::cache::Document;

/// Maximum number of matching lines reported per document.
pub const MAX_CONTEXT_LINES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    /// Owner-relative path.
    pub path: String,
    /// Matching lines as `"<line number>: <line>"`.
    pub context: Vec<String>,
}

enum Matcher {
    Keywords(Vec<String>),
    Pattern(Regex),
}

impl Matcher {
    fn parse(query: &str, regex: bool) -> Option<Self> {
        if regex {
            return match Regex::new(query) {
                Ok(re) => Some(Matcher::Pattern(re)),
                Err(e) => {
                    debug!("Ignoring invalid search pattern {:?}: {}", query, e);
                    None
                }
            };
        }

        let keywords: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if keywords.is_empty() {
            None
        } else {
            Some(Matcher::Keywords(keywords))
        }
    }

    fn matches_document(&self, content: &str) -> bool {
        match self {
            Matcher::Keywords(keywords) => {
                let lower = content.to_lowercase();
                keywords.iter().all(|keyword| lower.contains(keyword.as_str()))
            }
            Matcher::Pattern(re) => re.is_match(content),
        }
    }

    fn matches_line(&self, line: &str) -> bool {
        match self {
            Matcher::Keywords(keywords) => {
                let lower = line.to_lowercase();
                keywords.iter().any(|keyword| lower.contains(keyword.as_str()))
            }
            Matcher::Pattern(re) => re.is_match(line),
        }
    }
}

/// Search `documents` for `query`.
///
/// Keyword mode requires every whitespace-separated keyword to occur somewhere in
/// the document (case-insensitive). Regex mode matches the pattern against the
/// whole content. An empty query or invalid pattern finds nothing.
pub fn search<'a, I>(documents: I, query: &str, regex: bool) -> Vec<SearchHit>
where
    I: IntoIterator<Item = &'a Document>,
{
    let Some(matcher) = Matcher::parse(query, regex) else {
        return Vec::new();
    };

    let mut hits: Vec<SearchHit> = documents
        .into_iter()
        .filter(|doc| matcher.matches_document(&doc.content))
        .map(|doc| SearchHit {
            path: doc.path.relative().to_string(),
            context: context_lines(&doc.content, &matcher),
        })
        .collect();
    hits.sort_by(|a, b| a.path.cmp(&b.path));
    hits
}

fn context_lines(content: &str, matcher: &Matcher) -> Vec<String> {
    content
        .split('\n')
        .enumerate()
        .filter(|(_, line)| matcher.matches_line(line))
        .take(MAX_CONTEXT_LINES)
        .map(|(index, line)| format!("{}: {}", index + 1, line))
        .collect()
}
